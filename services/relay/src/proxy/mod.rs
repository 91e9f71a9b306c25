//! Client-facing side: listeners, handshake handling, forwarding pumps.

mod listener;
mod pump;

pub use listener::{
    handle_transport, run_dgram_listener, run_tcp_listener, RelayContext, RelayStats,
    DEFAULT_HANDSHAKE_TIMEOUT,
};
pub use pump::{run_downlink, run_uplink, run_writer, ACK_THRESHOLD};
