//! rescon relay.
//!
//! A reconnect-tolerant proxy: many short-lived client transports (TCP, or
//! FEC-protected datagrams) are multiplexed onto stable backend
//! connections. A client that loses its transport resumes its session
//! within a bounded reuse window; buffered bytes are replayed so the
//! backend never observes the interruption and no byte is lost or
//! duplicated.
//!
//! ## Architecture
//!
//! - **pool / provider**: weighted backend selection over an atomically
//!   swappable pool snapshot, timed dials, an optional post-dial wrap hook
//! - **session**: the continuity engine: identity table, resend buffer,
//!   detach/resume state machine, reuse-timer expiry
//! - **proxy**: accept loops, resumption handshake, forwarding pumps
//! - **control**: reload/status/terminate over a command channel

pub mod config;
pub mod control;
pub mod pool;
pub mod provider;
pub mod proxy;
pub mod session;

pub use config::Args;
pub use control::{run_control_loop, ControlCommand};
pub use pool::{HostDescriptor, HostEntry, HostPool, PoolError, PoolHandle};
pub use provider::{BackendProvider, ConnWrap, HookAlreadySet, ProvideError};
pub use proxy::{
    handle_transport, run_dgram_listener, run_tcp_listener, RelayContext, RelayStats,
    DEFAULT_HANDSHAKE_TIMEOUT,
};
pub use session::{
    CloseReason, ResendBuffer, ResendError, ResumeOutcome, SessionConfig, SessionState,
    SessionTable,
};
