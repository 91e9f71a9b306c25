//! Session-link wire contract for rescon.
//!
//! Everything that rides on top of an established client transport lives
//! here: the session identity type, the resumption handshake exchanged on
//! every new transport connection, and the framed codec used for the rest
//! of the connection's lifetime.
//!
//! The codec assumes an ordered, reliable byte stream underneath. Both
//! transport kinds the relay accepts (TCP, FEC-protected datagram) provide
//! that abstraction.

mod error;
mod frame;
mod id;

pub use error::WireError;
pub use frame::{Frame, FrameReader, FrameWriter, Hello, Welcome, MAX_FRAME_SIZE, MAX_PAYLOAD};
pub use id::SessionId;
