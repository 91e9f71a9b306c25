//! Session layer: the continuity engine.
//!
//! A session is one logical client-to-backend conversation. It outlives
//! any single client transport: when the transport drops, the session
//! detaches and waits (bounded) for the client to come back; when the
//! client resumes, buffered backend output is replayed and the
//! conversation continues where it left off. The backend never sees any
//! of this.

pub mod resend;
pub mod table;

pub use resend::{ResendBuffer, ResendError};
pub use table::{
    ClientSink, CloseReason, ResumeOutcome, SessionConfig, SessionSlot, SessionTable,
};

/// Lifecycle of a session record.
///
/// `Pending` (backend dial in flight) → `Attached` (forwarding) →
/// `Detached` (client lost, backend kept, reuse timer running) → `Closed`
/// (terminal; the record is removed). A dead backend closes the session
/// from any live state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Attached,
    Detached,
    Closed,
}
