//! Error type for the session-link codec.

use thiserror::Error;

/// Errors produced while encoding or decoding the session link.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {len} bytes exceeds the {max}-byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("unknown frame type {0:#04x}")]
    UnknownFrame(u8),

    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}

impl WireError {
    /// True when the error indicates the peer went away rather than
    /// misbehaved.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, WireError::Io(_))
    }
}
