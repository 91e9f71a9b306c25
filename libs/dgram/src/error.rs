//! Error type for the datagram transport.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DgramError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    BadConfig(&'static str),

    #[error("malformed segment: {0}")]
    Malformed(&'static str),

    #[error("connect timed out after {0} attempts")]
    ConnectTimeout(u32),
}

impl From<DgramError> for std::io::Error {
    fn from(err: DgramError) -> Self {
        match err {
            DgramError::Io(e) => e,
            DgramError::ConnectTimeout(_) => {
                std::io::Error::new(std::io::ErrorKind::TimedOut, err.to_string())
            }
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other.to_string()),
        }
    }
}
