//! Reliable ordered byte streams over UDP for rescon.
//!
//! The relay's datagram listener accepts clients on networks where TCP
//! performs poorly. This crate turns lossy datagrams back into the ordered,
//! reliable byte-stream abstraction the session layer expects:
//!
//! - cumulative-ack ARQ with a bounded send window and go-back-N
//!   retransmission on timeout;
//! - optional forward error correction: every `data_shards` data segments
//!   are followed by `parity_shards` interleaved XOR parity segments, so a
//!   single loss per interleave lane is repaired without a retransmit
//!   round-trip;
//! - optional upload coalescing: outgoing bytes are batched until a minimum
//!   packet size accumulates or a maximum delay elapses.
//!
//! [`DgramListener::accept`] and [`connect`] both yield a [`DgramStream`]
//! implementing `AsyncRead + AsyncWrite`, so callers treat it exactly like
//! a `TcpStream`.

mod conn;
mod endpoint;
mod error;
mod fec;
mod segment;
mod window;

pub use conn::DgramStream;
pub use endpoint::{connect, DgramListener};
pub use error::DgramError;

use std::time::Duration;

/// Forward-error-correction group geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FecConfig {
    /// Data segments per group.
    pub data_shards: usize,
    /// Parity segments (interleave lanes) per group.
    pub parity_shards: usize,
}

impl FecConfig {
    /// Validates the geometry: both counts positive, no more lanes than
    /// data segments.
    pub fn validate(&self) -> Result<(), DgramError> {
        if self.data_shards == 0 || self.parity_shards == 0 {
            return Err(DgramError::BadConfig(
                "fec shard counts must both be positive",
            ));
        }
        if self.parity_shards > self.data_shards {
            return Err(DgramError::BadConfig(
                "fec parity shards cannot exceed data shards",
            ));
        }
        Ok(())
    }
}

/// Upload coalescing tuning. `min_packet == 0` disables coalescing: bytes
/// are segmented as soon as they arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoalesceConfig {
    /// Hold outgoing bytes until at least this many are staged.
    pub min_packet: usize,
    /// Never hold a byte longer than this.
    pub max_delay: Duration,
}

impl Default for CoalesceConfig {
    fn default() -> Self {
        Self {
            min_packet: 0,
            max_delay: Duration::from_millis(0),
        }
    }
}

/// Transport configuration shared by listener and connector.
#[derive(Debug, Clone, Copy)]
pub struct DgramConfig {
    /// FEC geometry; `None` disables parity segments.
    pub fec: Option<FecConfig>,
    /// Upload coalescing tuning.
    pub coalesce: CoalesceConfig,
    /// Maximum in-flight data segments per direction.
    pub window: usize,
    /// Retransmission timeout for the oldest unacknowledged segment.
    pub rto: Duration,
}

impl Default for DgramConfig {
    fn default() -> Self {
        Self {
            fec: None,
            coalesce: CoalesceConfig::default(),
            window: 256,
            rto: Duration::from_millis(200),
        }
    }
}

impl DgramConfig {
    pub fn validate(&self) -> Result<(), DgramError> {
        if self.window == 0 {
            return Err(DgramError::BadConfig("window must be positive"));
        }
        if let Some(fec) = &self.fec {
            fec.validate()?;
        }
        Ok(())
    }
}
