//! Resend buffer: the per-session record of transmitted-but-unacknowledged
//! bytes.
//!
//! Offsets are cumulative byte counts since session creation. The buffer
//! holds the window `(acknowledged, end]`: everything sent toward the
//! client that the client has not yet confirmed. Cumulative acks trim the
//! left edge; a resuming transport replays the whole remaining window.
//!
//! The window is hard-capped. Running out of room is an error the session
//! layer turns into session death; bytes are never silently dropped.

use std::collections::VecDeque;

use bytes::{Buf, Bytes};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResendError {
    #[error("resend buffer overflow: {needed} bytes needed, {cap} byte cap")]
    Overflow { needed: usize, cap: usize },

    #[error("acknowledgment offset {offset} is beyond end of window {end}")]
    AckBeyondEnd { offset: u64, end: u64 },

    #[error("replay offset {offset} is outside window {start}..={end}")]
    ReplayOutOfRange { offset: u64, start: u64, end: u64 },
}

/// Size-bounded byte window keyed by monotonic send offset.
#[derive(Debug)]
pub struct ResendBuffer {
    cap: usize,
    /// Offset of the first held byte; equals the highest ack seen.
    start: u64,
    /// Offset one past the last held byte; equals total bytes appended.
    end: u64,
    chunks: VecDeque<Bytes>,
    held: usize,
}

impl ResendBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            start: 0,
            end: 0,
            chunks: VecDeque::new(),
            held: 0,
        }
    }

    /// Highest acknowledged offset: bytes at or below it are gone.
    pub fn acknowledged(&self) -> u64 {
        self.start
    }

    /// Total bytes ever appended; the next append starts here.
    pub fn end_offset(&self) -> u64 {
        self.end
    }

    /// Bytes currently held.
    pub fn held(&self) -> usize {
        self.held
    }

    /// True when `offset` can serve as a resumption point.
    pub fn covers(&self, offset: u64) -> bool {
        self.start <= offset && offset <= self.end
    }

    /// Appends bytes at the current end offset.
    pub fn append(&mut self, chunk: Bytes) -> Result<(), ResendError> {
        let needed = self.held + chunk.len();
        if needed > self.cap {
            return Err(ResendError::Overflow {
                needed,
                cap: self.cap,
            });
        }
        self.end += chunk.len() as u64;
        self.held = needed;
        if !chunk.is_empty() {
            self.chunks.push_back(chunk);
        }
        Ok(())
    }

    /// Trims everything at or below `offset`. Stale (already-trimmed)
    /// offsets are a no-op, matching cumulative-ack semantics.
    pub fn ack_to(&mut self, offset: u64) -> Result<(), ResendError> {
        if offset <= self.start {
            return Ok(());
        }
        if offset > self.end {
            return Err(ResendError::AckBeyondEnd {
                offset,
                end: self.end,
            });
        }

        let mut to_trim = (offset - self.start) as usize;
        while to_trim > 0 {
            let front = self
                .chunks
                .front_mut()
                .expect("held bytes imply a front chunk");
            if front.len() <= to_trim {
                to_trim -= front.len();
                self.held -= front.len();
                self.chunks.pop_front();
            } else {
                front.advance(to_trim);
                self.held -= to_trim;
                to_trim = 0;
            }
        }
        self.start = offset;
        Ok(())
    }

    /// Everything above `offset`, in order, as cheap sub-slices.
    pub fn replay_from(&self, offset: u64) -> Result<Vec<Bytes>, ResendError> {
        if !self.covers(offset) {
            return Err(ResendError::ReplayOutOfRange {
                offset,
                start: self.start,
                end: self.end,
            });
        }

        let mut skip = (offset - self.start) as usize;
        let mut out = Vec::new();
        for chunk in &self.chunks {
            if skip >= chunk.len() {
                skip -= chunk.len();
                continue;
            }
            out.push(chunk.slice(skip..));
            skip = 0;
        }
        Ok(out)
    }
}
