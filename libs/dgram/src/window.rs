//! Send-window and reassembly state.
//!
//! [`SendWindow`] is the go-back-N send side: a bounded queue of
//! transmitted-but-unacknowledged segments, trimmed by cumulative acks and
//! retransmitted wholesale when the oldest entry times out.
//!
//! [`Reassembly`] is the receive side: out-of-order segments are parked in
//! a bounded map and drained in sequence order; its cumulative position is
//! what gets acknowledged back to the peer.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::segment::{seq_le, SegKind};

/// One in-flight data-bearing segment.
#[derive(Debug, Clone)]
pub(crate) struct InFlight {
    pub seq: u32,
    pub kind: SegKind,
    pub payload: Bytes,
    pub sent_at: Instant,
    pub tx_count: u32,
}

/// Go-back-N send window.
#[derive(Debug)]
pub(crate) struct SendWindow {
    next_seq: u32,
    cap: usize,
    entries: VecDeque<InFlight>,
}

impl SendWindow {
    pub fn new(cap: usize) -> Self {
        Self {
            next_seq: 1,
            cap,
            entries: VecDeque::with_capacity(cap),
        }
    }

    pub fn can_send(&self) -> bool {
        self.entries.len() < self.cap
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Claims the next sequence number and records the segment as in flight.
    pub fn push(&mut self, kind: SegKind, payload: Bytes, now: Instant) -> u32 {
        debug_assert!(self.can_send());
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.entries.push_back(InFlight {
            seq,
            kind,
            payload,
            sent_at: now,
            tx_count: 1,
        });
        seq
    }

    /// Drops every entry covered by the cumulative ack. Returns how many
    /// were released.
    pub fn ack(&mut self, upto: u32) -> usize {
        let before = self.entries.len();
        while let Some(front) = self.entries.front() {
            if seq_le(front.seq, upto) {
                self.entries.pop_front();
            } else {
                break;
            }
        }
        before - self.entries.len()
    }

    /// True when the oldest unacknowledged segment has waited at least
    /// `rto` since its last transmission.
    pub fn timed_out(&self, rto: Duration, now: Instant) -> bool {
        self.entries
            .front()
            .is_some_and(|e| now.duration_since(e.sent_at) >= rto)
    }

    /// Marks every in-flight segment as retransmitted now and hands the
    /// caller the list to put back on the wire. Returns the highest
    /// transmission count seen, for give-up decisions.
    pub fn mark_retransmit(&mut self, now: Instant) -> (Vec<InFlight>, u32) {
        let mut max_tx = 0;
        for entry in &mut self.entries {
            entry.sent_at = now;
            entry.tx_count += 1;
            max_tx = max_tx.max(entry.tx_count);
        }
        (self.entries.iter().cloned().collect(), max_tx)
    }
}

/// Receive-side reordering buffer with cumulative delivery.
#[derive(Debug)]
pub(crate) struct Reassembly {
    next: u32,
    parked: BTreeMap<u32, (SegKind, Bytes)>,
    cap: usize,
}

impl Reassembly {
    pub fn new(cap: usize) -> Self {
        Self {
            next: 1,
            parked: BTreeMap::new(),
            cap,
        }
    }

    /// Highest sequence received in order; what we acknowledge.
    pub fn cumulative(&self) -> u32 {
        self.next.wrapping_sub(1)
    }

    /// True if the segment is a duplicate of something already delivered
    /// or already parked.
    pub fn is_duplicate(&self, seq: u32) -> bool {
        !seq_le(self.next, seq) || self.parked.contains_key(&seq)
    }

    /// Accepts a segment and returns everything now deliverable in order.
    /// Out-of-window and duplicate segments are dropped silently (the
    /// cumulative ack re-sent by the caller covers them).
    pub fn insert(&mut self, seq: u32, kind: SegKind, payload: Bytes) -> Vec<(SegKind, Bytes)> {
        if self.is_duplicate(seq) {
            return Vec::new();
        }
        // The in-order segment always fits; only out-of-order parking is
        // bounded.
        if seq != self.next && self.parked.len() >= self.cap {
            return Vec::new();
        }
        self.parked.insert(seq, (kind, payload));

        let mut ready = Vec::new();
        while let Some(entry) = self.parked.remove(&self.next) {
            self.next = self.next.wrapping_add(1);
            ready.push(entry);
        }
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &'static [u8]) -> Bytes {
        Bytes::from_static(s)
    }

    #[test]
    fn window_push_and_cumulative_ack() {
        let now = Instant::now();
        let mut w = SendWindow::new(4);
        assert_eq!(w.push(SegKind::Data, b(b"a"), now), 1);
        assert_eq!(w.push(SegKind::Data, b(b"b"), now), 2);
        assert_eq!(w.push(SegKind::Data, b(b"c"), now), 3);

        assert_eq!(w.ack(2), 2);
        assert!(!w.is_empty());
        assert_eq!(w.ack(3), 1);
        assert!(w.is_empty());
        // Stale ack is a no-op.
        assert_eq!(w.ack(1), 0);
    }

    #[test]
    fn window_fills_and_frees() {
        let now = Instant::now();
        let mut w = SendWindow::new(2);
        w.push(SegKind::Data, b(b"a"), now);
        w.push(SegKind::Data, b(b"b"), now);
        assert!(!w.can_send());
        w.ack(1);
        assert!(w.can_send());
    }

    #[test]
    fn retransmit_marks_every_entry() {
        let start = Instant::now();
        let mut w = SendWindow::new(4);
        w.push(SegKind::Data, b(b"a"), start);
        w.push(SegKind::Fin, b(b""), start);

        assert!(!w.timed_out(Duration::from_secs(1), start));
        let later = start + Duration::from_secs(2);
        assert!(w.timed_out(Duration::from_secs(1), later));

        let (resend, max_tx) = w.mark_retransmit(later);
        assert_eq!(resend.len(), 2);
        assert_eq!(max_tx, 2);
        assert_eq!(resend[1].kind, SegKind::Fin);
        assert!(!w.timed_out(Duration::from_secs(1), later));
    }

    #[test]
    fn reassembly_delivers_in_order() {
        let mut r = Reassembly::new(16);
        assert_eq!(r.cumulative(), 0);

        // 2 arrives before 1: parked.
        assert!(r.insert(2, SegKind::Data, b(b"two")).is_empty());
        assert_eq!(r.cumulative(), 0);

        let ready = r.insert(1, SegKind::Data, b(b"one"));
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].1, b(b"one"));
        assert_eq!(ready[1].1, b(b"two"));
        assert_eq!(r.cumulative(), 2);
    }

    #[test]
    fn reassembly_drops_duplicates() {
        let mut r = Reassembly::new(16);
        assert_eq!(r.insert(1, SegKind::Data, b(b"one")).len(), 1);
        assert!(r.insert(1, SegKind::Data, b(b"one")).is_empty());
        assert!(r.insert(3, SegKind::Data, b(b"three")).is_empty());
        assert!(r.insert(3, SegKind::Data, b(b"three")).is_empty());
        assert_eq!(r.cumulative(), 1);
        assert_eq!(r.insert(2, SegKind::Data, b(b"two")).len(), 2);
    }

    #[test]
    fn reassembly_respects_cap() {
        let mut r = Reassembly::new(2);
        assert!(r.insert(3, SegKind::Data, b(b"x")).is_empty());
        assert!(r.insert(5, SegKind::Data, b(b"y")).is_empty());
        // Cap reached: out-of-order segment 7 is shed, not parked.
        assert!(r.insert(7, SegKind::Data, b(b"z")).is_empty());
        let ready = r.insert(1, SegKind::Data, b(b"a"));
        assert_eq!(ready.len(), 1);
    }
}
