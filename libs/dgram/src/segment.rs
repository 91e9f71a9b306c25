//! Datagram segment encoding.
//!
//! One segment per UDP datagram. Fixed header, little-endian:
//!
//! ```text
//! [conn: u32] [kind: u8] [seq: u32] [ack: u32] [len: u16] [payload]
//! ```
//!
//! `seq` numbers data-bearing segments (`Data` and `Fin`) per direction,
//! starting at 1. `ack` is the cumulative highest in-order sequence the
//! sender has received. For `Parity` segments `seq` is the first data
//! sequence of the covered group.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::DgramError;

pub(crate) const HEADER_LEN: usize = 15;

/// Largest payload per segment, sized to stay under a conservative MTU.
pub(crate) const MAX_SEG_PAYLOAD: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SegKind {
    Syn,
    SynAck,
    Data,
    Ack,
    Fin,
    Parity,
}

impl SegKind {
    fn to_byte(self) -> u8 {
        match self {
            SegKind::Syn => 1,
            SegKind::SynAck => 2,
            SegKind::Data => 3,
            SegKind::Ack => 4,
            SegKind::Fin => 5,
            SegKind::Parity => 6,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(SegKind::Syn),
            2 => Some(SegKind::SynAck),
            3 => Some(SegKind::Data),
            4 => Some(SegKind::Ack),
            5 => Some(SegKind::Fin),
            6 => Some(SegKind::Parity),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Segment {
    pub conn: u32,
    pub kind: SegKind,
    pub seq: u32,
    pub ack: u32,
    pub payload: Bytes,
}

impl Segment {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u32_le(self.conn);
        buf.put_u8(self.kind.to_byte());
        buf.put_u32_le(self.seq);
        buf.put_u32_le(self.ack);
        buf.put_u16_le(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(mut datagram: Bytes) -> Result<Self, DgramError> {
        if datagram.len() < HEADER_LEN {
            return Err(DgramError::Malformed("short header"));
        }
        let conn = datagram.get_u32_le();
        let kind =
            SegKind::from_byte(datagram.get_u8()).ok_or(DgramError::Malformed("unknown kind"))?;
        let seq = datagram.get_u32_le();
        let ack = datagram.get_u32_le();
        let len = datagram.get_u16_le() as usize;
        if datagram.remaining() != len {
            return Err(DgramError::Malformed("length mismatch"));
        }
        Ok(Self {
            conn,
            kind,
            seq,
            ack,
            payload: datagram,
        })
    }
}

/// Returns `true` when `a <= b` in wrap-around sequence space. Valid while
/// the two values are less than `u32::MAX / 2` apart, which any bounded
/// window guarantees.
#[inline]
pub(crate) fn seq_le(a: u32, b: u32) -> bool {
    b.wrapping_sub(a) < u32::MAX / 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let seg = Segment {
            conn: 0xdead_beef,
            kind: SegKind::Data,
            seq: 17,
            ack: 9,
            payload: Bytes::from_static(b"payload bytes"),
        };
        let decoded = Segment::decode(seg.encode()).unwrap();
        assert_eq!(decoded, seg);
    }

    #[test]
    fn rejects_short_and_mismatched() {
        assert!(Segment::decode(Bytes::from_static(&[0u8; 5])).is_err());

        let seg = Segment {
            conn: 1,
            kind: SegKind::Ack,
            seq: 0,
            ack: 3,
            payload: Bytes::new(),
        };
        let mut raw = BytesMut::from(&seg.encode()[..]);
        raw.put_u8(0xff); // trailing garbage not covered by len
        assert!(Segment::decode(raw.freeze()).is_err());
    }

    #[test]
    fn rejects_unknown_kind() {
        let seg = Segment {
            conn: 1,
            kind: SegKind::Data,
            seq: 1,
            ack: 0,
            payload: Bytes::new(),
        };
        let mut raw = BytesMut::from(&seg.encode()[..]);
        raw[4] = 0x2a;
        assert!(Segment::decode(raw.freeze()).is_err());
    }

    #[test]
    fn wrapping_compare() {
        assert!(seq_le(1, 2));
        assert!(seq_le(5, 5));
        assert!(!seq_le(3, 2));
        assert!(seq_le(u32::MAX - 1, 2)); // across the wrap
    }
}
