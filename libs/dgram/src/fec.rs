//! Interleaved XOR forward error correction.
//!
//! The sender groups consecutive data segments into groups of
//! `data_shards`. Within a group, segment `i` belongs to interleave lane
//! `i % parity_shards`; when the group completes, one XOR parity segment
//! per lane is emitted. The receiver can rebuild at most one lost data
//! segment per lane per group without waiting for a retransmission.
//!
//! Each segment contributes its length-prefixed payload, zero-padded to a
//! fixed width, to its lane accumulator, so the reconstructed bytes carry
//! their own length.

use std::collections::{BTreeMap, HashMap};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::segment::MAX_SEG_PAYLOAD;
use crate::FecConfig;

/// Width of one padded shard: 2-byte length prefix plus the maximum
/// payload.
const SHARD_WIDTH: usize = 2 + MAX_SEG_PAYLOAD;

/// Groups kept around for late parity/data arrivals before being pruned.
const KEEP_GROUPS: u32 = 8;

/// XOR `src`'s length-prefixed padded form into `acc`.
fn xor_into(acc: &mut [u8], src: &[u8]) {
    debug_assert!(src.len() <= MAX_SEG_PAYLOAD);
    let mut prefixed = [0u8; 2];
    prefixed.copy_from_slice(&(src.len() as u16).to_le_bytes());
    acc[0] ^= prefixed[0];
    acc[1] ^= prefixed[1];
    for (a, b) in acc[2..].iter_mut().zip(src.iter()) {
        *a ^= b;
    }
}

/// A parity block ready to be put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ParityBlock {
    /// First data sequence of the covered group.
    pub group_start: u32,
    /// Interleave lane within the group.
    pub lane: u8,
    /// Data segments in the group.
    pub span: u8,
    /// XOR accumulator over the lane's padded shards.
    pub bytes: Bytes,
}

impl ParityBlock {
    /// Wire payload: `[lane: u8] [span: u8] [accumulator]`.
    pub fn encode_payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 + self.bytes.len());
        buf.put_u8(self.lane);
        buf.put_u8(self.span);
        buf.put_slice(&self.bytes);
        buf.freeze()
    }

    /// Parses a parity segment payload (`seq` field carries `group_start`).
    pub fn decode_payload(group_start: u32, mut payload: Bytes) -> Option<Self> {
        if payload.len() != 2 + SHARD_WIDTH {
            return None;
        }
        let lane = payload.get_u8();
        let span = payload.get_u8();
        if span == 0 || lane >= span {
            return None;
        }
        Some(Self {
            group_start,
            lane,
            span,
            bytes: payload,
        })
    }
}

/// Send-side group accumulator.
#[derive(Debug)]
pub(crate) struct FecEncoder {
    cfg: FecConfig,
    group_start: u32,
    in_group: usize,
    lanes: Vec<[u8; SHARD_WIDTH]>,
}

impl FecEncoder {
    pub fn new(cfg: FecConfig) -> Self {
        Self {
            cfg,
            group_start: 1,
            in_group: 0,
            lanes: vec![[0u8; SHARD_WIDTH]; cfg.parity_shards],
        }
    }

    /// Feeds one outgoing data segment. When the group completes, returns
    /// the parity blocks to transmit.
    pub fn push(&mut self, seq: u32, payload: &[u8]) -> Vec<ParityBlock> {
        if self.in_group == 0 {
            self.group_start = seq;
        }
        let lane = self.in_group % self.cfg.parity_shards;
        xor_into(&mut self.lanes[lane], payload);
        self.in_group += 1;

        if self.in_group < self.cfg.data_shards {
            return Vec::new();
        }

        let blocks = self
            .lanes
            .iter()
            .enumerate()
            .map(|(lane, acc)| ParityBlock {
                group_start: self.group_start,
                lane: lane as u8,
                span: self.cfg.data_shards as u8,
                bytes: Bytes::copy_from_slice(acc),
            })
            .collect();

        self.in_group = 0;
        for lane in &mut self.lanes {
            lane.fill(0);
        }
        blocks
    }
}

/// Receive-side reconstruction state.
///
/// Keeps the padded shards of recently seen data segments (delivered or
/// not) plus unconsumed parity blocks, bounded to the last [`KEEP_GROUPS`]
/// groups.
#[derive(Debug)]
pub(crate) struct FecDecoder {
    cfg: FecConfig,
    shards: BTreeMap<u32, [u8; SHARD_WIDTH]>,
    parities: HashMap<(u32, u8), ParityBlock>,
    highest_seq: u32,
}

impl FecDecoder {
    pub fn new(cfg: FecConfig) -> Self {
        Self {
            cfg,
            shards: BTreeMap::new(),
            parities: HashMap::new(),
            highest_seq: 0,
        }
    }

    fn prune(&mut self) {
        let horizon = (self.cfg.data_shards as u32).saturating_mul(KEEP_GROUPS);
        let cutoff = self.highest_seq.saturating_sub(horizon);
        self.shards.retain(|&seq, _| seq > cutoff);
        self.parities.retain(|&(start, _), block| {
            start.saturating_add(block.span as u32) > cutoff
        });
    }

    /// Records a received (or reconstructed) data segment, then attempts
    /// any reconstruction its arrival unlocked.
    pub fn observe_data(&mut self, seq: u32, payload: &[u8]) -> Vec<(u32, Bytes)> {
        if self.shards.contains_key(&seq) {
            return Vec::new();
        }
        let mut shard = [0u8; SHARD_WIDTH];
        xor_into(&mut shard, payload);
        self.shards.insert(seq, shard);
        self.highest_seq = self.highest_seq.max(seq);
        self.prune();

        // A late-filled hole may complete a lane whose parity is waiting.
        let keys: Vec<(u32, u8)> = self.parities.keys().copied().collect();
        let mut rebuilt = Vec::new();
        for key in keys {
            if let Some(found) = self.try_reconstruct(key) {
                rebuilt.push(found);
            }
        }
        rebuilt
    }

    /// Records a parity block and attempts reconstruction.
    pub fn observe_parity(&mut self, block: ParityBlock) -> Vec<(u32, Bytes)> {
        let key = (block.group_start, block.lane);
        self.parities.insert(key, block);
        self.try_reconstruct(key).into_iter().collect()
    }

    /// Rebuilds the lane's single missing shard if exactly one is absent.
    /// Consumes the parity block on success.
    fn try_reconstruct(&mut self, key: (u32, u8)) -> Option<(u32, Bytes)> {
        let block = self.parities.get(&key)?;
        let members: Vec<u32> = (0..block.span as u32)
            .filter(|i| (*i as usize) % self.cfg.parity_shards == block.lane as usize)
            .map(|i| block.group_start.wrapping_add(i))
            .collect();

        let missing: Vec<u32> = members
            .iter()
            .copied()
            .filter(|seq| !self.shards.contains_key(seq))
            .collect();
        if missing.len() != 1 {
            if missing.is_empty() {
                self.parities.remove(&key);
            }
            return None;
        }
        let hole = missing[0];

        let mut acc = [0u8; SHARD_WIDTH];
        acc.copy_from_slice(&block.bytes);
        for seq in &members {
            if *seq != hole {
                let shard = &self.shards[seq];
                for (a, b) in acc.iter_mut().zip(shard.iter()) {
                    *a ^= b;
                }
            }
        }

        let len = u16::from_le_bytes([acc[0], acc[1]]) as usize;
        if len > MAX_SEG_PAYLOAD {
            // Corrupt reconstruction; keep the parity for a possible
            // retransmit-filled retry.
            return None;
        }
        let payload = Bytes::copy_from_slice(&acc[2..2 + len]);

        self.parities.remove(&key);
        self.shards.insert(hole, {
            let mut shard = [0u8; SHARD_WIDTH];
            xor_into(&mut shard, &payload);
            shard
        });
        self.highest_seq = self.highest_seq.max(hole);
        Some((hole, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(data: usize, parity: usize) -> FecConfig {
        FecConfig {
            data_shards: data,
            parity_shards: parity,
        }
    }

    #[test]
    fn parity_emitted_per_full_group() {
        let mut enc = FecEncoder::new(cfg(3, 1));
        assert!(enc.push(1, b"aa").is_empty());
        assert!(enc.push(2, b"bbb").is_empty());
        let blocks = enc.push(3, b"c");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].group_start, 1);
        assert_eq!(blocks[0].span, 3);

        // Next group starts fresh.
        assert!(enc.push(4, b"dd").is_empty());
    }

    #[test]
    fn reconstructs_single_loss() {
        let mut enc = FecEncoder::new(cfg(3, 1));
        let mut dec = FecDecoder::new(cfg(3, 1));

        enc.push(1, b"first");
        enc.push(2, b"second segment");
        let blocks = enc.push(3, b"third");

        // Segment 2 is lost.
        assert!(dec.observe_data(1, b"first").is_empty());
        assert!(dec.observe_data(3, b"third").is_empty());
        let rebuilt = dec.observe_parity(blocks[0].clone());
        assert_eq!(rebuilt, vec![(2, Bytes::from_static(b"second segment"))]);
    }

    #[test]
    fn parity_before_data_reconstructs_on_late_arrival() {
        let mut enc = FecEncoder::new(cfg(2, 1));
        let mut dec = FecDecoder::new(cfg(2, 1));

        enc.push(1, b"alpha");
        let blocks = enc.push(2, b"beta");

        // Parity arrives first; two holes, nothing to do yet.
        assert!(dec.observe_parity(blocks[0].clone()).is_empty());
        // First data segment arrives: lane now has one hole, rebuild it.
        let rebuilt = dec.observe_data(1, b"alpha");
        assert_eq!(rebuilt, vec![(2, Bytes::from_static(b"beta"))]);
    }

    #[test]
    fn two_lanes_recover_two_losses() {
        let geometry = cfg(4, 2);
        let mut enc = FecEncoder::new(geometry);
        let mut dec = FecDecoder::new(geometry);

        enc.push(1, b"s1");
        enc.push(2, b"s2");
        enc.push(3, b"s3");
        let blocks = enc.push(4, b"s4");
        assert_eq!(blocks.len(), 2);

        // Lose segment 1 (lane 0) and segment 2 (lane 1).
        assert!(dec.observe_data(3, b"s3").is_empty());
        assert!(dec.observe_data(4, b"s4").is_empty());

        let mut rebuilt: Vec<(u32, Bytes)> = Vec::new();
        for block in blocks {
            rebuilt.extend(dec.observe_parity(block));
        }
        rebuilt.sort_by_key(|(seq, _)| *seq);
        assert_eq!(
            rebuilt,
            vec![
                (1, Bytes::from_static(b"s1")),
                (2, Bytes::from_static(b"s2")),
            ]
        );
    }

    #[test]
    fn two_losses_in_one_lane_are_not_recoverable() {
        let mut enc = FecEncoder::new(cfg(4, 1));
        let mut dec = FecDecoder::new(cfg(4, 1));

        enc.push(1, b"s1");
        enc.push(2, b"s2");
        enc.push(3, b"s3");
        let blocks = enc.push(4, b"s4");

        dec.observe_data(1, b"s1");
        dec.observe_data(4, b"s4");
        assert!(dec.observe_parity(blocks[0].clone()).is_empty());
    }

    #[test]
    fn parity_payload_round_trips() {
        let block = ParityBlock {
            group_start: 9,
            lane: 1,
            span: 4,
            bytes: Bytes::from(vec![0u8; SHARD_WIDTH]),
        };
        let decoded = ParityBlock::decode_payload(9, block.encode_payload()).unwrap();
        assert_eq!(decoded, block);
    }

    #[test]
    fn old_groups_are_pruned() {
        let geometry = cfg(2, 1);
        let mut dec = FecDecoder::new(geometry);
        dec.observe_data(1, b"early");
        // Jump far ahead; group 1 falls off the horizon.
        dec.observe_data(1000, b"late");
        assert!(!dec.shards.contains_key(&1));
        assert!(dec.shards.contains_key(&1000));
    }
}
