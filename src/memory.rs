//! Generic sequence-memory capability interface.
//!
//! Cache-management code elsewhere in a runtime talks to every cache through
//! this trait: batch initialization, sequence editing, position queries, and
//! persisted-state I/O. The quantized activation cache satisfies it via the
//! wrap adapter (see [`crate::cache::wrap`]), which forwards everything to a
//! standard implementation.

use std::collections::HashMap;
use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Sequence identifier.
pub type SeqId = u32;

/// Token position within a sequence.
pub type Pos = i32;

/// What kind of implementation backs a memory handle.
///
/// Generic code branches on this tag instead of probing concrete types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryKind {
    /// A plain KV cache.
    Standard,
    /// The quantized-activation wrap adapter.
    QuantWrap,
}

/// Result of an init call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryStatus {
    Success,
    NoUpdate,
}

/// The capability contract every cache implementation exposes.
pub trait SequenceMemory {
    /// Prepare for decoding a batch of `n_tokens` new tokens.
    fn init_batch(&mut self, n_tokens: u32) -> MemoryStatus;

    /// Prepare a context covering the full cached state.
    fn init_full(&mut self) -> MemoryStatus;

    /// Prepare a maintenance update (defragmentation, shifts).
    fn init_update(&mut self) -> MemoryStatus;

    /// Whether cached data can be position-shifted in place.
    fn can_shift(&self) -> bool;

    /// Reset all sequences. `data` requests that backing buffers be wiped too.
    fn clear(&mut self, data: bool);

    /// Remove positions `[p0, p1)` of a sequence. `p1 < 0` means to the end.
    /// Returns false if the range cannot be removed.
    fn seq_rm(&mut self, seq: SeqId, p0: Pos, p1: Pos) -> bool;

    /// Copy positions `[p0, p1)` from one sequence to another.
    fn seq_cp(&mut self, src: SeqId, dst: SeqId, p0: Pos, p1: Pos);

    /// Drop every sequence except the given one.
    fn seq_keep(&mut self, seq: SeqId);

    /// Shift positions `[p0, p1)` of a sequence by `delta`.
    fn seq_add(&mut self, seq: SeqId, p0: Pos, p1: Pos, delta: Pos);

    /// Divide positions `[p0, p1)` of a sequence by `divisor`.
    fn seq_div(&mut self, seq: SeqId, p0: Pos, p1: Pos, divisor: i32);

    /// Smallest cached position of a sequence, or -1 if empty.
    fn seq_pos_min(&self, seq: SeqId) -> Pos;

    /// Largest cached position of a sequence, or -1 if empty.
    fn seq_pos_max(&self, seq: SeqId) -> Pos;

    /// Serialize sequence state.
    fn state_write(&self, out: &mut dyn Write) -> io::Result<()>;

    /// Restore sequence state.
    fn state_read(&mut self, input: &mut dyn Read) -> io::Result<()>;

    /// Implementation tag for generic dispatch.
    fn kind(&self) -> MemoryKind {
        MemoryKind::Standard
    }
}

/// Whether a memory handle is backed by the quantized-activation adapter.
pub fn is_quant_wrap(mem: &dyn SequenceMemory) -> bool {
    mem.kind() == MemoryKind::QuantWrap
}

/// Cached position range of one sequence, inclusive on both ends.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct SeqRange {
    min: Pos,
    max: Pos,
}

/// A plain position-tracking KV cache.
///
/// Tracks which positions each sequence covers; the tensor payloads
/// themselves live with the runtime that owns the cache buffers. This is the
/// base implementation the wrap adapter delegates to.
#[derive(Debug, Default)]
pub struct StandardKvCache {
    seqs: HashMap<SeqId, SeqRange>,
}

impl StandardKvCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `n` newly decoded tokens at the tail of a sequence.
    pub fn advance(&mut self, seq: SeqId, n: u32) {
        let range = self.seqs.entry(seq).or_insert(SeqRange { min: 0, max: -1 });
        range.max += n as Pos;
    }

    /// Number of tracked sequences.
    pub fn n_seqs(&self) -> usize {
        self.seqs.len()
    }

    fn end_of(&self, seq: SeqId, p1: Pos) -> Pos {
        if p1 < 0 {
            self.seqs.get(&seq).map(|r| r.max + 1).unwrap_or(0)
        } else {
            p1
        }
    }
}

impl SequenceMemory for StandardKvCache {
    fn init_batch(&mut self, _n_tokens: u32) -> MemoryStatus {
        MemoryStatus::Success
    }

    fn init_full(&mut self) -> MemoryStatus {
        MemoryStatus::Success
    }

    fn init_update(&mut self) -> MemoryStatus {
        MemoryStatus::NoUpdate
    }

    fn can_shift(&self) -> bool {
        true
    }

    fn clear(&mut self, _data: bool) {
        self.seqs.clear();
    }

    fn seq_rm(&mut self, seq: SeqId, p0: Pos, p1: Pos) -> bool {
        let p1 = self.end_of(seq, p1);
        let Some(range) = self.seqs.get_mut(&seq) else {
            return true;
        };
        if p0 <= range.min && p1 > range.max {
            self.seqs.remove(&seq);
        } else if p1 > range.max {
            // Trim the tail.
            range.max = p0 - 1;
        } else if p0 <= range.min {
            // Trim the head.
            range.min = p1;
        } else {
            // Holes are not representable in a contiguous range.
            return false;
        }
        true
    }

    fn seq_cp(&mut self, src: SeqId, dst: SeqId, p0: Pos, p1: Pos) {
        let p1 = self.end_of(src, p1);
        if let Some(range) = self.seqs.get(&src) {
            let copied = SeqRange {
                min: range.min.max(p0),
                max: range.max.min(p1 - 1),
            };
            if copied.min <= copied.max {
                self.seqs.insert(dst, copied);
            }
        }
    }

    fn seq_keep(&mut self, seq: SeqId) {
        self.seqs.retain(|&id, _| id == seq);
    }

    fn seq_add(&mut self, seq: SeqId, p0: Pos, p1: Pos, delta: Pos) {
        let p1 = self.end_of(seq, p1);
        if let Some(range) = self.seqs.get_mut(&seq) {
            if p0 <= range.min && p1 > range.max {
                range.min += delta;
                range.max += delta;
            }
        }
    }

    fn seq_div(&mut self, seq: SeqId, p0: Pos, p1: Pos, divisor: i32) {
        let p1 = self.end_of(seq, p1);
        if divisor <= 0 {
            return;
        }
        if let Some(range) = self.seqs.get_mut(&seq) {
            if p0 <= range.min && p1 > range.max {
                range.min /= divisor;
                range.max /= divisor;
            }
        }
    }

    fn seq_pos_min(&self, seq: SeqId) -> Pos {
        self.seqs.get(&seq).map(|r| r.min).unwrap_or(-1)
    }

    fn seq_pos_max(&self, seq: SeqId) -> Pos {
        self.seqs.get(&seq).map(|r| r.max).unwrap_or(-1)
    }

    fn state_write(&self, out: &mut dyn Write) -> io::Result<()> {
        serde_json::to_writer(out, &self.seqs)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn state_read(&mut self, input: &mut dyn Read) -> io::Result<()> {
        self.seqs = serde_json::from_reader(input)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        debug!(sequences = self.seqs.len(), "Restored sequence state");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_with(seq: SeqId, tokens: u32) -> StandardKvCache {
        let mut cache = StandardKvCache::new();
        cache.advance(seq, tokens);
        cache
    }

    #[test]
    fn test_advance_tracks_positions() {
        let mut cache = cache_with(1, 8);
        assert_eq!(cache.seq_pos_min(1), 0);
        assert_eq!(cache.seq_pos_max(1), 7);
        cache.advance(1, 4);
        assert_eq!(cache.seq_pos_max(1), 11);
    }

    #[test]
    fn test_missing_sequence_positions() {
        let cache = StandardKvCache::new();
        assert_eq!(cache.seq_pos_min(9), -1);
        assert_eq!(cache.seq_pos_max(9), -1);
    }

    #[test]
    fn test_seq_rm_tail_and_full() {
        let mut cache = cache_with(1, 10);
        assert!(cache.seq_rm(1, 6, -1));
        assert_eq!(cache.seq_pos_max(1), 5);

        assert!(cache.seq_rm(1, 0, -1));
        assert_eq!(cache.seq_pos_max(1), -1);
    }

    #[test]
    fn test_seq_rm_hole_rejected() {
        let mut cache = cache_with(1, 10);
        assert!(!cache.seq_rm(1, 3, 5));
    }

    #[test]
    fn test_seq_cp_and_keep() {
        let mut cache = cache_with(1, 10);
        cache.seq_cp(1, 2, 0, -1);
        assert_eq!(cache.seq_pos_max(2), 9);

        cache.seq_keep(2);
        assert_eq!(cache.seq_pos_max(1), -1);
        assert_eq!(cache.seq_pos_max(2), 9);
    }

    #[test]
    fn test_state_roundtrip() {
        let cache = cache_with(3, 5);
        let mut buf = Vec::new();
        cache.state_write(&mut buf).unwrap();

        let mut restored = StandardKvCache::new();
        restored.state_read(&mut buf.as_slice()).unwrap();
        assert_eq!(restored.seq_pos_max(3), 4);
    }
}
