//! Staged writes awaiting commit.
//!
//! `write` stages a deferred quantize node and records the token count the
//! caller claims it will produce. The commit scan later resolves each entry
//! to exactly one of three outcomes: committed into the block store, kept for
//! a later scan because the node has not been realized yet, or dropped on an
//! integrity fault.

use tracing::warn;

use crate::cache::block::QuantBlock;
use crate::graph::{Graph, NodeId};
use crate::quant::Codec;

/// A staged write: the quantize node is part of the caller's compute graph
/// and may not have realized data until a later execution step.
#[derive(Debug, Clone)]
pub struct PendingWrite {
    /// Target layer index.
    pub layer: usize,

    /// Handle to the deferred quantized tensor.
    pub node: NodeId,

    /// Token count the writer claimed this entry covers.
    pub claimed_tokens: usize,
}

/// Resolution of one pending entry during a commit scan.
#[derive(Debug)]
pub enum CommitOutcome {
    /// Realized bytes were copied into a durable block.
    Committed(QuantBlock),

    /// The backing tensor has no realized data yet; retry on the next scan.
    Deferred,

    /// Realized byte length was not a whole number of rows; the entry is
    /// discarded so it cannot corrupt the store.
    Dropped,
}

/// Try to resolve one pending write against the graph's realized state.
///
/// The claimed token count is taken at face value unless the realized byte
/// length says otherwise, in which case the byte-derived count wins and the
/// disagreement is logged; that points at a producer bug upstream, not at
/// the cache.
pub fn try_commit(g: &Graph, pw: &PendingWrite, codec: Codec, width: usize) -> CommitOutcome {
    let Some(bytes) = g.data(pw.node) else {
        return CommitOutcome::Deferred;
    };

    let row_bytes = codec.row_size(width);
    if bytes.len() % row_bytes != 0 {
        warn!(
            layer = pw.layer,
            realized_bytes = bytes.len(),
            row_bytes,
            "Dropping staged write: realized length is not a whole number of rows"
        );
        return CommitOutcome::Dropped;
    }

    let actual_tokens = bytes.len() / row_bytes;
    let token_count = if actual_tokens != pw.claimed_tokens {
        warn!(
            layer = pw.layer,
            claimed = pw.claimed_tokens,
            actual = actual_tokens,
            "Staged write realized a different token count than claimed; using byte-derived count"
        );
        actual_tokens
    } else {
        pw.claimed_tokens
    };

    CommitOutcome::Committed(QuantBlock {
        codec,
        width,
        token_count,
        data: bytes.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{DType, Shape};
    use bytes::Bytes;

    const W: usize = 32;

    fn staged(g: &mut Graph, claimed: usize) -> PendingWrite {
        let node = g.leaf(DType::Quant(Codec::Q8), Shape::d2(W, claimed));
        PendingWrite {
            layer: 0,
            node,
            claimed_tokens: claimed,
        }
    }

    #[test]
    fn test_unrealized_entry_is_deferred() {
        let mut g = Graph::new();
        let pw = staged(&mut g, 3);
        assert!(matches!(
            try_commit(&g, &pw, Codec::Q8, W),
            CommitOutcome::Deferred
        ));
    }

    #[test]
    fn test_realized_entry_commits_with_claimed_count() {
        let mut g = Graph::new();
        let pw = staged(&mut g, 3);
        g.set_data(pw.node, Bytes::from(vec![0u8; Codec::Q8.row_size(W) * 3]));

        match try_commit(&g, &pw, Codec::Q8, W) {
            CommitOutcome::Committed(block) => assert_eq!(block.token_count, 3),
            other => panic!("expected commit, got {other:?}"),
        }
    }

    #[test]
    fn test_byte_derived_count_wins_on_mismatch() {
        let mut g = Graph::new();
        // Claimed 5 tokens but only 3 rows of bytes realize.
        let node = g.leaf(DType::Quant(Codec::Q8), Shape::d2(W, 3));
        g.set_data(node, Bytes::from(vec![0u8; Codec::Q8.row_size(W) * 3]));
        let pw = PendingWrite {
            layer: 0,
            node,
            claimed_tokens: 5,
        };

        match try_commit(&g, &pw, Codec::Q8, W) {
            CommitOutcome::Committed(block) => assert_eq!(block.token_count, 3),
            other => panic!("expected commit, got {other:?}"),
        }
    }

    #[test]
    fn test_ragged_length_is_dropped() {
        let mut g = Graph::new();
        let node = g.leaf(DType::F32, Shape::d1(7));
        g.set_data(node, Bytes::from(vec![0u8; 28]));
        let pw = PendingWrite {
            layer: 0,
            node,
            claimed_tokens: 1,
        };

        assert!(matches!(
            try_commit(&g, &pw, Codec::Q8, W),
            CommitOutcome::Dropped
        ));
    }
}
