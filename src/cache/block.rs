//! Committed activation blocks and the per-layer block store.
//!
//! A block holds a contiguous run of quantized activation rows (one row per
//! token) for a single layer. Blocks are immutable once committed and are
//! only ever appended; the store is cleared as a whole, never edited.

use bytes::Bytes;

use crate::quant::Codec;

/// One committed run of quantized activation rows.
#[derive(Debug, Clone)]
pub struct QuantBlock {
    /// Storage codec of the payload.
    pub codec: Codec,

    /// Embedding width (elements per row).
    pub width: usize,

    /// Logical token count covered by this block.
    pub token_count: usize,

    /// Quantized payload: `token_count` rows of `codec.row_size(width)` bytes.
    pub data: Bytes,
}

impl QuantBlock {
    /// Size of the quantized payload in bytes.
    pub fn data_size(&self) -> usize {
        self.data.len()
    }
}

/// Per-layer ordered block lists.
///
/// Insertion order is temporal write order is token order: the blocks of a
/// layer, concatenated, cover tokens `[0..committed_tokens)` of the sequence.
#[derive(Debug)]
pub struct LayerStore {
    layers: Vec<Vec<QuantBlock>>,
}

impl LayerStore {
    /// Create an empty store for `n_layers` layers.
    pub fn new(n_layers: usize) -> Self {
        Self {
            layers: (0..n_layers).map(|_| Vec::new()).collect(),
        }
    }

    /// Number of layers.
    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    /// Append a committed block to a layer.
    pub fn push(&mut self, layer: usize, block: QuantBlock) {
        self.layers[layer].push(block);
    }

    /// The committed blocks of a layer, in token order.
    pub fn blocks(&self, layer: usize) -> &[QuantBlock] {
        &self.layers[layer]
    }

    /// Total committed tokens for a layer.
    pub fn committed_tokens(&self, layer: usize) -> usize {
        self.layers[layer].iter().map(|b| b.token_count).sum()
    }

    /// Total quantized bytes held across all layers.
    pub fn total_bytes(&self) -> usize {
        self.layers
            .iter()
            .flat_map(|blocks| blocks.iter())
            .map(|b| b.data_size())
            .sum()
    }

    /// Drop every block in every layer.
    pub fn clear(&mut self) {
        for blocks in &mut self.layers {
            blocks.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(tokens: usize) -> QuantBlock {
        let codec = Codec::Q8;
        QuantBlock {
            codec,
            width: 32,
            token_count: tokens,
            data: Bytes::from(vec![0u8; codec.row_size(32) * tokens]),
        }
    }

    #[test]
    fn test_committed_token_accounting() {
        let mut store = LayerStore::new(2);
        store.push(0, block(5));
        store.push(0, block(3));
        store.push(1, block(7));

        assert_eq!(store.committed_tokens(0), 8);
        assert_eq!(store.committed_tokens(1), 7);
        assert_eq!(store.blocks(0).len(), 2);
    }

    #[test]
    fn test_clear_empties_every_layer() {
        let mut store = LayerStore::new(2);
        store.push(0, block(5));
        store.push(1, block(2));
        store.clear();

        assert_eq!(store.committed_tokens(0), 0);
        assert_eq!(store.committed_tokens(1), 0);
        assert_eq!(store.total_bytes(), 0);
    }

    #[test]
    fn test_total_bytes() {
        let mut store = LayerStore::new(1);
        store.push(0, block(4));
        assert_eq!(store.total_bytes(), Codec::Q8.row_size(32) * 4);
    }
}
