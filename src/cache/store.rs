//! The activation cache engine.
//!
//! Instead of caching full-precision K and V, the cache stores a quantized
//! copy of each layer's pre-projection hidden state and rebuilds K/V on
//! demand (see [`crate::cache::remat`]). The write path is deferred: `write`
//! stages a quantize node in the caller's graph, and `apply` later commits
//! whatever has been realized. Readers observe staged-but-uncommitted writes
//! too, so a step sees its own activations before `apply` runs.

use std::path::Path;

use bytes::Bytes;
use half::f16;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::block::{LayerStore, QuantBlock};
use crate::cache::pending::{try_commit, CommitOutcome, PendingWrite};
use crate::cache::remat::ProjectionWeights;
use crate::config::Config;
use crate::graph::{DType, Graph, NodeId, Shape};
use crate::quant::{bits_to_codec, Codec};
use crate::svd::{self, SvdRanks};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("embedding width {width} is not a positive multiple of the codec block size {block}")]
    MisalignedWidth { width: usize, block: usize },

    #[error("projection weights cover {got} layers, model has {want}")]
    WeightLayerMismatch { got: usize, want: usize },
}

/// Quantized activation cache for a single append-only sequence.
#[derive(Debug)]
pub struct ActivationCache {
    d_model: usize,
    head_dim: usize,
    n_kv_heads: usize,
    codec: Codec,

    store: LayerStore,
    pending: Vec<PendingWrite>,
    weights: ProjectionWeights,
    svd: Option<Vec<SvdRanks>>,
}

impl ActivationCache {
    /// Construct a cache for the configured model.
    ///
    /// The embedding width must be a positive multiple of the codec block
    /// size; anything else is a configuration fault, not a runtime one.
    pub fn new(config: &Config, weights: ProjectionWeights) -> Result<Self, CacheError> {
        let codec = bits_to_codec(config.quant.bits);
        let width = config.model.d_model;
        if width == 0 || width % codec.block_size() != 0 {
            return Err(CacheError::MisalignedWidth {
                width,
                block: codec.block_size(),
            });
        }
        if weights.n_layers() != config.model.n_layers {
            return Err(CacheError::WeightLayerMismatch {
                got: weights.n_layers(),
                want: config.model.n_layers,
            });
        }

        Ok(Self {
            d_model: width,
            head_dim: config.model.head_dim,
            n_kv_heads: config.model.n_kv_heads,
            codec,
            store: LayerStore::new(config.model.n_layers),
            pending: Vec::new(),
            weights,
            svd: None,
        })
    }

    pub fn d_model(&self) -> usize {
        self.d_model
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    pub fn n_kv_heads(&self) -> usize {
        self.n_kv_heads
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn n_layers(&self) -> usize {
        self.store.n_layers()
    }

    pub(crate) fn blocks(&self, layer: usize) -> &[QuantBlock] {
        self.store.blocks(layer)
    }

    pub(crate) fn pending_for(&self, layer: usize) -> impl Iterator<Item = &PendingWrite> + '_ {
        self.pending.iter().filter(move |pw| pw.layer == layer)
    }

    pub(crate) fn weights(&self) -> &ProjectionWeights {
        &self.weights
    }

    /// Number of staged writes awaiting commit, across all layers.
    pub fn pending_writes(&self) -> usize {
        self.pending.len()
    }

    /// Total quantized bytes committed across all layers.
    pub fn quantized_bytes(&self) -> usize {
        self.store.total_bytes()
    }

    /// Cached tokens for a layer: committed blocks plus staged writes.
    ///
    /// This is the column count rematerialization must reproduce exactly.
    pub fn n_kv(&self, layer: usize) -> usize {
        self.store.committed_tokens(layer)
            + self
                .pending_for(layer)
                .map(|pw| pw.claimed_tokens)
                .sum::<usize>()
    }

    /// Stage one layer's activations for caching.
    ///
    /// The input is normalized to `[d_model, n_tokens]` (a single vector
    /// becomes one column, a token-major matrix is transposed) and a deferred
    /// quantize node is appended to the caller's graph. The returned handle
    /// has no realized data until the caller computes it; the cache picks the
    /// bytes up on a later [`ActivationCache::apply`].
    pub fn write(&mut self, g: &mut Graph, x: NodeId, layer: usize) -> NodeId {
        assert!(layer < self.n_layers());

        let shape = g.shape(x);
        let elems = shape.elements();
        assert!(
            elems > 0 && elems % self.d_model == 0,
            "activation element count {elems} does not fold into width {}",
            self.d_model
        );
        let n_tokens = elems / self.d_model;

        let x = if shape.ne(0) == self.d_model {
            if shape.rank() <= 2 {
                x
            } else {
                g.reshape(x, Shape::d2(self.d_model, n_tokens))
            }
        } else if shape.rank() == 2 && shape.ne(1) == self.d_model {
            // Token-major input: one row per token.
            g.transpose2d(x)
        } else {
            g.reshape(x, Shape::d2(self.d_model, n_tokens))
        };

        let q = g.cast(x, DType::Quant(self.codec));
        self.stage_quantized(q, layer, n_tokens);
        q
    }

    /// Stage an already-built quantized node with an explicit token count.
    ///
    /// `write` uses this internally; callers that run their own quantization
    /// can stage the result directly. `n_tokens` is the logical count: if
    /// the node realizes more columns than that (allocator padding), readers
    /// clamp to it, and the commit scan reconciles any byte-level
    /// disagreement.
    pub fn stage_quantized(&mut self, node: NodeId, layer: usize, n_tokens: usize) {
        assert!(layer < self.n_layers());
        debug!(layer, n_tokens, codec = %self.codec, "Staged activation write");
        self.pending.push(PendingWrite {
            layer,
            node,
            claimed_tokens: n_tokens,
        });
    }

    /// Commit whatever staged writes have realized data, oldest first.
    ///
    /// Entries whose backing tensors are still unrealized stay pending and
    /// are retried on the next call. The per-layer token count is unchanged
    /// by a clean commit; entries only move from the pending term to the
    /// committed term.
    pub fn apply(&mut self, g: &Graph) {
        let entries = std::mem::take(&mut self.pending);
        let mut committed = 0usize;
        for pw in entries {
            match try_commit(g, &pw, self.codec, self.d_model) {
                CommitOutcome::Committed(block) => {
                    debug!(
                        layer = pw.layer,
                        tokens = block.token_count,
                        bytes = block.data_size(),
                        "Committed staged write"
                    );
                    self.store.push(pw.layer, block);
                    committed += 1;
                }
                CommitOutcome::Deferred => self.pending.push(pw),
                CommitOutcome::Dropped => {}
            }
        }
        if committed > 0 {
            debug!(
                committed,
                still_pending = self.pending.len(),
                "Commit scan complete"
            );
        }
    }

    /// Quantize already-realized rows and commit them directly.
    ///
    /// Prefill path: `raw` is row-major `[n_tokens, n_embd]` in f32 or f16.
    /// Returns false (with a warning) instead of erroring on malformed input,
    /// so a caller can fall back to its uncached path.
    pub fn append_rows(
        &mut self,
        layer: usize,
        raw: &[u8],
        n_tokens: usize,
        n_embd: usize,
        is_f16: bool,
    ) -> bool {
        if layer >= self.n_layers() {
            warn!(layer, n_layers = self.n_layers(), "append_rows: layer out of range");
            return false;
        }
        if n_embd != self.d_model {
            warn!(n_embd, d_model = self.d_model, "append_rows: width mismatch");
            return false;
        }
        let elem_bytes = if is_f16 { 2 } else { 4 };
        if raw.len() != n_tokens * n_embd * elem_bytes {
            warn!(
                bytes = raw.len(),
                n_tokens, n_embd, is_f16, "append_rows: byte length mismatch"
            );
            return false;
        }

        let rows: Vec<f32> = if is_f16 {
            raw.chunks_exact(2)
                .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect()
        } else {
            raw.chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect()
        };

        let row_bytes = self.codec.row_size(self.d_model);
        let mut data = vec![0u8; n_tokens * row_bytes];
        for (row, chunk) in rows.chunks_exact(self.d_model).enumerate() {
            self.codec
                .quantize_row(chunk, &mut data[row * row_bytes..(row + 1) * row_bytes]);
        }

        debug!(layer, n_tokens, bytes = data.len(), "Appended prefill rows");
        self.store.push(
            layer,
            QuantBlock {
                codec: self.codec,
                width: self.d_model,
                token_count: n_tokens,
                data: Bytes::from(data),
            },
        );
        true
    }

    /// Drop all committed blocks and staged writes.
    pub fn clear(&mut self) {
        self.store.clear();
        self.pending.clear();
    }

    /// Load pre-computed low-rank factors from an `.xqsv` side file.
    ///
    /// Fails closed: on any mismatch the cache state is left untouched and
    /// false is returned.
    pub fn load_svd(&mut self, path: &Path) -> bool {
        let factors = match svd::read_factors(path) {
            Ok(factors) => factors,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Low-rank factor load failed");
                return false;
            }
        };
        if factors.layers.len() != self.n_layers() {
            warn!(
                path = %path.display(),
                file_layers = factors.layers.len(),
                model_layers = self.n_layers(),
                "Low-rank factor file does not match the active model"
            );
            return false;
        }
        debug!(path = %path.display(), layers = factors.layers.len(), "Loaded low-rank factors");
        self.svd = Some(factors.layers);
        true
    }

    /// Low-rank factor ranks for a layer, when a side file has been loaded.
    pub fn svd_ranks(&self, layer: usize) -> Option<SvdRanks> {
        self.svd.as_ref().map(|layers| layers[layer])
    }
}
