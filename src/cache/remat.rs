//! Rematerialization: rebuild K/V tensors from cached activations.
//!
//! For a layer, the engine dequantizes every committed block in token order,
//! then every staged write in staging order, concatenates them into one
//! `[d_model, n_kv]` matrix, and projects it through the layer's fixed key
//! and value weights. Staged writes are visible to readers before they
//! commit; their decompressed width is clamped to the claimed token count in
//! case the codec padded the realized output to a block boundary.

use bytes::Bytes;
use tracing::{debug, warn};

use crate::cache::store::ActivationCache;
use crate::graph::{f16_bytes, f32_bytes, DType, Graph, NodeId, Shape};

/// A read-only projection matrix, `[d_in, d_out]` column-major.
///
/// Owned by the model, never mutated by the cache. The payload is cheap to
/// clone into a compute graph as a leaf.
#[derive(Debug, Clone)]
pub struct WeightMatrix {
    dtype: DType,
    d_in: usize,
    d_out: usize,
    data: Bytes,
}

impl WeightMatrix {
    pub fn from_f32(d_in: usize, d_out: usize, vals: &[f32]) -> Self {
        assert_eq!(vals.len(), d_in * d_out);
        Self {
            dtype: DType::F32,
            d_in,
            d_out,
            data: f32_bytes(vals),
        }
    }

    pub fn from_f16(d_in: usize, d_out: usize, vals: &[f32]) -> Self {
        assert_eq!(vals.len(), d_in * d_out);
        Self {
            dtype: DType::F16,
            d_in,
            d_out,
            data: f16_bytes(vals),
        }
    }

    /// Square identity, useful for tests and calibration runs: projecting
    /// through it returns the cached activations themselves.
    pub fn identity(d: usize) -> Self {
        let mut vals = vec![0f32; d * d];
        for i in 0..d {
            vals[i * d + i] = 1.0;
        }
        Self::from_f32(d, d, &vals)
    }

    pub fn d_in(&self) -> usize {
        self.d_in
    }

    pub fn d_out(&self) -> usize {
        self.d_out
    }

    /// Materialize this matrix as a realized graph leaf.
    pub fn node(&self, g: &mut Graph) -> NodeId {
        g.leaf_with_data(self.dtype, Shape::d2(self.d_in, self.d_out), self.data.clone())
    }
}

/// Per-layer key and value projection weights.
#[derive(Debug, Clone)]
pub struct LayerWeights {
    pub wk: WeightMatrix,
    pub wv: WeightMatrix,
}

/// The model's projection weights for every layer.
#[derive(Debug, Clone)]
pub struct ProjectionWeights {
    layers: Vec<LayerWeights>,
}

impl ProjectionWeights {
    pub fn new(layers: Vec<LayerWeights>) -> Self {
        Self { layers }
    }

    /// Identity Wk/Wv for every layer.
    pub fn identity(d_model: usize, n_layers: usize) -> Self {
        let layers = (0..n_layers)
            .map(|_| LayerWeights {
                wk: WeightMatrix::identity(d_model),
                wv: WeightMatrix::identity(d_model),
            })
            .collect();
        Self { layers }
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layer(&self, layer: usize) -> &LayerWeights {
        &self.layers[layer]
    }
}

/// Outcome of a windowed K/V rematerialization.
#[derive(Debug, Clone, Copy)]
pub struct RematResult {
    pub k: Option<NodeId>,
    pub v: Option<NodeId>,
    pub ok: bool,
}

impl RematResult {
    fn failed() -> Self {
        Self {
            k: None,
            v: None,
            ok: false,
        }
    }
}

impl ActivationCache {
    /// Build the full `[d_model, n_kv]` activation matrix for a layer.
    ///
    /// Returns None when the layer has neither committed blocks nor staged
    /// writes, which is the normal state on the very first step.
    fn build_full_x(&self, g: &mut Graph, layer: usize) -> Option<NodeId> {
        let d = self.d_model();
        let mut cur: Option<NodeId> = None;

        for blk in self.blocks(layer) {
            let qt = g.leaf_with_data(
                DType::Quant(blk.codec),
                Shape::d2(blk.width, blk.token_count),
                blk.data.clone(),
            );
            let deq = g.cast(qt, DType::F32);
            cur = Some(match cur {
                Some(acc) => g.concat_cols(acc, deq),
                None => deq,
            });
        }

        for pw in self.pending_for(layer) {
            let deq_full = g.cast(pw.node, DType::F32);
            let shape = g.shape(deq_full);
            let cols_full = shape.elements() / d;
            let deq_full = if shape.ne(0) != d || shape.rank() > 2 {
                g.reshape(deq_full, Shape::d2(d, cols_full))
            } else {
                deq_full
            };
            // Clamp to the claimed count; the codec may have padded.
            let take = pw.claimed_tokens.min(cols_full);
            debug!(layer, cols_full, take, "Pending slice folded into rematerialized X");
            let deq = if take < cols_full {
                g.view_cols(deq_full, 0, take)
            } else {
                deq_full
            };
            cur = Some(match cur {
                Some(acc) => g.concat_cols(acc, deq),
                None => deq,
            });
        }

        let x = cur?;
        let n_kv = self.n_kv(layer);
        assert_eq!(
            g.shape(x).ne(1),
            n_kv,
            "rematerialized column count disagrees with cached token count for layer {layer}"
        );
        Some(x)
    }

    /// Rematerialize the key tensor for a layer over the full cached range,
    /// shaped `[head_dim, n_kv_heads, n_tokens]`.
    ///
    /// Returns None when nothing is cached for the layer yet.
    pub fn get_k(&self, g: &mut Graph, layer: usize) -> Option<NodeId> {
        let x = self.build_full_x(g, layer)?;
        let w = self.weights().layer(layer).wk.node(g);
        Some(self.project_heads(g, w, x))
    }

    /// Rematerialize the value tensor for a layer over the full cached range,
    /// shaped `[head_dim, n_kv_heads, n_tokens]`.
    pub fn get_v(&self, g: &mut Graph, layer: usize) -> Option<NodeId> {
        let x = self.build_full_x(g, layer)?;
        let w = self.weights().layer(layer).wv.node(g);
        Some(self.project_heads(g, w, x))
    }

    fn project_heads(&self, g: &mut Graph, w: NodeId, x: NodeId) -> NodeId {
        let lin = g.matmul(w, x);
        let n_tokens = g.shape(lin).ne(1);
        g.reshape(
            lin,
            Shape::d3(self.head_dim(), self.n_kv_heads(), n_tokens),
        )
    }

    /// Rematerialize K and V for a token window through caller-supplied
    /// weights, as flat `[d_out, t1 - t0]` projections.
    ///
    /// The window is clamped to the cached range; an empty clamped window
    /// fails (ok = false) without building anything.
    pub fn remat_kv(
        &self,
        g: &mut Graph,
        layer: usize,
        t0: usize,
        t1: usize,
        wk: &WeightMatrix,
        wv: &WeightMatrix,
    ) -> RematResult {
        let Some(x) = self.build_full_x(g, layer) else {
            return RematResult::failed();
        };

        let n_kv = g.shape(x).ne(1);
        let t1 = t1.min(n_kv);
        let t0 = t0.min(t1);
        if t0 == t1 {
            warn!(layer, n_kv, "remat_kv: empty token window after clamping");
            return RematResult::failed();
        }

        let win = if t0 == 0 && t1 == n_kv {
            x
        } else {
            g.view_cols(x, t0, t1 - t0)
        };
        let wk = wk.node(g);
        let wv = wv.node(g);
        RematResult {
            k: Some(g.matmul(wk, win)),
            v: Some(g.matmul(wv, win)),
            ok: true,
        }
    }
}
