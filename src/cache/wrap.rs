//! Wrap adapter: a standard cache and the quantized store, side by side.
//!
//! Generic cache-management code keeps talking to the standard cache; every
//! capability call is forwarded verbatim with no interaction with the
//! quantized store. Layer-execution code reaches the store through the
//! dedicated write/rematerialize entry points. Detection goes through
//! [`MemoryKind`], not type probing.

use std::io::{self, Read, Write};

use tracing::info;

use crate::cache::remat::{RematResult, WeightMatrix};
use crate::cache::store::ActivationCache;
use crate::graph::{Graph, NodeId};
use crate::memory::{MemoryKind, MemoryStatus, Pos, SeqId, SequenceMemory};

/// Composes a base [`SequenceMemory`] with an [`ActivationCache`].
pub struct QuantWrapMemory<B: SequenceMemory> {
    base: B,
    store: ActivationCache,
    active: bool,
}

impl<B: SequenceMemory> QuantWrapMemory<B> {
    /// Attach the quantized store in front of `base`.
    ///
    /// Logs the activation once per adapter; the flag is diagnostic only and
    /// gates nothing.
    pub fn new(base: B, store: ActivationCache) -> Self {
        info!(
            codec = %store.codec(),
            d_model = store.d_model(),
            n_layers = store.n_layers(),
            "Quantized activation cache attached: capturing hidden states, rematerializing K/V"
        );
        Self {
            base,
            store,
            active: true,
        }
    }

    /// Whether the quantized path has been activated for this cache.
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn base(&self) -> &B {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut B {
        &mut self.base
    }

    pub fn store(&self) -> &ActivationCache {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ActivationCache {
        &mut self.store
    }

    /// Stage a layer's activations in the quantized store.
    pub fn write(&mut self, g: &mut Graph, x: NodeId, layer: usize) -> NodeId {
        self.store.write(g, x, layer)
    }

    /// Commit realized staged writes.
    pub fn apply(&mut self, g: &Graph) {
        self.store.apply(g)
    }

    /// Quantize and commit realized prefill rows.
    pub fn append_rows(
        &mut self,
        layer: usize,
        raw: &[u8],
        n_tokens: usize,
        n_embd: usize,
        is_f16: bool,
    ) -> bool {
        self.store.append_rows(layer, raw, n_tokens, n_embd, is_f16)
    }

    /// Rematerialize a K/V window through caller-supplied weights.
    pub fn remat_kv(
        &self,
        g: &mut Graph,
        layer: usize,
        t0: usize,
        t1: usize,
        wk: &WeightMatrix,
        wv: &WeightMatrix,
    ) -> RematResult {
        self.store.remat_kv(g, layer, t0, t1, wk, wv)
    }
}

impl<B: SequenceMemory> SequenceMemory for QuantWrapMemory<B> {
    fn init_batch(&mut self, n_tokens: u32) -> MemoryStatus {
        self.base.init_batch(n_tokens)
    }

    fn init_full(&mut self) -> MemoryStatus {
        self.base.init_full()
    }

    fn init_update(&mut self) -> MemoryStatus {
        self.base.init_update()
    }

    fn can_shift(&self) -> bool {
        self.base.can_shift()
    }

    fn clear(&mut self, data: bool) {
        self.base.clear(data)
    }

    fn seq_rm(&mut self, seq: SeqId, p0: Pos, p1: Pos) -> bool {
        self.base.seq_rm(seq, p0, p1)
    }

    fn seq_cp(&mut self, src: SeqId, dst: SeqId, p0: Pos, p1: Pos) {
        self.base.seq_cp(src, dst, p0, p1)
    }

    fn seq_keep(&mut self, seq: SeqId) {
        self.base.seq_keep(seq)
    }

    fn seq_add(&mut self, seq: SeqId, p0: Pos, p1: Pos, delta: Pos) {
        self.base.seq_add(seq, p0, p1, delta)
    }

    fn seq_div(&mut self, seq: SeqId, p0: Pos, p1: Pos, divisor: i32) {
        self.base.seq_div(seq, p0, p1, divisor)
    }

    fn seq_pos_min(&self, seq: SeqId) -> Pos {
        self.base.seq_pos_min(seq)
    }

    fn seq_pos_max(&self, seq: SeqId) -> Pos {
        self.base.seq_pos_max(seq)
    }

    fn state_write(&self, out: &mut dyn Write) -> io::Result<()> {
        self.base.state_write(out)
    }

    fn state_read(&mut self, input: &mut dyn Read) -> io::Result<()> {
        self.base.state_read(input)
    }

    fn kind(&self) -> MemoryKind {
        MemoryKind::QuantWrap
    }
}
