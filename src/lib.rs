//! kv-remat: Quantized activation cache for LLM inference.
//!
//! Trades memory for recomputation: instead of caching full-precision K and
//! V tensors per layer, the cache stores a block-quantized copy of the
//! pre-projection hidden state and rematerializes K/V on demand by
//! reprojecting the dequantized activations. Quantized X is far smaller than
//! FP16 K+V combined, and the reprojection is cheap relative to the memory
//! saved over long sequences.

pub mod cache;
pub mod config;
pub mod graph;
pub mod memory;
pub mod quant;
pub mod svd;
