//! Block quantization codec for activation rows.
//!
//! Activations are stored in GGML-style block formats: 32 elements per block,
//! each block carrying an f16 scale. Two layouts are supported:
//! - Q8: one signed byte per element (34 bytes / 32 elements)
//! - Q4: two elements per byte (18 bytes / 32 elements)
//!
//! A "row" here is one token's activation vector: `embedding_width` floats,
//! which must be a multiple of the 32-element block size.

use half::f16;
use serde::{Deserialize, Serialize};

/// Elements per quantization block.
pub const QK: usize = 32;

/// The storage format of quantized activation rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Codec {
    /// 8-bit block quantization: f16 scale + 32 signed bytes per block.
    Q8,
    /// 4-bit block quantization: f16 scale + 16 packed bytes per block.
    Q4,
}

impl Codec {
    /// Elements covered by one quantization block.
    pub fn block_size(&self) -> usize {
        QK
    }

    /// Bytes occupied by one quantization block.
    pub fn block_bytes(&self) -> usize {
        match self {
            Codec::Q8 => 2 + QK,
            Codec::Q4 => 2 + QK / 2,
        }
    }

    /// Bytes occupied by one quantized row of `width` elements.
    ///
    /// `width` must be a multiple of [`QK`]; callers validate this once at
    /// cache construction.
    pub fn row_size(&self, width: usize) -> usize {
        debug_assert!(width % QK == 0);
        (width / QK) * self.block_bytes()
    }

    /// Average bytes per element for this format.
    pub fn bytes_per_element(&self) -> f64 {
        self.block_bytes() as f64 / QK as f64
    }

    /// Quantize one row. `src.len()` must be a multiple of [`QK`] and `dst`
    /// must hold exactly `row_size(src.len())` bytes.
    pub fn quantize_row(&self, src: &[f32], dst: &mut [u8]) {
        assert!(src.len() % QK == 0);
        assert_eq!(dst.len(), self.row_size(src.len()));
        match self {
            Codec::Q8 => quantize_row_q8(src, dst),
            Codec::Q4 => quantize_row_q4(src, dst),
        }
    }

    /// Dequantize one row of `width` elements into `dst`.
    pub fn dequantize_row(&self, src: &[u8], dst: &mut [f32]) {
        assert!(dst.len() % QK == 0);
        assert_eq!(src.len(), self.row_size(dst.len()));
        match self {
            Codec::Q8 => dequantize_row_q8(src, dst),
            Codec::Q4 => dequantize_row_q4(src, dst),
        }
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Codec::Q8 => write!(f, "Q8"),
            Codec::Q4 => write!(f, "Q4"),
        }
    }
}

/// Map a requested bit width to a storage codec.
///
/// Widths without a dedicated layout fall back to Q4.
pub fn bits_to_codec(bits: u32) -> Codec {
    match bits {
        8 => Codec::Q8,
        3 | 4 => Codec::Q4,
        _ => Codec::Q4,
    }
}

fn quantize_row_q8(src: &[f32], dst: &mut [u8]) {
    let bb = Codec::Q8.block_bytes();
    for (block, out) in src.chunks_exact(QK).zip(dst.chunks_exact_mut(bb)) {
        let amax = block.iter().fold(0.0f32, |m, &v| m.max(v.abs()));
        let d = amax / 127.0;
        let id = if d != 0.0 { 1.0 / d } else { 0.0 };

        out[0..2].copy_from_slice(&f16::from_f32(d).to_le_bytes());
        for (j, &v) in block.iter().enumerate() {
            out[2 + j] = (v * id).round() as i8 as u8;
        }
    }
}

fn dequantize_row_q8(src: &[u8], dst: &mut [f32]) {
    let bb = Codec::Q8.block_bytes();
    for (bytes, block) in src.chunks_exact(bb).zip(dst.chunks_exact_mut(QK)) {
        let d = f16::from_le_bytes([bytes[0], bytes[1]]).to_f32();
        for (j, out) in block.iter_mut().enumerate() {
            *out = (bytes[2 + j] as i8) as f32 * d;
        }
    }
}

fn quantize_row_q4(src: &[f32], dst: &mut [u8]) {
    let bb = Codec::Q4.block_bytes();
    for (block, out) in src.chunks_exact(QK).zip(dst.chunks_exact_mut(bb)) {
        // Scale from the signed extremum so the value range maps onto [-8, 7].
        let mut amax = 0.0f32;
        let mut max = 0.0f32;
        for &v in block {
            if v.abs() > amax {
                amax = v.abs();
                max = v;
            }
        }
        let d = max / -8.0;
        let id = if d != 0.0 { 1.0 / d } else { 0.0 };

        out[0..2].copy_from_slice(&f16::from_f32(d).to_le_bytes());
        for j in 0..QK / 2 {
            let x0 = block[j] * id + 8.5;
            let x1 = block[j + QK / 2] * id + 8.5;
            let q0 = (x0 as u8).min(15);
            let q1 = (x1 as u8).min(15);
            out[2 + j] = q0 | (q1 << 4);
        }
    }
}

fn dequantize_row_q4(src: &[u8], dst: &mut [f32]) {
    let bb = Codec::Q4.block_bytes();
    for (bytes, block) in src.chunks_exact(bb).zip(dst.chunks_exact_mut(QK)) {
        let d = f16::from_le_bytes([bytes[0], bytes[1]]).to_f32();
        for j in 0..QK / 2 {
            let q = bytes[2 + j];
            block[j] = ((q & 0x0F) as i32 - 8) as f32 * d;
            block[j + QK / 2] = ((q >> 4) as i32 - 8) as f32 * d;
        }
    }
}
