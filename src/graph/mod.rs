//! Minimal deferred compute graph for cache rematerialization.
//!
//! The cache never executes numeric work at call time. `write` stages a
//! quantize node, `get_k`/`get_v` build a dequantize-concat-project chain,
//! and the caller decides when to realize results with [`Graph::compute`].
//! Until then a node is just a handle; [`Graph::is_realized`] is the cheap
//! readiness check the commit path polls.
//!
//! Tensors are column-major: shape `[ne0, ne1, ne2]` with `ne0` contiguous.
//! For activations that means `[embedding_width, n_tokens]`, one token per
//! column.

use bytes::Bytes;
use half::f16;
use thiserror::Error;

use crate::quant::Codec;

/// Element type of a tensor node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    F32,
    F16,
    /// Block-quantized rows in the given codec layout.
    Quant(Codec),
}

impl DType {
    /// Bytes occupied by one `ne0`-extent (one column of a 2-D tensor).
    pub fn col_bytes(&self, ne0: usize) -> usize {
        match self {
            DType::F32 => ne0 * 4,
            DType::F16 => ne0 * 2,
            DType::Quant(codec) => codec.row_size(ne0),
        }
    }
}

/// Tensor extents, up to three dimensions. Trailing dimensions are 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shape {
    ne: [usize; 3],
}

impl Shape {
    pub fn d1(ne0: usize) -> Self {
        Self { ne: [ne0, 1, 1] }
    }

    pub fn d2(ne0: usize, ne1: usize) -> Self {
        Self { ne: [ne0, ne1, 1] }
    }

    pub fn d3(ne0: usize, ne1: usize, ne2: usize) -> Self {
        Self { ne: [ne0, ne1, ne2] }
    }

    pub fn ne(&self, dim: usize) -> usize {
        self.ne[dim]
    }

    pub fn elements(&self) -> usize {
        self.ne[0] * self.ne[1] * self.ne[2]
    }

    /// Number of `ne0`-extents (columns) behind the leading dimension.
    pub fn cols(&self) -> usize {
        self.ne[1] * self.ne[2]
    }

    pub fn rank(&self) -> usize {
        if self.ne[2] != 1 {
            3
        } else if self.ne[1] != 1 {
            2
        } else {
            1
        }
    }

    fn byte_len(&self, dtype: DType) -> usize {
        dtype.col_bytes(self.ne[0]) * self.cols()
    }
}

/// Handle to a node in a [`Graph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug, Clone)]
enum Op {
    Leaf,
    Cast(NodeId),
    Transpose(NodeId),
    Concat(NodeId, NodeId),
    MatMul { w: NodeId, x: NodeId },
    Reshape(NodeId),
    ViewCols { src: NodeId, start: usize },
}

impl Op {
    fn deps(&self) -> [Option<NodeId>; 2] {
        match *self {
            Op::Leaf => [None, None],
            Op::Cast(a) | Op::Transpose(a) | Op::Reshape(a) | Op::ViewCols { src: a, .. } => {
                [Some(a), None]
            }
            Op::Concat(a, b) => [Some(a), Some(b)],
            Op::MatMul { w, x } => [Some(w), Some(x)],
        }
    }
}

#[derive(Debug)]
struct Node {
    op: Op,
    dtype: DType,
    shape: Shape,
    data: Option<Bytes>,
}

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("node {0:?} has no realized data")]
    Unrealized(NodeId),
}

/// Arena of deferred tensor operations.
#[derive(Debug, Default)]
pub struct Graph {
    nodes: Vec<Node>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, op: Op, dtype: DType, shape: Shape, data: Option<Bytes>) -> NodeId {
        self.nodes.push(Node {
            op,
            dtype,
            shape,
            data,
        });
        NodeId(self.nodes.len() - 1)
    }

    /// New leaf with no backing data yet; fill it later with [`Graph::set_data`].
    pub fn leaf(&mut self, dtype: DType, shape: Shape) -> NodeId {
        self.push(Op::Leaf, dtype, shape, None)
    }

    /// New leaf backed by `data`, which must match the shape's byte length.
    pub fn leaf_with_data(&mut self, dtype: DType, shape: Shape, data: Bytes) -> NodeId {
        assert_eq!(data.len(), shape.byte_len(dtype));
        self.push(Op::Leaf, dtype, shape, Some(data))
    }

    /// Attach backing data to a leaf created with [`Graph::leaf`].
    pub fn set_data(&mut self, id: NodeId, data: Bytes) {
        let node = &mut self.nodes[id.0];
        assert_eq!(data.len(), node.shape.byte_len(node.dtype));
        node.data = Some(data);
    }

    pub fn dtype(&self, id: NodeId) -> DType {
        self.nodes[id.0].dtype
    }

    pub fn shape(&self, id: NodeId) -> Shape {
        self.nodes[id.0].shape
    }

    /// Whether the node's output buffer holds concrete data.
    pub fn is_realized(&self, id: NodeId) -> bool {
        self.nodes[id.0].data.is_some()
    }

    /// The realized bytes of a node, if any.
    pub fn data(&self, id: NodeId) -> Option<&Bytes> {
        self.nodes[id.0].data.as_ref()
    }

    /// The realized contents of a node as f32 values, if any.
    pub fn data_f32(&self, id: NodeId) -> Option<Vec<f32>> {
        let node = &self.nodes[id.0];
        node.data
            .as_ref()
            .map(|bytes| to_f32(node.dtype, node.shape.ne(0), bytes))
    }

    /// Elementwise or quantizing type conversion.
    ///
    /// Quantized targets and sources require `ne0` to be a multiple of the
    /// codec block size and at most two dimensions.
    pub fn cast(&mut self, src: NodeId, dtype: DType) -> NodeId {
        let shape = self.shape(src);
        if let DType::Quant(codec) = dtype {
            assert!(shape.rank() <= 2 && shape.ne(0) % codec.block_size() == 0);
        }
        if let DType::Quant(codec) = self.dtype(src) {
            assert!(shape.ne(0) % codec.block_size() == 0);
        }
        self.push(Op::Cast(src), dtype, shape, None)
    }

    /// Physical 2-D transpose. F32 only.
    pub fn transpose2d(&mut self, src: NodeId) -> NodeId {
        let shape = self.shape(src);
        assert!(self.dtype(src) == DType::F32 && shape.rank() <= 2);
        let out = Shape::d2(shape.ne(1), shape.ne(0));
        self.push(Op::Transpose(src), DType::F32, out, None)
    }

    /// Concatenate along the column (token) axis.
    pub fn concat_cols(&mut self, a: NodeId, b: NodeId) -> NodeId {
        let (sa, sb) = (self.shape(a), self.shape(b));
        assert_eq!(self.dtype(a), self.dtype(b));
        assert_eq!(sa.ne(0), sb.ne(0));
        assert!(sa.rank() <= 2 && sb.rank() <= 2);
        let out = Shape::d2(sa.ne(0), sa.ne(1) + sb.ne(1));
        self.push(Op::Concat(a, b), self.dtype(a), out, None)
    }

    /// `matmul(W[k,n], X[k,m]) -> [n,m]` in F32: column `i` of the output is
    /// the projection of column `i` of `X` through `W`.
    pub fn matmul(&mut self, w: NodeId, x: NodeId) -> NodeId {
        let (sw, sx) = (self.shape(w), self.shape(x));
        assert!(sw.rank() <= 2 && sx.rank() <= 2);
        assert_eq!(sw.ne(0), sx.ne(0));
        let out = Shape::d2(sw.ne(1), sx.ne(1));
        self.push(Op::MatMul { w, x }, DType::F32, out, None)
    }

    /// Reinterpret extents without moving data. Quantized nodes must keep
    /// their leading dimension.
    pub fn reshape(&mut self, src: NodeId, shape: Shape) -> NodeId {
        let old = self.shape(src);
        assert_eq!(old.elements(), shape.elements());
        if matches!(self.dtype(src), DType::Quant(_)) {
            assert_eq!(old.ne(0), shape.ne(0));
        }
        self.push(Op::Reshape(src), self.dtype(src), shape, None)
    }

    /// Slice `len` columns starting at `start`.
    pub fn view_cols(&mut self, src: NodeId, start: usize, len: usize) -> NodeId {
        let shape = self.shape(src);
        assert!(shape.rank() <= 2);
        assert!(start + len <= shape.ne(1));
        let out = Shape::d2(shape.ne(0), len);
        self.push(Op::ViewCols { src, start }, self.dtype(src), out, None)
    }

    /// Realize a node and everything it depends on.
    ///
    /// Fails if any reachable leaf has no backing data; nothing realized so
    /// far is rolled back (already-realized nodes are reused as-is).
    pub fn compute(&mut self, id: NodeId) -> Result<(), GraphError> {
        if self.nodes[id.0].data.is_some() {
            return Ok(());
        }
        for dep in self.nodes[id.0].op.deps().into_iter().flatten() {
            self.compute(dep)?;
        }
        let out = self.eval(id)?;
        self.nodes[id.0].data = Some(out);
        Ok(())
    }

    fn eval(&self, id: NodeId) -> Result<Bytes, GraphError> {
        let node = &self.nodes[id.0];
        // compute() realizes dependencies before evaluating a node.
        let input = |dep: NodeId| {
            self.nodes[dep.0]
                .data
                .as_ref()
                .expect("dependency realized before eval")
        };
        let out = match node.op {
            Op::Leaf => return Err(GraphError::Unrealized(id)),
            Op::Cast(src) => {
                let s = &self.nodes[src.0];
                let vals = to_f32(s.dtype, s.shape.ne(0), input(src));
                from_f32(node.dtype, node.shape.ne(0), &vals)
            }
            Op::Transpose(src) => {
                let s = &self.nodes[src.0];
                let vals = to_f32(DType::F32, s.shape.ne(0), input(src));
                let (n0, n1) = (s.shape.ne(0), s.shape.ne(1));
                let mut out = vec![0f32; vals.len()];
                for i1 in 0..n1 {
                    for i0 in 0..n0 {
                        out[i0 * n1 + i1] = vals[i1 * n0 + i0];
                    }
                }
                bytemuck::cast_slice(&out).to_vec()
            }
            Op::Concat(a, b) => {
                let mut out = Vec::with_capacity(input(a).len() + input(b).len());
                out.extend_from_slice(input(a));
                out.extend_from_slice(input(b));
                out
            }
            Op::MatMul { w, x } => {
                let (sw, sx) = (&self.nodes[w.0], &self.nodes[x.0]);
                let wf = to_f32(sw.dtype, sw.shape.ne(0), input(w));
                let xf = to_f32(sx.dtype, sx.shape.ne(0), input(x));
                let k = sw.shape.ne(0);
                let n = sw.shape.ne(1);
                let m = sx.shape.ne(1);
                let mut out = vec![0f32; n * m];
                for j in 0..m {
                    for i in 0..n {
                        let mut acc = 0f32;
                        for t in 0..k {
                            acc += wf[i * k + t] * xf[j * k + t];
                        }
                        out[j * n + i] = acc;
                    }
                }
                bytemuck::cast_slice(&out).to_vec()
            }
            Op::Reshape(src) => return Ok(input(src).clone()),
            Op::ViewCols { src, start } => {
                let s = &self.nodes[src.0];
                let bpc = s.dtype.col_bytes(s.shape.ne(0));
                let len = node.shape.ne(1);
                return Ok(input(src).slice(start * bpc..(start + len) * bpc));
            }
        };
        Ok(Bytes::from(out))
    }
}

/// Decode a realized buffer to f32 values, row-wise for quantized layouts.
fn to_f32(dtype: DType, ne0: usize, bytes: &[u8]) -> Vec<f32> {
    match dtype {
        DType::F32 => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        DType::F16 => bytes
            .chunks_exact(2)
            .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        DType::Quant(codec) => {
            let row_bytes = codec.row_size(ne0);
            let rows = bytes.len() / row_bytes;
            let mut out = vec![0f32; rows * ne0];
            for (row, chunk) in bytes.chunks_exact(row_bytes).enumerate() {
                codec.dequantize_row(chunk, &mut out[row * ne0..(row + 1) * ne0]);
            }
            out
        }
    }
}

/// Encode f32 values into a buffer of the given dtype, row-wise for
/// quantized layouts.
fn from_f32(dtype: DType, ne0: usize, vals: &[f32]) -> Vec<u8> {
    match dtype {
        DType::F32 => bytemuck::cast_slice(vals).to_vec(),
        DType::F16 => vals
            .iter()
            .flat_map(|&v| f16::from_f32(v).to_le_bytes())
            .collect(),
        DType::Quant(codec) => {
            let row_bytes = codec.row_size(ne0);
            let rows = vals.len() / ne0;
            let mut out = vec![0u8; rows * row_bytes];
            for (row, chunk) in vals.chunks_exact(ne0).enumerate() {
                codec.quantize_row(chunk, &mut out[row * row_bytes..(row + 1) * row_bytes]);
            }
            out
        }
    }
}

/// Bytes for an f32 slice, for building leaf tensors.
pub fn f32_bytes(vals: &[f32]) -> Bytes {
    Bytes::from(bytemuck::cast_slice::<f32, u8>(vals).to_vec())
}

/// Bytes for an f16 slice encoded from f32 values.
pub fn f16_bytes(vals: &[f32]) -> Bytes {
    Bytes::from(from_f32(DType::F16, vals.len(), vals))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quant::Codec;

    #[test]
    fn test_leaf_without_data_fails_compute() {
        let mut g = Graph::new();
        let x = g.leaf(DType::F32, Shape::d2(4, 2));
        let y = g.cast(x, DType::F16);
        assert!(!g.is_realized(x));
        assert!(matches!(g.compute(y), Err(GraphError::Unrealized(_))));
    }

    #[test]
    fn test_set_data_then_compute() {
        let mut g = Graph::new();
        let x = g.leaf(DType::F32, Shape::d2(2, 2));
        let y = g.cast(x, DType::F32);
        g.set_data(x, f32_bytes(&[1.0, 2.0, 3.0, 4.0]));
        g.compute(y).unwrap();
        assert_eq!(g.data_f32(y).unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_concat_and_view() {
        let mut g = Graph::new();
        let a = g.leaf_with_data(DType::F32, Shape::d2(2, 1), f32_bytes(&[1.0, 2.0]));
        let b = g.leaf_with_data(DType::F32, Shape::d2(2, 2), f32_bytes(&[3.0, 4.0, 5.0, 6.0]));
        let cat = g.concat_cols(a, b);
        assert_eq!(g.shape(cat).ne(1), 3);
        let tail = g.view_cols(cat, 1, 2);
        g.compute(tail).unwrap();
        assert_eq!(g.data_f32(tail).unwrap(), vec![3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_matmul_identity() {
        let mut g = Graph::new();
        // 2x2 identity in column-major layout.
        let w = g.leaf_with_data(DType::F32, Shape::d2(2, 2), f32_bytes(&[1.0, 0.0, 0.0, 1.0]));
        let x = g.leaf_with_data(DType::F32, Shape::d2(2, 3), f32_bytes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]));
        let y = g.matmul(w, x);
        g.compute(y).unwrap();
        assert_eq!(g.shape(y), Shape::d2(2, 3));
        assert_eq!(g.data_f32(y).unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_transpose_roundtrip() {
        let mut g = Graph::new();
        let x = g.leaf_with_data(DType::F32, Shape::d2(2, 3), f32_bytes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]));
        let t = g.transpose2d(x);
        let tt = g.transpose2d(t);
        g.compute(tt).unwrap();
        assert_eq!(g.shape(t), Shape::d2(3, 2));
        assert_eq!(g.data_f32(tt).unwrap(), g.data_f32(x).unwrap());
    }

    #[test]
    fn test_quantize_cast_shapes() {
        let mut g = Graph::new();
        let vals: Vec<f32> = (0..64).map(|i| i as f32 * 0.1).collect();
        let x = g.leaf_with_data(DType::F32, Shape::d2(32, 2), f32_bytes(&vals));
        let q = g.cast(x, DType::Quant(Codec::Q8));
        let back = g.cast(q, DType::F32);
        g.compute(back).unwrap();
        assert_eq!(g.data(q).unwrap().len(), Codec::Q8.row_size(32) * 2);
        let out = g.data_f32(back).unwrap();
        assert_eq!(out.len(), 64);
        for (a, b) in vals.iter().zip(&out) {
            assert!((a - b).abs() < 0.05, "{a} vs {b}");
        }
    }
}
