use crate::Shape;

/// Dense row-major `f64` tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: Vec<f64>,
    shape: Shape,
}

impl Tensor {
    /// Create a tensor from flat data and shape.
    pub fn new(data: Vec<f64>, shape: Shape) -> Self {
        assert_eq!(
            data.len(),
            shape.numel(),
            "tensor data length does not match shape {shape}"
        );
        Self { data, shape }
    }

    pub fn zeros(shape: Shape) -> Self {
        Self::full(shape, 0.0)
    }

    pub fn ones(shape: Shape) -> Self {
        Self::full(shape, 1.0)
    }

    pub fn full(shape: Shape, value: f64) -> Self {
        let n = shape.numel();
        Self::new(vec![value; n], shape)
    }

    pub fn zeros_like(other: &Tensor) -> Self {
        Self::zeros(other.shape.clone())
    }

    /// Create a tensor from a closure over the multi-index.
    pub fn from_fn(shape: Shape, f: impl Fn(&[usize]) -> f64) -> Self {
        let n = shape.numel();
        let ndim = shape.ndim();
        let mut data = Vec::with_capacity(n);
        let mut idx = vec![0usize; ndim];

        for _ in 0..n {
            data.push(f(&idx));
            for d in (0..ndim).rev() {
                idx[d] += 1;
                if idx[d] < shape[d] {
                    break;
                }
                idx[d] = 0;
            }
        }
        Self { data, shape }
    }

    pub fn scalar(value: f64) -> Self {
        Self::new(vec![value], Shape::scalar())
    }

    /// 1-D tensor from slice.
    pub fn from_slice(s: &[f64]) -> Self {
        Self::new(s.to_vec(), Shape::from_slice(&[s.len()]))
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }
    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }
    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }
    pub fn numel(&self) -> usize {
        self.data.len()
    }
    pub fn data(&self) -> &[f64] {
        &self.data
    }
    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }
    pub fn into_data(self) -> Vec<f64> {
        self.data
    }

    fn flat_index(&self, idx: &[usize]) -> usize {
        debug_assert_eq!(idx.len(), self.ndim());
        idx.iter()
            .zip(self.shape.strides())
            .map(|(i, s)| i * s)
            .sum()
    }

    pub fn get(&self, idx: &[usize]) -> f64 {
        self.data[self.flat_index(idx)]
    }

    pub fn set(&mut self, idx: &[usize], val: f64) {
        let fi = self.flat_index(idx);
        self.data[fi] = val;
    }

    /// Reshape to a new shape with the same number of elements.
    pub fn reshape(&self, new_shape: Shape) -> Self {
        assert_eq!(
            self.numel(),
            new_shape.numel(),
            "reshape: cannot view {} as {new_shape}",
            self.shape
        );
        Self::new(self.data.clone(), new_shape)
    }

    /// Collapse every non-batch dimension: `[N, ...]` → `[N, F]`.
    pub fn flatten_batch(&self) -> Self {
        let n = self.batch_len();
        let f = if n == 0 { 0 } else { self.numel() / n };
        self.reshape(Shape::from_slice(&[n, f]))
    }

    /// Transpose a 2-D tensor.
    pub fn transpose(&self) -> Self {
        assert_eq!(self.ndim(), 2, "transpose requires a 2-D tensor");
        let (rows, cols) = (self.shape[0], self.shape[1]);
        let mut data = vec![0.0; rows * cols];
        for r in 0..rows {
            for c in 0..cols {
                data[c * rows + r] = self.data[r * cols + c];
            }
        }
        Self::new(data, Shape::from_slice(&[cols, rows]))
    }

    // --- Element-wise operations ---

    pub fn map(&self, f: impl Fn(f64) -> f64) -> Self {
        let data = self.data.iter().map(|&v| f(v)).collect();
        Self::new(data, self.shape.clone())
    }

    /// Element-wise binary operation. `other` must either match the shape of
    /// `self` or match its trailing dimensions, in which case it is repeated
    /// over the leading ones.
    pub fn zip_with(&self, other: &Self, f: impl Fn(f64, f64) -> f64) -> Self {
        if self.shape == other.shape {
            let data = self
                .data
                .iter()
                .zip(&other.data)
                .map(|(&a, &b)| f(a, b))
                .collect();
            return Self::new(data, self.shape.clone());
        }

        assert!(
            self.shape.ends_with(&other.shape) && other.numel() > 0,
            "zip_with: cannot broadcast {} onto {}",
            other.shape,
            self.shape
        );
        let period = other.numel();
        let data = self
            .data
            .iter()
            .enumerate()
            .map(|(i, &a)| f(a, other.data[i % period]))
            .collect();
        Self::new(data, self.shape.clone())
    }

    pub fn add(&self, other: &Self) -> Self {
        self.zip_with(other, |a, b| a + b)
    }

    pub fn sub(&self, other: &Self) -> Self {
        self.zip_with(other, |a, b| a - b)
    }

    pub fn mul(&self, other: &Self) -> Self {
        self.zip_with(other, |a, b| a * b)
    }

    pub fn scale(&self, s: f64) -> Self {
        self.map(|v| v * s)
    }

    pub fn neg(&self) -> Self {
        self.map(|v| -v)
    }

    /// In-place `self += other` for equal shapes.
    pub fn add_assign(&mut self, other: &Self) {
        assert_eq!(self.shape, other.shape, "add_assign: shape mismatch");
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a += b;
        }
    }

    pub fn clamp(&self, lo: f64, hi: f64) -> Self {
        self.map(|v| v.clamp(lo, hi))
    }

    pub fn abs(&self) -> Self {
        self.map(f64::abs)
    }

    /// Logistic sigmoid, evaluated without overflow for large |x|.
    pub fn sigmoid(&self) -> Self {
        self.map(sigmoid)
    }

    // --- Reductions ---

    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }

    pub fn mean(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.sum() / self.numel() as f64
    }

    pub fn max(&self) -> f64 {
        self.data.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn max_abs(&self) -> f64 {
        self.data.iter().fold(0.0, |m, v| m.max(v.abs()))
    }

    /// Sum over the leading axis: `[N, ...]` → `[...]`.
    pub fn sum_rows(&self) -> Self {
        let inner = self.shape.inner();
        let width = inner.numel();
        let mut out = vec![0.0; width];
        for row in self.data.chunks_exact(width.max(1)) {
            for (o, v) in out.iter_mut().zip(row) {
                *o += v;
            }
        }
        Self::new(out, inner)
    }

    /// L2 norm of every sample (all non-batch dimensions).
    pub fn row_norms(&self) -> Vec<f64> {
        self.rows()
            .map(|row| row.iter().map(|v| v * v).sum::<f64>().sqrt())
            .collect()
    }

    // --- Matrix operations ---

    /// Matrix multiply for 2-D tensors: `[m, k] @ [k, n]`.
    pub fn matmul(&self, other: &Self) -> Self {
        assert_eq!(self.ndim(), 2, "matmul: lhs must be 2-D");
        assert_eq!(other.ndim(), 2, "matmul: rhs must be 2-D");
        let (m, k) = (self.shape[0], self.shape[1]);
        let n = other.shape[1];
        assert_eq!(
            other.shape[0], k,
            "matmul: inner dimensions differ ({} vs {})",
            self.shape, other.shape
        );

        let mut out = vec![0.0; m * n];
        for i in 0..m {
            let lhs = &self.data[i * k..(i + 1) * k];
            let dst = &mut out[i * n..(i + 1) * n];
            for (p, &a) in lhs.iter().enumerate() {
                if a == 0.0 {
                    continue;
                }
                let rhs = &other.data[p * n..(p + 1) * n];
                for (o, &b) in dst.iter_mut().zip(rhs) {
                    *o += a * b;
                }
            }
        }
        Self::new(out, Shape::from_slice(&[m, n]))
    }

    // --- Batch helpers ---

    /// Size of the leading dimension.
    pub fn batch_len(&self) -> usize {
        self.shape.batch()
    }

    /// Iterate over the samples of a batch as flat slices.
    pub fn rows(&self) -> impl Iterator<Item = &[f64]> {
        let n = self.batch_len();
        let width = if n == 0 { 1 } else { self.numel() / n };
        self.data.chunks_exact(width.max(1))
    }

    /// One sample of a batch: `[N, ...]` → `[...]`.
    pub fn sample(&self, index: usize) -> Self {
        let inner = self.shape.inner();
        let width = inner.numel();
        Self::new(
            self.data[index * width..(index + 1) * width].to_vec(),
            inner,
        )
    }

    /// Gather samples by index into a new batch.
    pub fn select(&self, indices: &[usize]) -> Self {
        let inner = self.shape.inner();
        let width = inner.numel();
        let mut data = Vec::with_capacity(indices.len() * width);
        for &i in indices {
            data.extend_from_slice(&self.data[i * width..(i + 1) * width]);
        }
        Self::new(data, self.shape.with_batch(indices.len()))
    }

    /// Repeat one sample `n` times: `[...]` → `[n, ...]`.
    pub fn repeat_rows(&self, n: usize) -> Self {
        let mut dims = Vec::with_capacity(self.ndim() + 1);
        dims.push(n);
        dims.extend_from_slice(self.dims());
        let mut data = Vec::with_capacity(n * self.numel());
        for _ in 0..n {
            data.extend_from_slice(&self.data);
        }
        Self::new(data, Shape::new(dims))
    }

    /// Stack tensors of identical shape along a new leading dimension.
    pub fn stack(tensors: &[&Tensor]) -> Self {
        assert!(!tensors.is_empty(), "stack: need at least one tensor");
        let inner = tensors[0].shape();
        let mut dims = Vec::with_capacity(inner.ndim() + 1);
        dims.push(tensors.len());
        dims.extend_from_slice(inner.dims());

        let mut data = Vec::with_capacity(tensors.len() * inner.numel());
        for t in tensors {
            assert_eq!(t.shape(), inner, "stack: all tensors must have same shape");
            data.extend_from_slice(t.data());
        }
        Self::new(data, Shape::new(dims))
    }

    /// Concatenate batches along the leading dimension.
    pub fn concat(batches: &[&Tensor]) -> Self {
        assert!(!batches.is_empty(), "concat: need at least one tensor");
        let inner = batches[0].shape().inner();
        let mut n = 0;
        let mut data = Vec::new();
        for b in batches {
            assert_eq!(b.shape().inner(), inner, "concat: sample shapes differ");
            n += b.batch_len();
            data.extend_from_slice(b.data());
        }
        Self::new(data, batches[0].shape().with_batch(n))
    }
}

/// Logistic sigmoid on a scalar.
pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}
