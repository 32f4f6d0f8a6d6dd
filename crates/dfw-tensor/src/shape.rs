/// Row-major shape descriptor. The leading dimension is the batch axis
/// wherever a tensor holds one sample per row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Self { dims }
    }

    pub fn from_slice(dims: &[usize]) -> Self {
        Self {
            dims: dims.to_vec(),
        }
    }

    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn numel(&self) -> usize {
        self.dims.iter().product::<usize>()
    }

    /// Size of the leading (batch) dimension.
    pub fn batch(&self) -> usize {
        self.dims.first().copied().unwrap_or(1)
    }

    /// Shape of one sample, i.e. every dimension but the first.
    pub fn inner(&self) -> Shape {
        Shape::from_slice(self.dims.get(1..).unwrap_or(&[]))
    }

    /// Same inner shape with a different batch size.
    pub fn with_batch(&self, n: usize) -> Shape {
        let mut dims = self.dims.clone();
        match dims.first_mut() {
            Some(d) => *d = n,
            None => dims.push(n),
        }
        Shape::new(dims)
    }

    /// Contiguous row-major strides.
    pub fn strides(&self) -> Vec<usize> {
        let n = self.dims.len();
        let mut strides = vec![1usize; n];
        for i in (0..n.saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * self.dims[i + 1];
        }
        strides
    }

    /// Whether `other` equals the trailing dimensions of `self`, which is the
    /// only broadcast the tensor ops accept (bias rows, per-channel offsets).
    pub fn ends_with(&self, other: &Shape) -> bool {
        other.ndim() <= self.ndim() && self.dims[self.ndim() - other.ndim()..] == other.dims[..]
    }
}

impl core::ops::Index<usize> for Shape {
    type Output = usize;
    fn index(&self, i: usize) -> &usize {
        &self.dims[i]
    }
}

impl core::fmt::Display for Shape {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}", self.dims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_basics() {
        let s = Shape::from_slice(&[2, 3, 4]);
        assert_eq!(s.ndim(), 3);
        assert_eq!(s.numel(), 24);
        assert_eq!(s.strides(), vec![12, 4, 1]);
        assert_eq!(s.batch(), 2);
        assert_eq!(s.inner(), Shape::from_slice(&[3, 4]));
        assert_eq!(s.with_batch(7).dims(), &[7, 3, 4]);
    }

    #[test]
    fn trailing_match() {
        let s = Shape::from_slice(&[5, 3, 4]);
        assert!(s.ends_with(&Shape::from_slice(&[4])));
        assert!(s.ends_with(&Shape::from_slice(&[3, 4])));
        assert!(!s.ends_with(&Shape::from_slice(&[3])));
        assert!(!Shape::from_slice(&[4]).ends_with(&s));
    }
}
