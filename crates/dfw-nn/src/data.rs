use dfw_tensor::{Shape, Tensor};
use rand::seq::SliceRandom;
use rand::Rng;

/// An indexable collection of equally-shaped samples.
pub trait Dataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shape of one sample, without the batch axis.
    fn sample_shape(&self) -> Shape;

    fn get(&self, index: usize) -> Tensor;
}

/// Dataset backed by one `[N, ...]` tensor.
pub struct TensorDataset {
    samples: Tensor,
}

impl TensorDataset {
    pub fn new(samples: Tensor) -> Self {
        assert!(samples.ndim() >= 1, "TensorDataset needs a batch axis");
        Self { samples }
    }

    pub fn tensor(&self) -> &Tensor {
        &self.samples
    }
}

impl Dataset for TensorDataset {
    fn len(&self) -> usize {
        self.samples.batch_len()
    }

    fn sample_shape(&self) -> Shape {
        self.samples.shape().inner()
    }

    fn get(&self, index: usize) -> Tensor {
        self.samples.sample(index)
    }
}

/// Iterates over a dataset in `[batch, ...]` tensors. The last batch may be
/// short.
pub struct DataLoader<'a, D: Dataset + ?Sized> {
    dataset: &'a D,
    batch_size: usize,
    indices: Vec<usize>,
    position: usize,
}

impl<'a, D: Dataset + ?Sized> DataLoader<'a, D> {
    pub fn new(dataset: &'a D, batch_size: usize) -> Self {
        assert!(batch_size > 0, "DataLoader batch_size must be positive");
        Self {
            dataset,
            batch_size,
            indices: (0..dataset.len()).collect(),
            position: 0,
        }
    }

    /// Permute the visiting order.
    pub fn shuffle<R: Rng + ?Sized>(mut self, rng: &mut R) -> Self {
        self.indices.shuffle(rng);
        self
    }

    pub fn num_batches(&self) -> usize {
        self.indices.len().div_ceil(self.batch_size)
    }
}

impl<'a, D: Dataset + ?Sized> Iterator for DataLoader<'a, D> {
    type Item = Tensor;

    fn next(&mut self) -> Option<Tensor> {
        if self.position >= self.indices.len() {
            return None;
        }
        let end = (self.position + self.batch_size).min(self.indices.len());
        let samples: Vec<Tensor> = self.indices[self.position..end]
            .iter()
            .map(|&i| self.dataset.get(i))
            .collect();
        self.position = end;

        let refs: Vec<&Tensor> = samples.iter().collect();
        Some(Tensor::stack(&refs))
    }
}
