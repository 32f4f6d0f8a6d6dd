use dfw_tensor::{Shape, Tensor};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

/// A trainable tensor with an associated gradient buffer.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub data: Tensor,
    pub grad: Option<Tensor>,
}

impl Parameter {
    pub fn new(data: Tensor) -> Self {
        Self { data, grad: None }
    }

    pub fn zeros(shape: Shape) -> Self {
        Self::new(Tensor::zeros(shape))
    }

    /// Xavier/Glorot normal initialisation, reproducible from `seed`.
    pub fn randn(shape: Shape, seed: u64) -> Self {
        let dims = shape.dims();
        let (fan_in, fan_out) = match dims {
            [] => (1.0, 1.0),
            [n] => (*n as f64, *n as f64),
            [.., out, inp] => (*inp as f64, *out as f64),
        };
        let std = (2.0 / (fan_in + fan_out)).sqrt();
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let data = (0..shape.numel())
            .map(|_| std * rng.sample::<f64, _>(StandardNormal))
            .collect();
        Self::new(Tensor::new(data, shape))
    }

    /// Add `grad` into the gradient buffer, allocating it on first use.
    pub fn accumulate_grad(&mut self, grad: &Tensor) {
        match &mut self.grad {
            Some(g) => g.add_assign(grad),
            None => self.grad = Some(grad.clone()),
        }
    }

    pub fn zero_grad(&mut self) {
        self.grad = None;
    }

    pub fn shape(&self) -> &Shape {
        self.data.shape()
    }
}
