use dfw_tensor::{Shape, Tensor};

use crate::{Module, Parameter};

/// Fully-connected layer: `y = x W^T + b` on `[batch, in_features]` input.
pub struct Linear {
    pub weight: Parameter, // [out_features, in_features]
    pub bias: Parameter,   // [out_features]
    cached_input: Option<Tensor>,
}

impl Linear {
    pub fn new(in_features: usize, out_features: usize, seed: u64) -> Self {
        Self {
            weight: Parameter::randn(Shape::from_slice(&[out_features, in_features]), seed),
            bias: Parameter::zeros(Shape::from_slice(&[out_features])),
            cached_input: None,
        }
    }

    /// A layer whose output starts at exactly zero.
    pub fn zeroed(in_features: usize, out_features: usize) -> Self {
        Self {
            weight: Parameter::zeros(Shape::from_slice(&[out_features, in_features])),
            bias: Parameter::zeros(Shape::from_slice(&[out_features])),
            cached_input: None,
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape()[1]
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape()[0]
    }
}

impl Module for Linear {
    fn forward(&mut self, input: &Tensor) -> Tensor {
        let out = self.predict(input);
        self.cached_input = Some(input.clone());
        out
    }

    fn predict(&self, input: &Tensor) -> Tensor {
        assert_eq!(input.ndim(), 2, "Linear input must be [batch, in_features]");
        input.matmul(&self.weight.data.transpose()).add(&self.bias.data)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        let input = self
            .cached_input
            .take()
            .expect("Linear::backward called before forward");

        // [out, batch] @ [batch, in] = [out, in]
        let grad_w = grad_output.transpose().matmul(&input);
        self.weight.accumulate_grad(&grad_w);
        self.bias.accumulate_grad(&grad_output.sum_rows());

        // [batch, out] @ [out, in] = [batch, in]
        grad_output.matmul(&self.weight.data)
    }

    fn parameters(&self) -> Vec<&Parameter> {
        vec![&self.weight, &self.bias]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.weight, &mut self.bias]
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        vec![
            ("weight".to_string(), &self.weight),
            ("bias".to_string(), &self.bias),
        ]
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Parameter)> {
        vec![
            ("weight".to_string(), &mut self.weight),
            ("bias".to_string(), &mut self.bias),
        ]
    }
}

/// Leaky ReLU: `x` for positive input, `slope * x` otherwise.
pub struct LeakyReLU {
    pub slope: f64,
    cached_input: Option<Tensor>,
}

impl LeakyReLU {
    pub fn new(slope: f64) -> Self {
        Self {
            slope,
            cached_input: None,
        }
    }
}

impl Default for LeakyReLU {
    fn default() -> Self {
        Self::new(0.2)
    }
}

impl Module for LeakyReLU {
    fn forward(&mut self, input: &Tensor) -> Tensor {
        self.cached_input = Some(input.clone());
        self.predict(input)
    }

    fn predict(&self, input: &Tensor) -> Tensor {
        let slope = self.slope;
        input.map(|v| if v > 0.0 { v } else { slope * v })
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        let input = self
            .cached_input
            .take()
            .expect("LeakyReLU::backward called before forward");
        let slope = self.slope;
        grad_output.zip_with(&input, |g, x| if x > 0.0 { g } else { slope * g })
    }

    fn parameters(&self) -> Vec<&Parameter> {
        Vec::new()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        Vec::new()
    }
}

/// Sequential container: chains modules in order.
pub struct Sequential {
    layers: Vec<Box<dyn Module>>,
}

impl Sequential {
    pub fn new(layers: Vec<Box<dyn Module>>) -> Self {
        Self { layers }
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Module for Sequential {
    fn forward(&mut self, input: &Tensor) -> Tensor {
        let mut x = input.clone();
        for layer in &mut self.layers {
            x = layer.forward(&x);
        }
        x
    }

    fn predict(&self, input: &Tensor) -> Tensor {
        self.layers
            .iter()
            .fold(input.clone(), |x, layer| layer.predict(&x))
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        let mut grad = grad_output.clone();
        for layer in self.layers.iter_mut().rev() {
            grad = layer.backward(&grad);
        }
        grad
    }

    fn parameters(&self) -> Vec<&Parameter> {
        self.layers.iter().flat_map(|l| l.parameters()).collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.layers
            .iter_mut()
            .flat_map(|l| l.parameters_mut())
            .collect()
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        self.layers
            .iter()
            .enumerate()
            .flat_map(|(i, layer)| {
                layer
                    .named_parameters()
                    .into_iter()
                    .map(move |(name, param)| (format!("{i}.{name}"), param))
            })
            .collect()
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Parameter)> {
        self.layers
            .iter_mut()
            .enumerate()
            .flat_map(|(i, layer)| {
                layer
                    .named_parameters_mut()
                    .into_iter()
                    .map(move |(name, param)| (format!("{i}.{name}"), param))
            })
            .collect()
    }
}

/// Residual wrapper: `y = x + f(x)`. The branch must preserve the shape.
pub struct Residual<M: Module> {
    pub branch: M,
}

impl<M: Module> Residual<M> {
    pub fn new(branch: M) -> Self {
        Self { branch }
    }
}

impl<M: Module> Module for Residual<M> {
    fn forward(&mut self, input: &Tensor) -> Tensor {
        input.add(&self.branch.forward(input))
    }

    fn predict(&self, input: &Tensor) -> Tensor {
        input.add(&self.branch.predict(input))
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        grad_output.add(&self.branch.backward(grad_output))
    }

    fn parameters(&self) -> Vec<&Parameter> {
        self.branch.parameters()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.branch.parameters_mut()
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        self.branch.named_parameters()
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Parameter)> {
        self.branch.named_parameters_mut()
    }
}
