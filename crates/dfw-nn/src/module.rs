use dfw_tensor::Tensor;

use crate::Parameter;

/// A differentiable network component with hand-written backward pass.
///
/// `forward` caches whatever `backward` needs; `predict` is the same
/// computation without caching and without touching gradients, used for
/// validation and evaluation.
pub trait Module: Send {
    /// Forward pass, recording state for a later `backward`.
    fn forward(&mut self, input: &Tensor) -> Tensor;

    /// Forward pass without recording anything.
    fn predict(&self, input: &Tensor) -> Tensor;

    /// Backpropagate `grad_output`, accumulating parameter gradients and
    /// returning the gradient with respect to the last forward input.
    fn backward(&mut self, grad_output: &Tensor) -> Tensor;

    fn parameters(&self) -> Vec<&Parameter>;

    fn parameters_mut(&mut self) -> Vec<&mut Parameter>;

    /// Parameters keyed by a stable dotted name, used for checkpoints.
    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        Vec::new()
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Parameter)> {
        Vec::new()
    }

    fn zero_grad(&mut self) {
        for p in self.parameters_mut() {
            p.zero_grad();
        }
    }
}
