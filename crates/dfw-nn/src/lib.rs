//! Layers, parameters, losses and optimizers with hand-written backward
//! passes.

mod data;
mod layers;
mod loss;
mod module;
mod optimizer;
mod parameter;
mod schedule;

pub use data::{DataLoader, Dataset, TensorDataset};
pub use layers::{LeakyReLU, Linear, Residual, Sequential};
pub use loss::{bce_with_logits, bce_with_logits_grad, mean_l2_norm, mean_l2_norm_grad};
pub use module::Module;
pub use optimizer::{Adam, Optimizer};
pub use parameter::Parameter;
pub use schedule::{LinearRamp, Schedule};
