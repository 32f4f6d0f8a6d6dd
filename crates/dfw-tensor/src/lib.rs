//! Dense row-major `f64` tensors for the watermark networks.
//!
//! Every tensor is contiguous. Batched data keeps one sample per leading
//! index, so images are `[N, C, H, W]` and messages `[N, L]`.

mod shape;
mod tensor;

pub use shape::Shape;
pub use tensor::{sigmoid, Tensor};
