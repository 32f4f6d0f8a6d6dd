//! Progressive-depth training of a steganographic watermark model.
//!
//! An encoder turns a bit string into an additive image watermark, a noise
//! layer simulates the channel, and a decoder recovers the bits. Both networks
//! are residual stacks whose depth grows during message-only pretraining
//! ([`curriculum`]), followed by annealed training on images ([`Trainer`]) with
//! checkpoints evaluated on a background thread ([`Evaluator`]).

pub mod color;
pub mod config;
pub mod curriculum;
pub mod dataset;
pub mod ecc;
mod error;
pub mod evaluator;
pub mod message;
pub mod metrics_log;
pub mod model;
pub mod noise;
pub mod offline;
pub mod queue;
pub mod schedule;
pub mod stats;
pub mod strategy;
mod trainer;
pub mod validate;

pub use config::{NoiseType, Options};
pub use curriculum::{pretrain, Curriculum, PretrainReport};
pub use error::{Error, Result};
pub use evaluator::{EvalJob, Evaluator};
pub use model::{StateDict, WatermarkModel};
pub use offline::{save_examples, test, test_per_user};
pub use stats::Stats;
pub use trainer::{EpochReport, TrainReport, Trainer};
