use std::path::PathBuf;

use dfw_safetensors::SafetensorsError;
use thiserror::Error;

/// Errors raised by the training and evaluation loops.
#[derive(Debug, Error)]
pub enum Error {
    #[error("pre-trained weights not found at {}; run `dfw pretrain` first", .0.display())]
    MissingPretrainCheckpoint(PathBuf),

    #[error("checkpoint not found at {}", .0.display())]
    MissingCheckpoint(PathBuf),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("state dict mismatch: {0}")]
    StateDict(String),

    #[error("curriculum stalled at depth {depth} after {attempts} attempts (last loss {last_loss:.4})")]
    CurriculumStalled {
        depth: usize,
        attempts: u64,
        last_loss: f64,
    },

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error(transparent)]
    Safetensors(#[from] SafetensorsError),

    #[error("io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("failed to spawn evaluator thread: {0}")]
    Spawn(#[source] std::io::Error),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<csv::Error> for Error {
    fn from(err: csv::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
