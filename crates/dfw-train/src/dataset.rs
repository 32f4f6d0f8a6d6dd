//! Image splits for the loops.

use std::f64::consts::PI;

use dfw_nn::{Dataset, TensorDataset};
use dfw_tensor::{Shape, Tensor};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::info;

use crate::config::{DataSource, Options};
use crate::error::{Error, Result};

/// Which portion of the data a loop reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Dev,
    Test,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Dev => "dev",
            Split::Test => "test",
        }
    }

    fn salt(&self) -> u64 {
        match self {
            Split::Train => 1 << 32,
            Split::Dev => 2 << 32,
            Split::Test => 3 << 32,
        }
    }
}

/// Smooth procedural images: a few random plane waves per channel squashed
/// into `[-1, 1]`. The whole split is reproducible from its seed.
pub struct SyntheticImages {
    inner: TensorDataset,
}

impl SyntheticImages {
    pub fn new(n: usize, channels: usize, size: usize, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let pixels = channels * size * size;
        let mut data = Vec::with_capacity(n * pixels);
        for _ in 0..n {
            for _ in 0..channels {
                let waves: Vec<(f64, f64, f64, f64)> = (0..3)
                    .map(|_| {
                        (
                            rng.gen_range(-3.0..3.0),
                            rng.gen_range(-3.0..3.0),
                            rng.gen_range(0.0..2.0 * PI),
                            rng.gen_range(0.2..0.8),
                        )
                    })
                    .collect();
                let offset: f64 = rng.gen_range(-0.5..0.5);
                for y in 0..size {
                    for x in 0..size {
                        let (u, v) = (x as f64 / size as f64, y as f64 / size as f64);
                        let s: f64 = waves
                            .iter()
                            .map(|&(fx, fy, phase, amp)| {
                                amp * (2.0 * PI * (fx * u + fy * v) + phase).sin()
                            })
                            .sum();
                        data.push((offset + s).tanh());
                    }
                }
            }
        }
        let tensor = Tensor::new(data, Shape::from_slice(&[n, channels, size, size]));
        Self {
            inner: TensorDataset::new(tensor),
        }
    }

    pub fn split(options: &Options, split: Split) -> Self {
        let n = match split {
            Split::Train => options.data.n_train,
            Split::Dev => options.data.n_dev,
            Split::Test => options.data.n_test,
        };
        Self::new(
            n,
            options.channels,
            options.img_size,
            options.seed ^ split.salt(),
        )
    }

    pub fn images(&self) -> &Tensor {
        self.inner.tensor()
    }
}

impl Dataset for SyntheticImages {
    fn len(&self) -> usize {
        self.inner.len()
    }

    fn sample_shape(&self) -> Shape {
        self.inner.sample_shape()
    }

    fn get(&self, index: usize) -> Tensor {
        self.inner.get(index)
    }
}

/// Images read from a safetensors file with one `[N, C, H, W]` tensor per
/// split, keyed `train`, `dev` and `test`.
pub struct TensorImages {
    inner: TensorDataset,
}

impl TensorImages {
    pub fn load(path: &std::path::Path, split: Split, channels: usize, size: usize) -> Result<Self> {
        let mut tensors = dfw_safetensors::load(path)?;
        let images = tensors.remove(split.as_str()).ok_or_else(|| {
            Error::Dataset(format!(
                "{} has no '{}' tensor",
                path.display(),
                split.as_str()
            ))
        })?;
        let expected = [channels, size, size];
        if images.ndim() != 4 || images.dims()[1..] != expected {
            return Err(Error::Dataset(format!(
                "'{}' split has shape {}, expected [N, {channels}, {size}, {size}]",
                split.as_str(),
                images.shape()
            )));
        }
        if images.batch_len() == 0 {
            return Err(Error::Dataset(format!("'{}' split is empty", split.as_str())));
        }
        Ok(Self {
            inner: TensorDataset::new(images),
        })
    }
}

impl Dataset for TensorImages {
    fn len(&self) -> usize {
        self.inner.len()
    }

    fn sample_shape(&self) -> Shape {
        self.inner.sample_shape()
    }

    fn get(&self, index: usize) -> Tensor {
        self.inner.get(index)
    }
}

/// Open the configured image source for one split.
pub fn open_split(options: &Options, split: Split) -> Result<Box<dyn Dataset>> {
    let dataset: Box<dyn Dataset> = match &options.data.source {
        DataSource::Synthetic => Box::new(SyntheticImages::split(options, split)),
        DataSource::Safetensors { path } => Box::new(TensorImages::load(
            path,
            split,
            options.channels,
            options.img_size,
        )?),
    };
    info!(split = split.as_str(), len = dataset.len(), "dataset ready");
    Ok(dataset)
}
