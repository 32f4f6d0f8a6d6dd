//! Differentiable channel simulations applied between encoder and decoder.
//!
//! Every noiser sees the encoded batch and the clean cover batch, both
//! `[N, C, H, W]`, and returns a batch of the same shape. Gradients flow to
//! the encoded input only.

use std::f64::consts::PI;

use dfw_tensor::Tensor;
use rand::{Rng, RngCore};
use rand_distr::StandardNormal;

use crate::config::{NoiseType, Options};

pub trait Noiser: Send {
    fn name(&self) -> &'static str;

    /// Apply the channel, remembering what `backward` needs.
    fn forward(&mut self, encoded: &Tensor, cover: &Tensor, rng: &mut dyn RngCore) -> Tensor;

    /// Apply the channel without recording anything.
    fn predict(&self, encoded: &Tensor, cover: &Tensor, rng: &mut dyn RngCore) -> Tensor;

    /// Gradient with respect to the encoded input of the last `forward`.
    fn backward(&mut self, grad_output: &Tensor) -> Tensor;
}

/// Build the configured noiser.
pub fn build(options: &Options) -> Box<dyn Noiser> {
    build_kind(options.noise_type, options)
}

fn build_kind(kind: NoiseType, options: &Options) -> Box<dyn Noiser> {
    let cfg = &options.noise;
    match kind {
        NoiseType::Identity => Box::new(Identity),
        NoiseType::Gaussian => Box::new(Gaussian::new(cfg.gaussian_std)),
        NoiseType::Dropout => Box::new(MaskNoise::dropout(cfg.dropout_keep)),
        NoiseType::Cropout => Box::new(MaskNoise::cropout(cfg.crop_keep)),
        NoiseType::Crop => Box::new(MaskNoise::crop(cfg.crop_keep)),
        NoiseType::Jpeg => Box::new(JpegMask::new(cfg.jpeg_keep)),
        NoiseType::Combined => Box::new(Combined::new(
            [
                NoiseType::Identity,
                NoiseType::Gaussian,
                NoiseType::Dropout,
                NoiseType::Cropout,
                NoiseType::Crop,
                NoiseType::Jpeg,
            ]
            .into_iter()
            .map(|k| build_kind(k, options))
            .collect(),
        )),
    }
}

/// Lossless channel.
pub struct Identity;

impl Noiser for Identity {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn forward(&mut self, encoded: &Tensor, cover: &Tensor, rng: &mut dyn RngCore) -> Tensor {
        self.predict(encoded, cover, rng)
    }

    fn predict(&self, encoded: &Tensor, _cover: &Tensor, _rng: &mut dyn RngCore) -> Tensor {
        encoded.clone()
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        grad_output.clone()
    }
}

/// Additive white gaussian noise.
pub struct Gaussian {
    pub std: f64,
}

impl Gaussian {
    pub fn new(std: f64) -> Self {
        Self { std }
    }
}

impl Noiser for Gaussian {
    fn name(&self) -> &'static str {
        "gaussian"
    }

    fn forward(&mut self, encoded: &Tensor, cover: &Tensor, rng: &mut dyn RngCore) -> Tensor {
        self.predict(encoded, cover, rng)
    }

    fn predict(&self, encoded: &Tensor, _cover: &Tensor, rng: &mut dyn RngCore) -> Tensor {
        let noise = (0..encoded.numel())
            .map(|_| self.std * rng.sample::<f64, _>(StandardNormal))
            .collect();
        encoded.add(&Tensor::new(noise, encoded.shape().clone()))
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        grad_output.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MaskKind {
    /// Independent per-pixel keep decisions.
    Pixels,
    /// One rectangular window per sample.
    Window,
}

/// Channels of the form `m * encoded + (1 - m) * fill` with a random 0/1
/// mask `m` shared across colour channels. `fill` is the cover image
/// (dropout, cropout) or zero (crop).
pub struct MaskNoise {
    name: &'static str,
    kind: MaskKind,
    keep: f64,
    fill_with_cover: bool,
    mask: Option<Tensor>,
}

impl MaskNoise {
    /// Each pixel comes from the encoded image with probability `keep`,
    /// otherwise from the cover.
    pub fn dropout(keep: f64) -> Self {
        Self {
            name: "dropout",
            kind: MaskKind::Pixels,
            keep,
            fill_with_cover: true,
            mask: None,
        }
    }

    /// A random window of side `keep * size` comes from the encoded image,
    /// the rest from the cover.
    pub fn cropout(keep: f64) -> Self {
        Self {
            name: "cropout",
            kind: MaskKind::Window,
            keep,
            fill_with_cover: true,
            mask: None,
        }
    }

    /// A random window of side `keep * size` survives, the rest is zeroed.
    pub fn crop(keep: f64) -> Self {
        Self {
            name: "crop",
            kind: MaskKind::Window,
            keep,
            fill_with_cover: false,
            mask: None,
        }
    }

    fn sample_mask(&self, like: &Tensor, rng: &mut dyn RngCore) -> Tensor {
        let dims = like.dims();
        assert_eq!(dims.len(), 4, "{} expects [N, C, H, W]", self.name);
        let (n, c, h, w) = (dims[0], dims[1], dims[2], dims[3]);
        let mut mask = Tensor::zeros(like.shape().clone());
        let data = mask.data_mut();
        for i in 0..n {
            let plane: Vec<f64> = match self.kind {
                MaskKind::Pixels => (0..h * w)
                    .map(|_| if rng.gen_bool(self.keep) { 1.0 } else { 0.0 })
                    .collect(),
                MaskKind::Window => {
                    let wh = ((h as f64 * self.keep).round() as usize).clamp(1, h);
                    let ww = ((w as f64 * self.keep).round() as usize).clamp(1, w);
                    let top = rng.gen_range(0..=h - wh);
                    let left = rng.gen_range(0..=w - ww);
                    (0..h * w)
                        .map(|p| {
                            let (y, x) = (p / w, p % w);
                            let inside = (top..top + wh).contains(&y) && (left..left + ww).contains(&x);
                            if inside {
                                1.0
                            } else {
                                0.0
                            }
                        })
                        .collect()
                }
            };
            for ch in 0..c {
                let start = (i * c + ch) * h * w;
                data[start..start + h * w].copy_from_slice(&plane);
            }
        }
        mask
    }

    fn apply(&self, mask: &Tensor, encoded: &Tensor, cover: &Tensor) -> Tensor {
        let kept = encoded.mul(mask);
        if self.fill_with_cover {
            kept.add(&cover.zip_with(mask, |c, m| c * (1.0 - m)))
        } else {
            kept
        }
    }
}

impl Noiser for MaskNoise {
    fn name(&self) -> &'static str {
        self.name
    }

    fn forward(&mut self, encoded: &Tensor, cover: &Tensor, rng: &mut dyn RngCore) -> Tensor {
        let mask = self.sample_mask(encoded, rng);
        let out = self.apply(&mask, encoded, cover);
        self.mask = Some(mask);
        out
    }

    fn predict(&self, encoded: &Tensor, cover: &Tensor, rng: &mut dyn RngCore) -> Tensor {
        let mask = self.sample_mask(encoded, rng);
        self.apply(&mask, encoded, cover)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        let mask = self
            .mask
            .take()
            .expect("MaskNoise::backward called before forward");
        grad_output.mul(&mask)
    }
}

/// JPEG-like compression: per 8x8 block, keep only the DCT coefficients
/// with `u + v < keep` and transform back. The operator is linear and
/// symmetric, so its backward pass is the same projection.
pub struct JpegMask {
    keep: usize,
    dct: [[f64; 8]; 8],
}

impl JpegMask {
    pub fn new(keep: usize) -> Self {
        let mut dct = [[0.0; 8]; 8];
        for (k, row) in dct.iter_mut().enumerate() {
            let scale = if k == 0 { (1.0f64 / 8.0).sqrt() } else { (2.0f64 / 8.0).sqrt() };
            for (n, v) in row.iter_mut().enumerate() {
                *v = scale * (PI * (2 * n + 1) as f64 * k as f64 / 16.0).cos();
            }
        }
        Self { keep, dct }
    }

    fn project(&self, x: &Tensor) -> Tensor {
        let dims = x.dims();
        assert_eq!(dims.len(), 4, "jpeg expects [N, C, H, W]");
        let (h, w) = (dims[2], dims[3]);
        assert!(
            h % 8 == 0 && w % 8 == 0,
            "jpeg needs height and width divisible by 8, got {h}x{w}"
        );
        let d = &self.dct;
        let mut out = x.clone();
        let data = out.data_mut();
        for plane in data.chunks_exact_mut(h * w) {
            for by in (0..h).step_by(8) {
                for bx in (0..w).step_by(8) {
                    let mut block = [[0.0; 8]; 8];
                    for (y, row) in block.iter_mut().enumerate() {
                        for (xx, v) in row.iter_mut().enumerate() {
                            *v = plane[(by + y) * w + bx + xx];
                        }
                    }
                    // C = D B D^T, masked
                    let mut coeff = [[0.0; 8]; 8];
                    for u in 0..8 {
                        for v in 0..8 {
                            if u + v >= self.keep {
                                continue;
                            }
                            let mut s = 0.0;
                            for (y, row) in block.iter().enumerate() {
                                for (xx, &b) in row.iter().enumerate() {
                                    s += d[u][y] * b * d[v][xx];
                                }
                            }
                            coeff[u][v] = s;
                        }
                    }
                    // B' = D^T C D
                    for y in 0..8 {
                        for xx in 0..8 {
                            let mut s = 0.0;
                            for (u, row) in coeff.iter().enumerate() {
                                for (v, &c) in row.iter().enumerate() {
                                    s += d[u][y] * c * d[v][xx];
                                }
                            }
                            plane[(by + y) * w + bx + xx] = s;
                        }
                    }
                }
            }
        }
        out
    }
}

impl Noiser for JpegMask {
    fn name(&self) -> &'static str {
        "jpeg"
    }

    fn forward(&mut self, encoded: &Tensor, cover: &Tensor, rng: &mut dyn RngCore) -> Tensor {
        self.predict(encoded, cover, rng)
    }

    fn predict(&self, encoded: &Tensor, _cover: &Tensor, _rng: &mut dyn RngCore) -> Tensor {
        self.project(encoded)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        self.project(grad_output)
    }
}

/// Picks one channel uniformly at random per batch.
pub struct Combined {
    noisers: Vec<Box<dyn Noiser>>,
    last: Option<usize>,
}

impl Combined {
    pub fn new(noisers: Vec<Box<dyn Noiser>>) -> Self {
        assert!(!noisers.is_empty(), "Combined needs at least one noiser");
        Self {
            noisers,
            last: None,
        }
    }
}

impl Noiser for Combined {
    fn name(&self) -> &'static str {
        "combined"
    }

    fn forward(&mut self, encoded: &Tensor, cover: &Tensor, rng: &mut dyn RngCore) -> Tensor {
        let i = rng.gen_range(0..self.noisers.len());
        self.last = Some(i);
        self.noisers[i].forward(encoded, cover, rng)
    }

    fn predict(&self, encoded: &Tensor, cover: &Tensor, rng: &mut dyn RngCore) -> Tensor {
        let i = rng.gen_range(0..self.noisers.len());
        self.noisers[i].predict(encoded, cover, rng)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        let i = self
            .last
            .take()
            .expect("Combined::backward called before forward");
        self.noisers[i].backward(grad_output)
    }
}
