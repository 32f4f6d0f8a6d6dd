//! Encoder, decoder and the composed watermark model.
//!
//! Both networks share one layout: a stem `Linear` + `LeakyReLU`, a stack of
//! `max_depth - 1` residual blocks of which the first `depth - 1` are
//! active, and a head `Linear`. Block outputs start at zero, so growing the
//! depth never changes the function a model computes.

use std::collections::BTreeMap;
use std::path::Path;

use dfw_nn::{LeakyReLU, Linear, Module, Parameter, Residual, Sequential};
use dfw_tensor::{Shape, Tensor};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use crate::config::Options;
use crate::error::{Error, Result};
use crate::noise::{self, Noiser};

/// Full parameter snapshot, name → tensor. Moved by value between threads.
pub type StateDict = BTreeMap<String, Tensor>;

type Block = Residual<Sequential>;

fn block(width: usize, seed: u64) -> Block {
    Residual::new(Sequential::new(vec![
        Box::new(Linear::new(width, width, seed)),
        Box::new(LeakyReLU::default()),
        Box::new(Linear::zeroed(width, width)),
    ]))
}

/// Stem, depth-gated residual blocks, head.
pub struct ResidualTrunk {
    stem: Linear,
    act: LeakyReLU,
    blocks: Vec<Block>,
    head: Linear,
    depth: usize,
    forward_depth: Option<usize>,
}

impl ResidualTrunk {
    pub fn new(input: usize, hidden: usize, output: usize, max_depth: usize, seed: u64) -> Self {
        assert!(max_depth >= 1, "max_depth must be at least 1");
        Self {
            stem: Linear::new(input, hidden, seed),
            act: LeakyReLU::default(),
            blocks: (1..max_depth)
                .map(|i| block(hidden, seed.wrapping_add(i as u64)))
                .collect(),
            head: Linear::new(hidden, output, seed.wrapping_add(max_depth as u64)),
            depth: 1,
            forward_depth: None,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn max_depth(&self) -> usize {
        self.blocks.len() + 1
    }

    /// Clamped to `[1, max_depth]`.
    pub fn set_depth(&mut self, depth: usize) {
        self.depth = depth.clamp(1, self.max_depth());
    }

    fn active(&self) -> usize {
        self.depth - 1
    }
}

impl Module for ResidualTrunk {
    fn forward(&mut self, input: &Tensor) -> Tensor {
        let active = self.active();
        self.forward_depth = Some(self.depth);
        let mut x = self.act.forward(&self.stem.forward(input));
        for block in &mut self.blocks[..active] {
            x = block.forward(&x);
        }
        self.head.forward(&x)
    }

    fn predict(&self, input: &Tensor) -> Tensor {
        let x = self.act.predict(&self.stem.predict(input));
        let x = self.blocks[..self.active()]
            .iter()
            .fold(x, |x, block| block.predict(&x));
        self.head.predict(&x)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        let depth = self
            .forward_depth
            .take()
            .expect("ResidualTrunk::backward called before forward");
        assert_eq!(depth, self.depth, "depth changed between forward and backward");
        let mut grad = self.head.backward(grad_output);
        for block in self.blocks[..depth - 1].iter_mut().rev() {
            grad = block.backward(&grad);
        }
        self.stem.backward(&self.act.backward(&grad))
    }

    fn parameters(&self) -> Vec<&Parameter> {
        let mut params = self.stem.parameters();
        for block in &self.blocks {
            params.extend(block.parameters());
        }
        params.extend(self.head.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut params = self.stem.parameters_mut();
        for block in &mut self.blocks {
            params.extend(block.parameters_mut());
        }
        params.extend(self.head.parameters_mut());
        params
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        let mut named: Vec<(String, &Parameter)> = self
            .stem
            .named_parameters()
            .into_iter()
            .map(|(n, p)| (format!("stem.{n}"), p))
            .collect();
        for (i, block) in self.blocks.iter().enumerate() {
            named.extend(
                block
                    .named_parameters()
                    .into_iter()
                    .map(|(n, p)| (format!("blocks.{i}.{n}"), p)),
            );
        }
        named.extend(
            self.head
                .named_parameters()
                .into_iter()
                .map(|(n, p)| (format!("head.{n}"), p)),
        );
        named
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Parameter)> {
        let mut named: Vec<(String, &mut Parameter)> = self
            .stem
            .named_parameters_mut()
            .into_iter()
            .map(|(n, p)| (format!("stem.{n}"), p))
            .collect();
        for (i, block) in self.blocks.iter_mut().enumerate() {
            named.extend(
                block
                    .named_parameters_mut()
                    .into_iter()
                    .map(|(n, p)| (format!("blocks.{i}.{n}"), p)),
            );
        }
        named.extend(
            self.head
                .named_parameters_mut()
                .into_iter()
                .map(|(n, p)| (format!("head.{n}"), p)),
        );
        named
    }
}

/// Message `[N, L]` → watermark `[N, C, H, W]`.
pub struct Encoder {
    trunk: ResidualTrunk,
    image_shape: Shape,
}

impl Encoder {
    pub fn new(msg_len: usize, image_shape: Shape, hidden: usize, max_depth: usize, seed: u64) -> Self {
        let pixels = image_shape.numel();
        Self {
            trunk: ResidualTrunk::new(msg_len, hidden, pixels, max_depth, seed),
            image_shape,
        }
    }

    fn to_image(&self, flat: Tensor) -> Tensor {
        let n = flat.batch_len();
        let mut dims = vec![n];
        dims.extend_from_slice(self.image_shape.dims());
        flat.reshape(Shape::new(dims))
    }

    pub fn forward(&mut self, msg: &Tensor) -> Tensor {
        let flat = self.trunk.forward(msg);
        self.to_image(flat)
    }

    pub fn predict(&self, msg: &Tensor) -> Tensor {
        self.to_image(self.trunk.predict(msg))
    }

    /// Takes the gradient w.r.t. the watermark image.
    pub fn backward(&mut self, grad_watermark: &Tensor) -> Tensor {
        self.trunk.backward(&grad_watermark.flatten_batch())
    }
}

/// Image `[N, C, H, W]` → message logits `[N, L]`.
pub struct Decoder {
    trunk: ResidualTrunk,
    image_shape: Option<Shape>,
}

impl Decoder {
    pub fn new(image_shape: &Shape, msg_len: usize, hidden: usize, max_depth: usize, seed: u64) -> Self {
        Self {
            trunk: ResidualTrunk::new(image_shape.numel(), hidden, msg_len, max_depth, seed),
            image_shape: None,
        }
    }

    pub fn forward(&mut self, image: &Tensor) -> Tensor {
        self.image_shape = Some(image.shape().clone());
        self.trunk.forward(&image.flatten_batch())
    }

    pub fn predict(&self, image: &Tensor) -> Tensor {
        self.trunk.predict(&image.flatten_batch())
    }

    /// Returns the gradient w.r.t. the input image, in image shape.
    pub fn backward(&mut self, grad_logits: &Tensor) -> Tensor {
        let shape = self
            .image_shape
            .take()
            .expect("Decoder::backward called before forward");
        self.trunk.backward(grad_logits).reshape(shape)
    }
}

/// Encoder, noiser and decoder with a shared curriculum depth.
pub struct WatermarkModel {
    pub encoder: Encoder,
    pub noiser: Box<dyn Noiser>,
    pub decoder: Decoder,
    noise_rng: ChaCha8Rng,
    msg_len: usize,
    image_shape: Shape,
}

/// Outputs of one embed → clamp → noise → decode pass.
pub struct Forward {
    pub watermark: Tensor,
    /// `image + watermark` before clamping.
    pub unclamped: Tensor,
    pub encoded: Tensor,
    pub noised: Tensor,
    pub logits: Tensor,
}

impl WatermarkModel {
    /// A model for `options`, at depth 1.
    pub fn new(options: &Options) -> Self {
        let image_shape = Shape::from_slice(&[options.channels, options.img_size, options.img_size]);
        let msg_len = options.coded_msg_l();
        let m = &options.model;
        Self {
            encoder: Encoder::new(msg_len, image_shape.clone(), m.hidden, m.max_depth, options.seed),
            noiser: noise::build(options),
            decoder: Decoder::new(
                &image_shape,
                msg_len,
                m.hidden,
                m.max_depth,
                options.seed.wrapping_add(1 << 16),
            ),
            noise_rng: ChaCha8Rng::seed_from_u64(options.seed.wrapping_add(2 << 16)),
            msg_len,
            image_shape,
        }
    }

    /// Length of the message the networks see.
    pub fn msg_len(&self) -> usize {
        self.msg_len
    }

    pub fn image_shape(&self) -> &Shape {
        &self.image_shape
    }

    pub fn depth(&self) -> usize {
        self.encoder.trunk.depth()
    }

    pub fn max_depth(&self) -> usize {
        self.encoder.trunk.max_depth()
    }

    pub fn set_depth(&mut self, depth: usize) {
        self.encoder.trunk.set_depth(depth);
        self.decoder.trunk.set_depth(depth);
        debug!(depth = self.depth(), "model depth set");
    }

    /// Reseed the noise channel.
    pub fn reseed_noise(&mut self, seed: u64) {
        self.noise_rng = ChaCha8Rng::seed_from_u64(seed);
    }

    /// Full pass recording everything `backward` needs.
    pub fn forward(&mut self, image: &Tensor, msg: &Tensor, limit: f64) -> Forward {
        let watermark = self.encoder.forward(msg);
        let unclamped = image.add(&watermark);
        let encoded = unclamped.clamp(-limit, limit);
        let noised = self.noiser.forward(&encoded, image, &mut self.noise_rng);
        let logits = self.decoder.forward(&noised);
        Forward {
            watermark,
            unclamped,
            encoded,
            noised,
            logits,
        }
    }

    /// Full pass without gradient bookkeeping. Only the noise RNG advances.
    pub fn infer(&mut self, image: &Tensor, msg: &Tensor, limit: f64) -> Forward {
        let watermark = self.encoder.predict(msg);
        let unclamped = image.add(&watermark);
        let encoded = unclamped.clamp(-limit, limit);
        let noised = self.noiser.predict(&encoded, image, &mut self.noise_rng);
        let logits = self.decoder.predict(&noised);
        Forward {
            watermark,
            unclamped,
            encoded,
            noised,
            logits,
        }
    }

    /// Backpropagate through decoder, noiser, clamp and encoder.
    ///
    /// `grad_logits` is the loss gradient at the decoder output and
    /// `grad_watermark` any direct loss gradient on the watermark.
    pub fn backward(&mut self, pass: &Forward, limit: f64, grad_logits: &Tensor, grad_watermark: &Tensor) {
        let grad_noised = self.decoder.backward(grad_logits);
        let grad_encoded = self.noiser.backward(&grad_noised);
        let grad_unclamped = clamp_backward(&grad_encoded, &pass.unclamped, limit);
        self.encoder.backward(&grad_unclamped.add(grad_watermark));
    }

    /// Message round trip with no image and no channel, for pretraining.
    pub fn round_trip_forward(&mut self, msg: &Tensor) -> Tensor {
        let watermark = self.encoder.forward(msg);
        self.decoder.forward(&watermark)
    }

    pub fn round_trip_backward(&mut self, grad_logits: &Tensor) {
        let grad_watermark = self.decoder.backward(grad_logits);
        self.encoder.backward(&grad_watermark);
    }

    pub fn round_trip_predict(&self, msg: &Tensor) -> Tensor {
        self.decoder.predict(&self.encoder.predict(msg))
    }

    /// Encoder parameters followed by decoder parameters, in a fixed order.
    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut params = self.encoder.trunk.parameters_mut();
        params.extend(self.decoder.trunk.parameters_mut());
        params
    }

    pub fn zero_grad(&mut self) {
        self.encoder.trunk.zero_grad();
        self.decoder.trunk.zero_grad();
    }

    /// Deep copy of every parameter, whatever the current depth.
    pub fn state_dict(&self) -> StateDict {
        let encoder = prefixed("encoder", self.encoder.trunk.named_parameters());
        let decoder = prefixed("decoder", self.decoder.trunk.named_parameters());
        encoder
            .chain(decoder)
            .map(|(name, p)| (name, p.data.clone()))
            .collect()
    }

    /// Copy every parameter from `state`. Every key must be present with the
    /// right shape; extra keys are rejected too.
    pub fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        let mut expected = 0;
        let encoder = prefixed("encoder", self.encoder.trunk.named_parameters_mut());
        let decoder = prefixed("decoder", self.decoder.trunk.named_parameters_mut());
        let mut updates = Vec::new();
        for (name, param) in encoder.chain(decoder) {
            expected += 1;
            let tensor = state
                .get(&name)
                .ok_or_else(|| Error::StateDict(format!("missing key '{name}'")))?;
            if tensor.shape() != param.shape() {
                return Err(Error::StateDict(format!(
                    "'{name}' has shape {}, expected {}",
                    tensor.shape(),
                    param.shape()
                )));
            }
            updates.push((param, tensor));
        }
        if state.len() != expected {
            return Err(Error::StateDict(format!(
                "checkpoint has {} tensors, model has {expected}",
                state.len()
            )));
        }
        for (param, tensor) in updates {
            param.data = tensor.clone();
            param.grad = None;
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        dfw_safetensors::save(&self.state_dict(), path)?;
        Ok(())
    }

    /// Load a checkpoint file. A missing file is `Error::MissingCheckpoint`.
    pub fn load(&mut self, path: &Path) -> Result<()> {
        let state = dfw_safetensors::load(path).map_err(|e| {
            if e.is_not_found() {
                Error::MissingCheckpoint(path.to_path_buf())
            } else {
                e.into()
            }
        })?;
        self.load_state_dict(&state)
    }
}

fn prefixed<P>(prefix: &'static str, named: Vec<(String, P)>) -> impl Iterator<Item = (String, P)> {
    named
        .into_iter()
        .map(move |(n, p)| (format!("{prefix}.{n}"), p))
}

/// Clamp passes the gradient where the input was inside `[-limit, limit]`,
/// bounds included.
pub fn clamp_backward(grad: &Tensor, input: &Tensor, limit: f64) -> Tensor {
    grad.zip_with(input, |g, x| if (-limit..=limit).contains(&x) { g } else { 0.0 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfw_nn::{bce_with_logits, bce_with_logits_grad};

    fn tiny() -> Options {
        let mut options = Options::default();
        options.img_size = 4;
        options.channels = 1;
        options.msg_l = 4;
        options.model.hidden = 8;
        options.model.max_depth = 3;
        options.model.pretrain_depth = 2;
        options
    }

    #[test]
    fn depth_is_clamped() {
        let mut model = WatermarkModel::new(&tiny());
        assert_eq!(model.depth(), 1);
        model.set_depth(10);
        assert_eq!(model.depth(), 3);
        model.set_depth(0);
        assert_eq!(model.depth(), 1);
    }

    #[test]
    fn growing_depth_preserves_outputs() {
        let mut model = WatermarkModel::new(&tiny());
        let msg = Tensor::new(vec![1.0, 0.0, 1.0, 1.0], Shape::from_slice(&[1, 4]));
        let shallow = model.round_trip_predict(&msg);
        model.set_depth(3);
        assert_eq!(model.round_trip_predict(&msg), shallow);
    }

    #[test]
    fn state_dict_covers_inactive_blocks() {
        let model = WatermarkModel::new(&tiny());
        let state = model.state_dict();
        assert!(state.contains_key("encoder.blocks.1.2.weight"));
        assert!(state.contains_key("decoder.head.bias"));
        // stem + head + 2 blocks * 2 linears, each weight + bias, per network
        assert_eq!(state.len(), 2 * (2 + 2 + 2 * 4));
    }

    #[test]
    fn load_state_dict_rejects_mismatches() {
        let mut model = WatermarkModel::new(&tiny());
        let mut state = model.state_dict();
        state.remove("encoder.stem.bias");
        assert!(matches!(model.load_state_dict(&state), Err(Error::StateDict(_))));

        let mut state = model.state_dict();
        state.insert("encoder.stem.bias".into(), Tensor::zeros(Shape::from_slice(&[3])));
        assert!(matches!(model.load_state_dict(&state), Err(Error::StateDict(_))));

        let mut state = model.state_dict();
        state.insert("extra".into(), Tensor::scalar(0.0));
        assert!(matches!(model.load_state_dict(&state), Err(Error::StateDict(_))));
    }

    #[test]
    fn clamp_gradient_is_masked_inclusively() {
        let grad = Tensor::from_slice(&[1.0, 1.0, 1.0, 1.0]);
        let input = Tensor::from_slice(&[-2.0, -1.0, 1.0, 1.5]);
        assert_eq!(clamp_backward(&grad, &input, 1.0).data(), &[0.0, 1.0, 1.0, 0.0]);
    }

    #[test]
    fn full_pass_gradient_matches_finite_difference() {
        let options = tiny();
        let mut model = WatermarkModel::new(&options);
        model.set_depth(3);
        let image = Tensor::from_fn(Shape::from_slice(&[2, 1, 4, 4]), |i| {
            0.1 * (i[2] as f64 - i[3] as f64)
        });
        let msg = Tensor::new(vec![1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0], Shape::from_slice(&[2, 4]));
        let limit = 5.0;

        let loss = |m: &mut WatermarkModel| {
            let pass = m.infer(&image, &msg, limit);
            bce_with_logits(&pass.logits, &msg)
        };

        model.zero_grad();
        let pass = model.forward(&image, &msg, limit);
        let grad_logits = bce_with_logits_grad(&pass.logits, &msg);
        let zero = Tensor::zeros_like(&pass.watermark);
        model.backward(&pass, limit, &grad_logits, &zero);

        let analytic = model.encoder.trunk.stem.weight.grad.clone().unwrap();
        let eps = 1e-6;
        for i in [0, 5, 17] {
            let orig = model.encoder.trunk.stem.weight.data.data()[i];
            model.encoder.trunk.stem.weight.data.data_mut()[i] = orig + eps;
            let plus = loss(&mut model);
            model.encoder.trunk.stem.weight.data.data_mut()[i] = orig - eps;
            let minus = loss(&mut model);
            model.encoder.trunk.stem.weight.data.data_mut()[i] = orig;
            let numeric = (plus - minus) / (2.0 * eps);
            assert!(
                (numeric - analytic.data()[i]).abs() < 1e-5,
                "stem weight {i}: analytic={}, numeric={numeric}",
                analytic.data()[i]
            );
        }
    }
}
