//! One step of each loop, as interchangeable strategies over a shared
//! [`WatermarkModel`].

use dfw_nn::{
    bce_with_logits, bce_with_logits_grad, mean_l2_norm, mean_l2_norm_grad, Adam, Optimizer,
};
use dfw_tensor::Tensor;

use crate::color::batch_lab_distance;
use crate::ecc::MessageCode;
use crate::error::{Error, Result};
use crate::model::WatermarkModel;
use crate::schedule::{Annealing, FINAL_LIMIT};
use crate::stats::Stats;

/// Metric keys produced by [`EvalStep`], in log order.
pub const EVAL_KEYS: [&str; 8] = [
    "loss",
    "enc_loss",
    "dec_loss",
    "accuracy0",
    "accuracy3",
    "avg_acc",
    "num_right_bits",
    "lab_dist",
];

/// Images (absent for pretraining) and the messages to embed.
pub struct Batch {
    pub images: Option<Tensor>,
    pub messages: Tensor,
}

impl Batch {
    pub fn messages_only(messages: Tensor) -> Self {
        Self {
            images: None,
            messages,
        }
    }

    pub fn new(images: Tensor, messages: Tensor) -> Self {
        assert_eq!(
            images.batch_len(),
            messages.batch_len(),
            "image and message batch sizes differ"
        );
        Self {
            images: Some(images),
            messages,
        }
    }

    pub fn len(&self) -> usize {
        self.messages.batch_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn images(&self, step: &str) -> Result<&Tensor> {
        self.images
            .as_ref()
            .ok_or_else(|| Error::Dataset(format!("{step} needs images in the batch")))
    }
}

pub trait Strategy {
    fn step(&mut self, model: &mut WatermarkModel, batch: &Batch) -> Result<Stats>;
}

/// Message round trip (encoder → decoder, no image, no channel) with one
/// optimizer step.
pub struct PretrainStep {
    optimizer: Adam,
}

impl PretrainStep {
    pub fn new(lr: f64) -> Self {
        Self {
            optimizer: Adam::new(lr),
        }
    }
}

impl Strategy for PretrainStep {
    fn step(&mut self, model: &mut WatermarkModel, batch: &Batch) -> Result<Stats> {
        model.zero_grad();
        let logits = model.round_trip_forward(&batch.messages);
        let loss = bce_with_logits(&logits, &batch.messages);
        model.round_trip_backward(&bce_with_logits_grad(&logits, &batch.messages));
        self.optimizer.step(&mut model.parameters_mut());
        Ok(Stats::new().with("loss", loss))
    }
}

/// Full embed → clamp → noise → decode pass with one optimizer step.
///
/// Loss: `enc_scale * mean ||watermark|| + dec_scale * BCE(logits, msg)`.
pub struct TrainStep {
    optimizer: Adam,
    dec_scale: f64,
    enc_scale: f64,
    limit: f64,
}

impl TrainStep {
    pub fn new(lr: f64, dec_scale: f64) -> Self {
        Self {
            optimizer: Adam::new(lr),
            dec_scale,
            enc_scale: 0.0,
            limit: FINAL_LIMIT,
        }
    }

    /// Apply the annealed weight and clamp limit for `epoch`.
    pub fn set_epoch(&mut self, annealing: &Annealing, epoch: usize) {
        self.enc_scale = annealing.enc_scale(epoch);
        self.limit = annealing.limit(epoch);
    }

    pub fn enc_scale(&self) -> f64 {
        self.enc_scale
    }

    pub fn limit(&self) -> f64 {
        self.limit
    }
}

impl Strategy for TrainStep {
    fn step(&mut self, model: &mut WatermarkModel, batch: &Batch) -> Result<Stats> {
        let images = batch.images("train step")?;
        let msg = &batch.messages;

        model.zero_grad();
        let pass = model.forward(images, msg, self.limit);
        let enc_loss = mean_l2_norm(&pass.watermark);
        let dec_loss = bce_with_logits(&pass.logits, msg);
        let loss = self.enc_scale * enc_loss + self.dec_scale * dec_loss;

        let grad_logits = bce_with_logits_grad(&pass.logits, msg).scale(self.dec_scale);
        let grad_watermark = mean_l2_norm_grad(&pass.watermark).scale(self.enc_scale);
        model.backward(&pass, self.limit, &grad_logits, &grad_watermark);
        self.optimizer.step(&mut model.parameters_mut());

        Ok(Stats::new()
            .with("loss", loss)
            .with("enc_loss", enc_loss)
            .with("dec_loss", dec_loss))
    }
}

/// Forward pass only. The encoder term is the distortion
/// `mean ||image - encoded||`, not the watermark norm used for training.
pub struct ValidateStep {
    pub enc_scale: f64,
    pub dec_scale: f64,
    pub limit: f64,
}

impl Strategy for ValidateStep {
    fn step(&mut self, model: &mut WatermarkModel, batch: &Batch) -> Result<Stats> {
        let images = batch.images("validation step")?;
        let msg = &batch.messages;

        let pass = model.infer(images, msg, self.limit);
        let enc_loss = mean_l2_norm(&images.sub(&pass.encoded));
        let dec_loss = bce_with_logits(&pass.logits, msg);
        Ok(Stats::new()
            .with("loss", self.enc_scale * enc_loss + self.dec_scale * dec_loss)
            .with("enc_loss", enc_loss)
            .with("dec_loss", dec_loss))
    }
}

/// Evaluation at clamp limit 1 with bit accuracies and colour distance.
///
/// Batch messages are the raw `msg_l`-bit messages; with a code they are
/// encoded before embedding and predictions decoded before scoring.
pub struct EvalStep {
    pub enc_scale: f64,
    pub dec_scale: f64,
    pub code: Option<Box<dyn MessageCode>>,
}

impl Strategy for EvalStep {
    fn step(&mut self, model: &mut WatermarkModel, batch: &Batch) -> Result<Stats> {
        let images = batch.images("evaluation step")?;
        let original = &batch.messages;
        let msg = match &self.code {
            Some(code) => code.encode_batch(original),
            None => original.clone(),
        };
        if msg.dims().get(1) != Some(&model.msg_len()) {
            return Err(Error::Config(format!(
                "message batch {} does not match model message length {}",
                msg.shape(),
                model.msg_len()
            )));
        }

        let pass = model.infer(images, &msg, FINAL_LIMIT);
        let hard = pass.logits.map(|z| if z > 0.0 { 1.0 } else { 0.0 });
        let predicted = match &self.code {
            Some(code) => code.decode_batch(&hard),
            None => hard,
        };

        let bits = original.dims().get(1).copied().unwrap_or(0);
        let correct: Vec<usize> = predicted
            .rows()
            .zip(original.rows())
            .map(|(p, o)| p.iter().zip(o).filter(|(a, b)| a == b).count())
            .collect();
        let n = correct.len().max(1) as f64;
        let fraction = |pred: &dyn Fn(usize) -> bool| {
            correct.iter().filter(|&&c| pred(c)).count() as f64 / n
        };
        let accuracy0 = fraction(&|c: usize| c == bits);
        let accuracy3 = fraction(&|c: usize| c + 3 >= bits);
        let num_right_bits = correct.iter().sum::<usize>() as f64 / n;
        let avg_acc = if bits == 0 { 0.0 } else { num_right_bits / bits as f64 };

        let enc_loss = mean_l2_norm(&pass.watermark);
        let dec_loss = bce_with_logits(&pass.logits, &msg);
        let lab_dist = batch_lab_distance(images, &pass.noised);

        Ok(Stats::new()
            .with("loss", self.enc_scale * enc_loss + self.dec_scale * dec_loss)
            .with("enc_loss", enc_loss)
            .with("dec_loss", dec_loss)
            .with("accuracy0", accuracy0)
            .with("accuracy3", accuracy3)
            .with("avg_acc", avg_acc)
            .with("num_right_bits", num_right_bits)
            .with("lab_dist", lab_dist))
    }
}
