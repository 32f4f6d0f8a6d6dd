//! Gradient-free passes over a whole split.

use dfw_nn::{DataLoader, Dataset};
use dfw_tensor::Tensor;

use crate::config::Options;
use crate::error::Result;
use crate::message::MessageSource;
use crate::model::WatermarkModel;
use crate::stats::{Stats, StatsAccumulator};
use crate::strategy::{Batch, Strategy, ValidateStep};

/// Run `strategy` over `dataset` in order, drawing the messages for each
/// batch from `messages(batch_len)`, and average the per-batch stats
/// weighted by batch size.
pub fn run_dataset<S, M>(
    model: &mut WatermarkModel,
    strategy: &mut S,
    dataset: &dyn Dataset,
    batch_size: usize,
    mut messages: M,
) -> Result<Stats>
where
    S: Strategy + ?Sized,
    M: FnMut(usize) -> Tensor,
{
    let mut acc = StatsAccumulator::new();
    for images in DataLoader::new(dataset, batch_size) {
        let n = images.batch_len();
        let batch = Batch::new(images, messages(n));
        let stats = strategy.step(model, &batch)?;
        acc.add(&stats, n);
    }
    Ok(acc.finish())
}

/// Validation over the dev split at the clamp `limit` of the epoch being
/// validated, weighting the encoder term by the un-annealed `enc_scale`.
pub fn validate(
    model: &mut WatermarkModel,
    dataset: &dyn Dataset,
    messages: &mut MessageSource,
    options: &Options,
    limit: f64,
) -> Result<Stats> {
    let mut step = ValidateStep {
        enc_scale: options.enc_scale,
        dec_scale: options.dec_scale,
        limit,
    };
    run_dataset(model, &mut step, dataset, options.batch_size, |n| {
        messages.sample(n)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::Annealing;
    use dfw_nn::{mean_l2_norm, TensorDataset};
    use dfw_tensor::Shape;

    fn tiny() -> Options {
        let mut options = Options::default();
        options.img_size = 4;
        options.msg_l = 4;
        options.batch_size = 2;
        options.model.hidden = 8;
        options.model.max_depth = 2;
        options.model.pretrain_depth = 2;
        options
    }

    #[test]
    fn validation_clamps_at_the_epoch_limit() {
        let options = tiny();
        let mut model = WatermarkModel::new(&options);
        model.set_depth(2);
        // pixels beyond the final limit so the clamp width shows in the distortion
        let images = Tensor::from_fn(Shape::from_slice(&[2, 3, 4, 4]), |i| {
            if (i[1] + i[2] + i[3]) % 2 == 0 { 3.0 } else { -3.0 }
        });
        let dataset = TensorDataset::new(images.clone());
        let limit = Annealing::new(options.enc_scale, 2).limit(0);
        assert_eq!(limit, 5.0);

        let stats = validate(&mut model, &dataset, &mut MessageSource::new(4, 11), &options, limit)
            .unwrap();

        let msg = MessageSource::new(4, 11).sample(2);
        let wide = model.infer(&images, &msg, limit);
        let narrow = model.infer(&images, &msg, 1.0);
        let expected = mean_l2_norm(&images.sub(&wide.encoded));
        let clamped = mean_l2_norm(&images.sub(&narrow.encoded));
        let enc_loss = stats.get("enc_loss").unwrap();
        assert!((enc_loss - expected).abs() < 1e-9, "{enc_loss} vs {expected}");
        assert!(clamped - enc_loss > 1.0, "clamped {clamped} vs {enc_loss}");
    }
}
