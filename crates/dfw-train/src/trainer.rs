use dfw_nn::{DataLoader, Dataset};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info};

use crate::config::Options;
use crate::dataset::{open_split, Split};
use crate::error::{Error, Result};
use crate::evaluator::{EvalJob, Evaluator};
use crate::message::MessageSource;
use crate::metrics_log::MetricsLog;
use crate::model::WatermarkModel;
use crate::schedule::Annealing;
use crate::stats::Stats;
use crate::strategy::{Batch, Strategy, TrainStep};
use crate::validate::validate;

/// What one epoch produced.
#[derive(Debug, Clone)]
pub struct EpochReport {
    pub epoch: usize,
    pub enc_scale: f64,
    pub limit: f64,
    /// Stats of the last training batch.
    pub train: Stats,
    pub validation: Stats,
}

#[derive(Debug, Clone)]
pub struct TrainReport {
    pub epochs: Vec<EpochReport>,
    pub best_val_loss: f64,
    /// Epochs after which the checkpoint was written.
    pub saved_epochs: Vec<usize>,
}

/// Annealed training from the pretraining checkpoint.
///
/// ```ignore
/// let report = Trainer::new(&options).with_evaluator(true).run()?;
/// ```
pub struct Trainer<'a> {
    options: &'a Options,
    evaluate: bool,
}

impl<'a> Trainer<'a> {
    pub fn new(options: &'a Options) -> Self {
        Self {
            options,
            evaluate: true,
        }
    }

    /// Run the background evaluator every `save_freq` epochs (default on).
    pub fn with_evaluator(mut self, evaluate: bool) -> Self {
        self.evaluate = evaluate;
        self
    }

    pub fn run(&self) -> Result<TrainReport> {
        let options = self.options;
        options.validate()?;
        let pretrain = &options.paths.pretrain;
        if !pretrain.exists() {
            return Err(Error::MissingPretrainCheckpoint(pretrain.clone()));
        }

        let mut model = WatermarkModel::new(options);
        model.set_depth(options.model.max_depth);
        model.load(pretrain).map_err(|e| match e {
            Error::MissingCheckpoint(path) => Error::MissingPretrainCheckpoint(path),
            other => other,
        })?;
        info!(path = %pretrain.display(), depth = model.depth(), "loaded pretraining checkpoint");

        let train = open_split(options, Split::Train)?;
        let dev = open_split(options, Split::Dev)?;
        if dev.is_empty() {
            return Err(Error::Dataset(
                "dev split is empty, checkpoints are selected by validation loss".into(),
            ));
        }
        let mut log = MetricsLog::create(&options.paths.train_log)?;
        let evaluator = if self.evaluate {
            Some(Evaluator::spawn(options)?)
        } else {
            None
        };

        let annealing = Annealing::new(options.enc_scale, options.annealing_epochs);
        let mut step = TrainStep::new(options.lr, options.dec_scale);
        let mut shuffle_rng = ChaCha8Rng::seed_from_u64(options.seed.wrapping_add(5 << 16));
        let mut train_messages = MessageSource::new(model.msg_len(), options.seed.wrapping_add(6 << 16));
        let mut dev_messages = MessageSource::new(model.msg_len(), options.seed.wrapping_add(7 << 16));

        let mut report = TrainReport {
            epochs: Vec::with_capacity(options.epochs),
            best_val_loss: f64::INFINITY,
            saved_epochs: Vec::new(),
        };

        for epoch in 0..options.epochs {
            step.set_epoch(&annealing, epoch);
            let mut last = Stats::new();
            for images in DataLoader::new(train.as_ref(), options.batch_size).shuffle(&mut shuffle_rng) {
                let messages = train_messages.sample(images.batch_len());
                last = step.step(&mut model, &Batch::new(images, messages))?;
                debug!(epoch, stats = %last, "train batch");
            }

            if epoch % options.save_freq == 0 {
                log.epoch(epoch, &last)?;
                if let Some(evaluator) = &evaluator {
                    evaluator.submit(EvalJob {
                        epoch,
                        checkpoint: model.state_dict(),
                    });
                }
            }

            let validation = validate(
                &mut model,
                dev.as_ref(),
                &mut dev_messages,
                options,
                step.limit(),
            )?;
            let val_loss = validation.get("loss").unwrap_or(f64::INFINITY);
            info!(
                epoch,
                enc_scale = step.enc_scale(),
                limit = step.limit(),
                train = %last,
                val_loss,
                "epoch done"
            );
            if val_loss <= report.best_val_loss {
                log.line(&format!(
                    "Validation loss decreased ({:.6} --> {val_loss:.6}).  Saving model ...",
                    report.best_val_loss
                ))?;
                model.save(&options.paths.checkpoint)?;
                report.best_val_loss = val_loss;
                report.saved_epochs.push(epoch);
            }

            report.epochs.push(EpochReport {
                epoch,
                enc_scale: step.enc_scale(),
                limit: step.limit(),
                train: last,
                validation,
            });
        }

        if let Some(evaluator) = evaluator {
            evaluator.shutdown();
        }
        info!(best_val_loss = report.best_val_loss, "training finished");
        Ok(report)
    }
}
