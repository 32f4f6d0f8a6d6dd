//! Progressive-depth pretraining of the message round trip.

use tracing::{debug, info};

use crate::config::Options;
use crate::error::{Error, Result};
use crate::message::MessageSource;
use crate::model::WatermarkModel;
use crate::stats::Stats;
use crate::strategy::{Batch, PretrainStep, Strategy};

/// Depth after a successful step at `depth`. Depth 2 skips ahead to 4.
pub fn next_depth(depth: usize) -> usize {
    if depth == 2 {
        depth + 2
    } else {
        depth + 1
    }
}

/// Growth rule for pretraining.
#[derive(Debug, Clone)]
pub struct Curriculum {
    pub threshold: f64,
    pub pretrain_depth: usize,
    pub max_attempts: Option<u64>,
}

impl Curriculum {
    pub fn from_options(options: &Options) -> Self {
        Self {
            threshold: options.curriculum.threshold,
            pretrain_depth: options.model.pretrain_depth,
            max_attempts: options.curriculum.max_attempts_per_depth,
        }
    }

    /// Depth to use after a step at `depth` that scored `loss`.
    pub fn advance(&self, depth: usize, loss: f64) -> usize {
        if loss < self.threshold {
            next_depth(depth)
        } else {
            depth
        }
    }

    pub fn finished(&self, depth: usize) -> bool {
        depth > self.pretrain_depth
    }
}

#[derive(Debug, Clone, Default)]
pub struct PretrainReport {
    /// `(depth left, loss that triggered growth)` per transition.
    pub transitions: Vec<(usize, f64)>,
    pub steps: u64,
    pub final_depth: usize,
}

/// Grow `model` from depth 1 until the curriculum is finished.
///
/// Every step draws a fresh batch of messages. Returns
/// `Error::CurriculumStalled` when a cap is set and one depth uses it up.
pub fn run_curriculum(
    model: &mut WatermarkModel,
    curriculum: &Curriculum,
    step: &mut PretrainStep,
    messages: &mut MessageSource,
    batch_size: usize,
) -> Result<PretrainReport> {
    let mut report = PretrainReport::default();
    let mut depth = 1;
    let mut attempts = 0u64;
    model.set_depth(depth);

    while !curriculum.finished(depth) {
        let batch = Batch::messages_only(messages.sample(batch_size));
        let stats: Stats = step.step(model, &batch)?;
        let loss = stats.get("loss").unwrap_or(f64::INFINITY);
        report.steps += 1;
        attempts += 1;

        let next = curriculum.advance(depth, loss);
        if next != depth {
            info!("Grown: {depth}/{} | loss: {loss}", curriculum.pretrain_depth);
            report.transitions.push((depth, loss));
            depth = next;
            attempts = 0;
            model.set_depth(depth);
        } else if let Some(cap) = curriculum.max_attempts {
            if attempts >= cap {
                return Err(Error::CurriculumStalled {
                    depth,
                    attempts,
                    last_loss: loss,
                });
            }
        } else if attempts % 1000 == 0 {
            debug!(depth, attempts, loss, "still pretraining");
        }
    }

    report.final_depth = model.depth();
    Ok(report)
}

/// Pretrain a fresh model per `options` and save it to `paths.pretrain`.
pub fn pretrain(options: &Options) -> Result<PretrainReport> {
    options.validate()?;
    let mut model = WatermarkModel::new(options);
    let curriculum = Curriculum::from_options(options);
    let mut step = PretrainStep::new(options.lr);
    let mut messages = MessageSource::new(model.msg_len(), options.seed);
    info!(
        pretrain_depth = curriculum.pretrain_depth,
        threshold = curriculum.threshold,
        "pretraining"
    );

    let report = run_curriculum(
        &mut model,
        &curriculum,
        &mut step,
        &mut messages,
        options.batch_size,
    )?;
    model.save(&options.paths.pretrain)?;
    info!(
        steps = report.steps,
        path = %options.paths.pretrain.display(),
        "pretraining checkpoint saved"
    );
    Ok(report)
}
