//! Background evaluation of training checkpoints on the test split.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use dfw_nn::Dataset;
use tracing::{debug, error, info, warn};

use crate::config::Options;
use crate::dataset::{open_split, Split};
use crate::ecc::{Hamming74, MessageCode};
use crate::error::{Error, Result};
use crate::message::MessageSource;
use crate::metrics_log::MetricsLog;
use crate::model::{StateDict, WatermarkModel};
use crate::queue::JoinableQueue;
use crate::stats::Stats;
use crate::strategy::EvalStep;
use crate::validate::run_dataset;

/// A snapshot of the training model at the end of `epoch`.
pub struct EvalJob {
    pub epoch: usize,
    pub checkpoint: StateDict,
}

/// Evaluation step with the base loss weights and, if configured, the
/// Hamming code around the channel.
pub fn eval_step(options: &Options) -> EvalStep {
    let code: Option<Box<dyn MessageCode>> = if options.use_hamming {
        Some(Box::new(Hamming74))
    } else {
        None
    };
    EvalStep {
        enc_scale: options.enc_scale,
        dec_scale: options.dec_scale,
        code,
    }
}

/// Evaluate `model` on `dataset` in order with a fresh random
/// `msg_l`-bit message per sample.
pub fn evaluate_dataset(
    model: &mut WatermarkModel,
    dataset: &dyn Dataset,
    messages: &mut MessageSource,
    options: &Options,
) -> Result<Stats> {
    let mut step = eval_step(options);
    run_dataset(model, &mut step, dataset, options.batch_size, |n| {
        messages.sample(n)
    })
}

/// Model for evaluation: full depth, seeded apart from the training model.
pub fn eval_model(options: &Options) -> WatermarkModel {
    let mut model = WatermarkModel::new(options);
    model.set_depth(options.model.max_depth);
    model.reseed_noise(options.seed.wrapping_add(3 << 16));
    model
}

struct Worker {
    model: WatermarkModel,
    dataset: Box<dyn Dataset>,
    messages: MessageSource,
    log: MetricsLog,
    options: Options,
}

impl Worker {
    fn evaluate(&mut self, job: &EvalJob) -> Result<Stats> {
        self.model.load_state_dict(&job.checkpoint)?;
        let stats = evaluate_dataset(
            &mut self.model,
            self.dataset.as_ref(),
            &mut self.messages,
            &self.options,
        )?;
        self.log.epoch(job.epoch, &stats)?;
        Ok(stats)
    }

    fn run(mut self, queue: &JoinableQueue<EvalJob>) {
        let _guard = queue.consumer_guard();
        while let Some(job) = queue.get() {
            match self.evaluate(&job) {
                Ok(stats) => {
                    debug!(epoch = job.epoch, %stats, "evaluated");
                    queue.task_done();
                }
                Err(e) => {
                    error!(epoch = job.epoch, error = %e, "evaluation failed, evaluator stopping");
                    return;
                }
            }
        }
    }
}

/// Owns the evaluation thread and the queue feeding it.
pub struct Evaluator {
    queue: Arc<JoinableQueue<EvalJob>>,
    handle: Option<JoinHandle<()>>,
}

impl Evaluator {
    /// Open the test split and evaluation log, then start the worker.
    pub fn spawn(options: &Options) -> Result<Self> {
        let dataset = open_split(options, Split::Test)?;
        let log = MetricsLog::create(&options.paths.test_log)?;
        let worker = Worker {
            model: eval_model(options),
            dataset,
            messages: MessageSource::new(options.msg_l, options.seed.wrapping_add(4 << 16)),
            log,
            options: options.clone(),
        };
        let queue = Arc::new(JoinableQueue::new());
        let handle = {
            let queue = Arc::clone(&queue);
            thread::Builder::new()
                .name("dfw-evaluator".into())
                .spawn(move || worker.run(&queue))
                .map_err(Error::Spawn)?
        };
        info!(device = %options.test_device, log = %options.paths.test_log.display(), "evaluator started");
        Ok(Self {
            queue,
            handle: Some(handle),
        })
    }

    /// Queue a checkpoint. Returns `false` if the worker is no longer
    /// consuming.
    pub fn submit(&self, job: EvalJob) -> bool {
        if self.queue.consumer_gone() {
            warn!(epoch = job.epoch, "evaluator is gone, dropping job");
            return false;
        }
        self.queue.put(job).is_ok()
    }

    /// Wait for every submitted job to be evaluated.
    pub fn join(&self) {
        self.queue.join();
    }

    /// Drain the queue, then stop and join the worker.
    pub fn shutdown(mut self) {
        self.queue.join();
        self.stop();
    }

    fn stop(&mut self) {
        self.queue.close();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("evaluator thread panicked");
            }
        }
    }
}

impl Drop for Evaluator {
    fn drop(&mut self) {
        self.stop();
    }
}
