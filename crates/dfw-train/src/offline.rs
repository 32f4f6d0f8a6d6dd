//! Evaluation passes over a saved checkpoint.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use dfw_tensor::Tensor;
use serde::Serialize;
use tracing::info;

use crate::config::Options;
use crate::dataset::{open_split, Split};
use crate::error::{Error, Result};
use crate::evaluator::{eval_model, eval_step, evaluate_dataset};
use crate::message::MessageSource;
use crate::model::WatermarkModel;
use crate::schedule::FINAL_LIMIT;
use crate::stats::Stats;
use crate::validate::run_dataset;

fn load_eval_model(options: &Options) -> Result<WatermarkModel> {
    options.validate()?;
    let mut model = eval_model(options);
    model.load(&options.paths.checkpoint)?;
    info!(path = %options.paths.checkpoint.display(), "loaded checkpoint");
    Ok(model)
}

fn write_json<T: Serialize + ?Sized>(value: &T, path: &Path) -> Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    std::fs::write(path, text).map_err(|e| Error::io(path, e))
}

fn create_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))
}

/// `Noise type: {noise} | k: v ...`
pub fn test_line(options: &Options, stats: &Stats) -> String {
    format!("Noise type: {} | {stats}", options.noise_type)
}

/// Evaluate the saved checkpoint on the test split.
pub fn test(options: &Options) -> Result<Stats> {
    let mut model = load_eval_model(options)?;
    let dataset = open_split(options, Split::Test)?;
    let mut messages = MessageSource::new(options.msg_l, options.seed);
    let stats = evaluate_dataset(&mut model, dataset.as_ref(), &mut messages, options)?;
    info!("{}", test_line(options, &stats));
    Ok(stats)
}

pub struct PerUserReport {
    /// `[n_users, msg_l]`
    pub users: Tensor,
    pub stats: Vec<Stats>,
    pub stats_path: PathBuf,
    pub users_path: PathBuf,
}

/// Evaluate the saved checkpoint once per distinct message, each message
/// embedded in every test image.
///
/// Writes `list_stats.json` and `users.csv` under `paths.output_dir`.
pub fn test_per_user(options: &Options) -> Result<PerUserReport> {
    let mut model = load_eval_model(options)?;
    let dataset = open_split(options, Split::Test)?;
    let users = MessageSource::new(options.msg_l, options.seed).sample_distinct(options.n_users);

    let mut step = eval_step(options);
    let mut stats = Vec::with_capacity(options.n_users);
    for (index, user) in users.rows().enumerate() {
        let message = Tensor::from_slice(user);
        let user_stats = run_dataset(
            &mut model,
            &mut step,
            dataset.as_ref(),
            options.batch_size,
            |n| message.repeat_rows(n),
        )?;
        info!(user = index, stats = %user_stats, "user evaluated");
        stats.push(user_stats);
    }

    let dir = &options.paths.output_dir;
    create_dir(dir)?;
    let stats_path = dir.join("list_stats.json");
    write_json(&stats, &stats_path)?;

    let users_path = dir.join("users.csv");
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(&users_path)?;
    for user in users.rows() {
        writer.write_record(user.iter().map(|&b| if b > 0.5 { "1" } else { "0" }))?;
    }
    writer.flush().map_err(|e| Error::io(&users_path, e))?;
    info!(stats = %stats_path.display(), users = %users_path.display(), "per-user results written");

    Ok(PerUserReport {
        users,
        stats,
        stats_path,
        users_path,
    })
}

pub struct ExamplesReport {
    pub dir: PathBuf,
    /// Wrong bits per example, after decoding.
    pub bit_errors: Vec<usize>,
}

/// Run the first `n_imgs` test images through the saved checkpoint and
/// write every stage to `examples_{noise}/examples.safetensors`, plus
/// `qualitative_eval.json` with the bit errors per example.
pub fn save_examples(options: &Options) -> Result<ExamplesReport> {
    let mut model = load_eval_model(options)?;
    let dataset = open_split(options, Split::Test)?;
    let count = options.n_imgs.min(dataset.len());
    if count == 0 {
        return Err(Error::Dataset("no test images to export".into()));
    }
    let samples: Vec<Tensor> = (0..count).map(|i| dataset.get(i)).collect();
    let cover = Tensor::stack(&samples.iter().collect::<Vec<_>>());

    let message = MessageSource::new(options.msg_l, options.seed).sample(count);
    let step = eval_step(options);
    let coded = match &step.code {
        Some(code) => code.encode_batch(&message),
        None => message.clone(),
    };
    let pass = model.infer(&cover, &coded, FINAL_LIMIT);
    let hard = pass.logits.map(|z| if z > 0.0 { 1.0 } else { 0.0 });
    let decoded = match &step.code {
        Some(code) => code.decode_batch(&hard),
        None => hard,
    };

    let peak = pass.watermark.max_abs();
    let watermark = if peak > 0.0 {
        pass.watermark.scale(1.0 / peak)
    } else {
        pass.watermark.clone()
    };

    let bit_errors: Vec<usize> = decoded
        .rows()
        .zip(message.rows())
        .map(|(d, m)| d.iter().zip(m).filter(|(a, b)| a != b).count())
        .collect();

    let dir = options
        .paths
        .output_dir
        .join(format!("examples_{}", options.noise_type));
    create_dir(&dir)?;

    let tensors: BTreeMap<String, Tensor> = [
        ("cover", cover),
        ("watermark", watermark),
        ("encoded", pass.encoded),
        ("noised", pass.noised),
        ("message", message),
        ("decoded", decoded),
    ]
    .into_iter()
    .map(|(name, t)| (name.to_string(), t))
    .collect();
    let metadata = BTreeMap::from([
        ("noise_type".to_string(), options.noise_type.to_string()),
        ("watermark_peak".to_string(), peak.to_string()),
    ]);
    dfw_safetensors::save_with_metadata(&tensors, &metadata, &dir.join("examples.safetensors"))?;

    let errors: BTreeMap<usize, usize> = bit_errors.iter().copied().enumerate().collect();
    write_json(&errors, &dir.join("qualitative_eval.json"))?;
    info!(dir = %dir.display(), count, "examples written");

    Ok(ExamplesReport { dir, bit_errors })
}
