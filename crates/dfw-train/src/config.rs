//! Options bundle shared by every loop.
//!
//! Loaded from TOML, every field optional and defaulted. `validate` runs
//! after loading and after CLI overrides, and fails fast on the first bad
//! value.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Where a loop runs. Only the CPU backend exists; the field is kept so the
/// trainer and the background evaluator can be assigned separately.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
        }
    }
}

impl FromStr for Device {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Device::Cpu),
            other => Err(Error::Config(format!("unknown device '{other}'"))),
        }
    }
}

/// Channel simulated between encoder and decoder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoiseType {
    #[default]
    Identity,
    Gaussian,
    Dropout,
    Cropout,
    Crop,
    Jpeg,
    Combined,
}

impl NoiseType {
    pub const ALL: [NoiseType; 7] = [
        NoiseType::Identity,
        NoiseType::Gaussian,
        NoiseType::Dropout,
        NoiseType::Cropout,
        NoiseType::Crop,
        NoiseType::Jpeg,
        NoiseType::Combined,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NoiseType::Identity => "identity",
            NoiseType::Gaussian => "gaussian",
            NoiseType::Dropout => "dropout",
            NoiseType::Cropout => "cropout",
            NoiseType::Crop => "crop",
            NoiseType::Jpeg => "jpeg",
            NoiseType::Combined => "combined",
        }
    }
}

impl fmt::Display for NoiseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NoiseType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_ascii_lowercase();
        NoiseType::ALL
            .into_iter()
            .find(|n| n.as_str() == lower)
            .ok_or_else(|| Error::Config(format!("unknown noise type '{s}'")))
    }
}

/// Encoder/decoder capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelOptions {
    /// Width of the residual trunk.
    pub hidden: usize,
    /// Depth used for training and evaluation.
    pub max_depth: usize,
    /// Depth the curriculum grows to before full training.
    pub pretrain_depth: usize,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            hidden: 64,
            max_depth: 9,
            pretrain_depth: 5,
        }
    }
}

/// Depth-growing pretraining.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CurriculumOptions {
    /// Round-trip loss below which the model grows.
    pub threshold: f64,
    /// Give up after this many steps at one depth. Unbounded when unset.
    pub max_attempts_per_depth: Option<u64>,
}

impl Default for CurriculumOptions {
    fn default() -> Self {
        Self {
            threshold: 0.05,
            max_attempts_per_depth: None,
        }
    }
}

/// Parameters of the individual noise channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseOptions {
    /// Standard deviation of additive gaussian noise.
    pub gaussian_std: f64,
    /// Fraction of encoded pixels kept by dropout.
    pub dropout_keep: f64,
    /// Side fraction of the encoded window kept by cropout and crop.
    pub crop_keep: f64,
    /// Number of low-frequency DCT diagonals kept per 8x8 block by jpeg.
    pub jpeg_keep: usize,
}

impl Default for NoiseOptions {
    fn default() -> Self {
        Self {
            gaussian_std: 0.1,
            dropout_keep: 0.7,
            crop_keep: 0.7,
            jpeg_keep: 5,
        }
    }
}

/// Image source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DataSource {
    /// Procedurally generated images, reproducible from the seed.
    #[default]
    Synthetic,
    /// A safetensors file holding `train`, `dev` and `test` tensors of
    /// shape `[N, C, H, W]` in `[-1, 1]`.
    Safetensors { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataOptions {
    /// Split sizes for the synthetic source.
    pub n_train: usize,
    pub n_dev: usize,
    pub n_test: usize,
    pub source: DataSource,
}

impl Default for DataOptions {
    fn default() -> Self {
        Self {
            n_train: 256,
            n_dev: 64,
            n_test: 64,
            source: DataSource::default(),
        }
    }
}

/// Files read and written by the loops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathOptions {
    pub checkpoint: PathBuf,
    pub pretrain: PathBuf,
    pub train_log: PathBuf,
    pub test_log: PathBuf,
    /// Directory for example renders, `qualitative_eval.json`,
    /// `list_stats.json` and `users.csv`.
    pub output_dir: PathBuf,
}

impl Default for PathOptions {
    fn default() -> Self {
        Self {
            checkpoint: PathBuf::from("./dfw.safetensors"),
            pretrain: PathBuf::from("./pretrain.safetensors"),
            train_log: PathBuf::from("./train.log"),
            test_log: PathBuf::from("./test.log"),
            output_dir: PathBuf::from("."),
        }
    }
}

/// Everything the loops need, passed explicitly instead of read from
/// globals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    pub img_size: usize,
    pub channels: usize,
    pub msg_l: usize,
    pub batch_size: usize,
    pub device: Device,
    pub test_device: Device,
    pub epochs: usize,
    pub enc_scale: f64,
    pub dec_scale: f64,
    pub annealing_epochs: usize,
    pub save_freq: usize,
    pub n_imgs: usize,
    pub noise_type: NoiseType,
    pub use_hamming: bool,
    pub n_users: usize,
    pub lr: f64,
    pub seed: u64,
    pub model: ModelOptions,
    pub curriculum: CurriculumOptions,
    pub noise: NoiseOptions,
    pub data: DataOptions,
    pub paths: PathOptions,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            img_size: 16,
            channels: 3,
            msg_l: 32,
            batch_size: 16,
            device: Device::Cpu,
            test_device: Device::Cpu,
            epochs: 100,
            enc_scale: 0.7,
            dec_scale: 1.0,
            annealing_epochs: 20,
            save_freq: 5,
            n_imgs: 8,
            noise_type: NoiseType::Identity,
            use_hamming: false,
            n_users: 10,
            lr: 1e-3,
            seed: 0,
            model: ModelOptions::default(),
            curriculum: CurriculumOptions::default(),
            noise: NoiseOptions::default(),
            data: DataOptions::default(),
            paths: PathOptions::default(),
        }
    }
}

impl Options {
    /// Load and validate options from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let options = Self::from_toml(&content)?;
        options.validate()?;
        Ok(options)
    }

    /// Parse without validating.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("failed to parse options: {e}")))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("failed to serialize options: {e}")))
    }

    /// Length of the message as seen by the networks: the raw length, or
    /// the Hamming(7,4) codeword length when coding is on.
    pub fn coded_msg_l(&self) -> usize {
        if self.use_hamming {
            self.msg_l / 4 * 7
        } else {
            self.msg_l
        }
    }

    pub fn validate(&self) -> Result<()> {
        fn positive(name: &str, value: usize) -> Result<()> {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be greater than 0")));
            }
            Ok(())
        }

        positive("img_size", self.img_size)?;
        positive("msg_l", self.msg_l)?;
        positive("batch_size", self.batch_size)?;
        positive("annealing_epochs", self.annealing_epochs)?;
        positive("save_freq", self.save_freq)?;
        positive("model.hidden", self.model.hidden)?;
        positive("model.max_depth", self.model.max_depth)?;
        positive("model.pretrain_depth", self.model.pretrain_depth)?;

        if !matches!(self.channels, 1 | 3) {
            return Err(Error::Config(format!(
                "channels must be 1 or 3, got {}",
                self.channels
            )));
        }
        if self.model.pretrain_depth > self.model.max_depth {
            return Err(Error::Config(format!(
                "model.pretrain_depth ({}) exceeds model.max_depth ({})",
                self.model.pretrain_depth, self.model.max_depth
            )));
        }
        if self.use_hamming && self.msg_l % 4 != 0 {
            return Err(Error::Config(format!(
                "msg_l must be a multiple of 4 with use_hamming, got {}",
                self.msg_l
            )));
        }
        if !(self.enc_scale >= 0.0 && self.enc_scale.is_finite()) {
            return Err(Error::Config("enc_scale must be finite and >= 0".into()));
        }
        if !(self.dec_scale >= 0.0 && self.dec_scale.is_finite()) {
            return Err(Error::Config("dec_scale must be finite and >= 0".into()));
        }
        if !(self.lr > 0.0 && self.lr.is_finite()) {
            return Err(Error::Config("lr must be finite and > 0".into()));
        }
        if !(self.curriculum.threshold > 0.0) {
            return Err(Error::Config("curriculum.threshold must be > 0".into()));
        }
        if self.curriculum.max_attempts_per_depth == Some(0) {
            return Err(Error::Config(
                "curriculum.max_attempts_per_depth must be greater than 0".into(),
            ));
        }

        let noise = &self.noise;
        if !(noise.gaussian_std >= 0.0) {
            return Err(Error::Config("noise.gaussian_std must be >= 0".into()));
        }
        for (name, value) in [
            ("noise.dropout_keep", noise.dropout_keep),
            ("noise.crop_keep", noise.crop_keep),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(Error::Config(format!("{name} must be in (0, 1], got {value}")));
            }
        }
        if matches!(self.noise_type, NoiseType::Jpeg | NoiseType::Combined) {
            if self.img_size % 8 != 0 {
                return Err(Error::Config(format!(
                    "jpeg noise needs img_size divisible by 8, got {}",
                    self.img_size
                )));
            }
            if noise.jpeg_keep == 0 || noise.jpeg_keep > 15 {
                return Err(Error::Config(format!(
                    "noise.jpeg_keep must be in 1..=15, got {}",
                    noise.jpeg_keep
                )));
            }
        }

        if self.data.source == DataSource::Synthetic {
            positive("data.n_train", self.data.n_train)?;
            positive("data.n_dev", self.data.n_dev)?;
            positive("data.n_test", self.data.n_test)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Options::default().validate().unwrap();
    }

    #[test]
    fn toml_round_trip() {
        let mut options = Options::default();
        options.noise_type = NoiseType::Cropout;
        options.curriculum.max_attempts_per_depth = Some(500);
        options.data.source = DataSource::Safetensors {
            path: PathBuf::from("images.safetensors"),
        };
        let text = options.to_toml().unwrap();
        assert_eq!(Options::from_toml(&text).unwrap(), options);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let options = Options::from_toml(
            r#"
            msg_l = 8
            noise_type = "dropout"

            [model]
            max_depth = 4
            "#,
        )
        .unwrap();
        assert_eq!(options.msg_l, 8);
        assert_eq!(options.noise_type, NoiseType::Dropout);
        assert_eq!(options.model.max_depth, 4);
        assert_eq!(options.model.pretrain_depth, 5);
        assert_eq!(options.batch_size, Options::default().batch_size);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let cases: Vec<fn(&mut Options)> = vec![
            |o| o.msg_l = 0,
            |o| o.channels = 2,
            |o| o.model.pretrain_depth = o.model.max_depth + 1,
            |o| {
                o.use_hamming = true;
                o.msg_l = 30;
            },
            |o| o.lr = 0.0,
            |o| o.noise.dropout_keep = 1.5,
            |o| {
                o.noise_type = NoiseType::Jpeg;
                o.img_size = 12;
            },
            |o| o.curriculum.max_attempts_per_depth = Some(0),
            |o| o.save_freq = 0,
            |o| o.data.n_dev = 0,
        ];
        for (i, mutate) in cases.into_iter().enumerate() {
            let mut options = Options::default();
            mutate(&mut options);
            assert!(
                matches!(options.validate(), Err(Error::Config(_))),
                "case {i} passed validation"
            );
        }
    }

    #[test]
    fn hamming_widens_message() {
        let mut options = Options::default();
        assert_eq!(options.coded_msg_l(), 32);
        options.use_hamming = true;
        assert_eq!(options.coded_msg_l(), 56);
    }

    #[test]
    fn noise_type_parses_case_insensitively() {
        assert_eq!("JPEG".parse::<NoiseType>().unwrap(), NoiseType::Jpeg);
        assert!("blur".parse::<NoiseType>().is_err());
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
    }
}
