//! Configuration structures for AMTL experiments

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::data::{DataLoaderConfig, SyntheticConfig};
use crate::error::{Error, Result};
use crate::gate::{GateVersion, DEFAULT_GUMBEL_TEMPERATURE};
use crate::tasks::{scene_tasks, validate_tasks, TaskSpec};
use crate::utils::validation::{validate_dropout, validate_positive};

/// Full experiment configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Network and gate
    pub model: ModelConfig,
    /// Model and gate optimizers
    pub optimizer: OptimizerConfig,
    /// Inner (virtual) step
    pub bilevel: BilevelConfig,
    /// Learning-rate schedule of the model optimizer
    pub scheduler: SchedulerConfig,
    /// Mode, epochs, seed, batch size, task weights
    pub training: TrainingConfig,
    /// Dataset splits and loader
    pub data: DataConfig,
    /// Compute device
    pub device: DeviceConfig,
}

impl ExperimentConfig {
    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration as pretty JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        crate::utils::write_file_atomic(path, json.as_bytes())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        self.optimizer.validate()?;
        validate_positive("bilevel.inner_step_size", self.bilevel.inner_step_size)?;
        self.scheduler.validate()?;
        self.data.validate()?;

        if self.training.total_epochs == 0 {
            return Err(Error::config("total_epochs must be > 0"));
        }
        if self.training.batch_size == Some(0) {
            return Err(Error::config("batch_size must be > 0"));
        }
        if let Some(weights) = &self.training.task_weights {
            if weights.len() != self.model.tasks.len() {
                return Err(Error::config(format!(
                    "{} task weights given for {} tasks",
                    weights.len(),
                    self.model.tasks.len()
                )));
            }
            if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
                return Err(Error::config("task weights must be finite and >= 0"));
            }
        }
        Ok(())
    }

    /// Batch size, falling back to the architecture default
    pub fn batch_size(&self) -> usize {
        self.training
            .batch_size
            .unwrap_or_else(|| self.model.architecture.default_batch_size())
    }

    /// Loader settings for a split; only the training split is augmented
    pub fn loader_config(&self, split: Split) -> DataLoaderConfig {
        DataLoaderConfig {
            batch_size: self.batch_size(),
            shuffle: self.data.shuffle && split != Split::Test,
            drop_last: false,
            prefetch_factor: self.data.prefetch_factor,
            seed: self.training.seed.wrapping_add(split.seed_offset()),
            augment: self.data.augment && split == Split::Train,
        }
    }

    /// Synthetic generator settings for a split
    pub fn synthetic_config(&self, split: Split) -> SyntheticConfig {
        let len = match split {
            Split::Train => self.data.train_samples,
            Split::Val => self.data.val_samples,
            Split::Test => self.data.test_samples,
        };
        SyntheticConfig {
            len,
            channels: self.data.channels,
            height: self.data.height,
            width: self.data.width,
            seed: self.data.seed.wrapping_add(split.seed_offset()),
            missing_rate: self.data.missing_rate,
        }
    }
}

/// Dataset split
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Split {
    /// Drives the inner and outer steps
    Train,
    /// Drives the gate step
    Val,
    /// Evaluated after every epoch
    Test,
}

impl Split {
    fn seed_offset(self) -> u64 {
        match self {
            Split::Train => 0,
            Split::Val => 1,
            Split::Test => 2,
        }
    }
}

/// Model family selected on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Architecture {
    /// Gated model, small batches
    #[serde(rename = "AMTL")]
    Amtl,
    /// Gated model, larger batches
    #[serde(rename = "AMTL_new")]
    AmtlNew,
}

impl Architecture {
    /// Batch size used when none is configured
    pub fn default_batch_size(&self) -> usize {
        match self {
            Architecture::Amtl => 2,
            Architecture::AmtlNew => 14,
        }
    }

    /// Canonical name
    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::Amtl => "AMTL",
            Architecture::AmtlNew => "AMTL_new",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "AMTL" => Ok(Architecture::Amtl),
            "AMTL_new" => Ok(Architecture::AmtlNew),
            other => Err(Error::config(format!(
                "No correct model parameter! `{other}` is not one of AMTL, AMTL_new"
            ))),
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Model family
    pub architecture: Architecture,
    /// Gate parameterization
    pub gate_version: GateVersion,
    /// Relaxation temperature of the v3 gate
    pub gumbel_temperature: f64,
    /// Backbone embedding width
    pub feature_dim: usize,
    /// Hidden projection width
    pub hidden_dim: usize,
    /// Dropout after the hidden projection
    pub dropout: f32,
    /// Tasks in index order
    pub tasks: Vec<TaskSpec>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            architecture: Architecture::Amtl,
            gate_version: GateVersion::V1,
            gumbel_temperature: DEFAULT_GUMBEL_TEMPERATURE,
            feature_dim: 64,
            hidden_dim: 32,
            dropout: 0.5,
            tasks: scene_tasks(),
        }
    }
}

impl ModelConfig {
    fn validate(&self) -> Result<()> {
        validate_tasks(&self.tasks)?;
        validate_dropout(self.dropout)?;
        validate_positive("model.gumbel_temperature", self.gumbel_temperature)?;
        if self.feature_dim == 0 || self.hidden_dim == 0 {
            return Err(Error::config("feature_dim and hidden_dim must be > 0"));
        }
        Ok(())
    }
}

/// Adam settings for the model and the gate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Model learning rate
    pub learning_rate: f64,
    /// Model L2 weight decay
    pub weight_decay: f64,
    /// Gate learning rate
    pub gate_learning_rate: f64,
    /// Gate L2 weight decay
    pub gate_weight_decay: f64,
    /// First moment decay
    pub beta1: f64,
    /// Second moment decay
    pub beta2: f64,
    /// Denominator epsilon
    pub eps: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            weight_decay: 1e-5,
            gate_learning_rate: 1e-4,
            gate_weight_decay: 0.0,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

impl OptimizerConfig {
    fn validate(&self) -> Result<()> {
        validate_positive("optimizer.learning_rate", self.learning_rate)?;
        validate_positive("optimizer.gate_learning_rate", self.gate_learning_rate)?;
        validate_positive("optimizer.eps", self.eps)?;
        if self.weight_decay < 0.0 || self.gate_weight_decay < 0.0 {
            return Err(Error::config("weight decay must be >= 0"));
        }
        for (name, beta) in [("beta1", self.beta1), ("beta2", self.beta2)] {
            if !(0.0..1.0).contains(&beta) {
                return Err(Error::config(format!("{name} must be in [0, 1), got {beta}")));
            }
        }
        Ok(())
    }
}

/// Inner-step settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BilevelConfig {
    /// Step size of the differentiable one-step update
    pub inner_step_size: f64,
}

impl Default for BilevelConfig {
    fn default() -> Self {
        Self {
            inner_step_size: 1e-4,
        }
    }
}

/// Step decay of the model learning rate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Epochs between decays
    pub step_size: usize,
    /// Multiplicative decay
    pub gamma: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            step_size: 100,
            gamma: 0.5,
        }
    }
}

impl SchedulerConfig {
    fn validate(&self) -> Result<()> {
        if self.step_size == 0 {
            return Err(Error::config("scheduler.step_size must be > 0"));
        }
        if !(self.gamma > 0.0 && self.gamma <= 1.0) {
            return Err(Error::config(format!(
                "scheduler.gamma must be in (0, 1], got {}",
                self.gamma
            )));
        }
        Ok(())
    }
}

/// How the gate is trained
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrainingMode {
    /// Gate stepped on the validation loss of a one-step-ahead copy
    #[default]
    Bilevel,
    /// Gate and weights stepped together on the training loss
    Joint,
}

impl TrainingMode {
    /// Canonical name
    pub fn as_str(&self) -> &'static str {
        match self {
            TrainingMode::Bilevel => "bilevel",
            TrainingMode::Joint => "joint",
        }
    }
}

impl fmt::Display for TrainingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrainingMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "bilevel" => Ok(TrainingMode::Bilevel),
            "joint" => Ok(TrainingMode::Joint),
            other => Err(Error::config(format!(
                "Unknown training mode `{other}`, expected bilevel or joint"
            ))),
        }
    }
}

/// Run length and reproducibility
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Bilevel or joint gate training
    pub mode: TrainingMode,
    /// Number of epochs
    pub total_epochs: usize,
    /// Seed for weights, gate noise and dropout
    pub seed: u64,
    /// Batch size; `None` uses the architecture default
    pub batch_size: Option<usize>,
    /// Constant per-task loss weights; `None` weights every task 1.0
    pub task_weights: Option<Vec<f64>>,
    /// Where to write the JSON epoch history
    pub history_path: Option<PathBuf>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            mode: TrainingMode::Bilevel,
            total_epochs: 200,
            seed: 0,
            batch_size: None,
            task_weights: None,
            history_path: None,
        }
    }
}

/// Dataset splits and loader behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Training split size
    pub train_samples: usize,
    /// Validation split size
    pub val_samples: usize,
    /// Test split size
    pub test_samples: usize,
    /// Image channels
    pub channels: usize,
    /// Image height
    pub height: usize,
    /// Image width
    pub width: usize,
    /// Fraction of missing targets
    pub missing_rate: f64,
    /// Generator seed
    pub seed: u64,
    /// Random horizontal flips on the training split
    pub augment: bool,
    /// Shuffle training and validation splits
    pub shuffle: bool,
    /// Batches built ahead of the trainer
    pub prefetch_factor: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            train_samples: 64,
            val_samples: 32,
            test_samples: 32,
            channels: 3,
            height: 8,
            width: 8,
            missing_rate: 0.05,
            seed: 0,
            augment: false,
            shuffle: true,
            prefetch_factor: 2,
        }
    }
}

impl DataConfig {
    fn validate(&self) -> Result<()> {
        if self.train_samples == 0 || self.val_samples == 0 || self.test_samples == 0 {
            return Err(Error::config("every split needs at least one sample"));
        }
        if self.channels == 0 || self.height == 0 || self.width == 0 {
            return Err(Error::config("image shape must be positive"));
        }
        if !(0.0..1.0).contains(&self.missing_rate) {
            return Err(Error::config(format!(
                "missing_rate must be in [0, 1), got {}",
                self.missing_rate
            )));
        }
        if self.prefetch_factor == 0 {
            return Err(Error::config("prefetch_factor must be > 0"));
        }
        Ok(())
    }
}

/// Device configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device type
    pub device_type: DeviceType,
    /// Device ordinal
    pub device_id: usize,
}

impl DeviceConfig {
    /// Open the configured device
    pub fn to_device(&self) -> Result<Device> {
        match self.device_type {
            DeviceType::Cpu => Ok(Device::Cpu),
            DeviceType::Cuda => {
                if candle_core::utils::cuda_is_available() {
                    Ok(Device::new_cuda(self.device_id)?)
                } else {
                    Err(Error::config("CUDA is not available on this system"))
                }
            }
            DeviceType::Metal => {
                if candle_core::utils::metal_is_available() {
                    Ok(Device::new_metal(self.device_id)?)
                } else {
                    Err(Error::config("Metal is not available on this system"))
                }
            }
        }
    }
}

/// Device types
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// CPU device
    #[default]
    Cpu,
    /// CUDA GPU
    Cuda,
    /// Metal (Apple Silicon)
    Metal,
}

impl FromStr for DeviceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "cpu" => Ok(DeviceType::Cpu),
            "cuda" | "gpu" => Ok(DeviceType::Cuda),
            "metal" => Ok(DeviceType::Metal),
            other => Err(Error::config(format!("Unknown device: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = ExperimentConfig::default();
        config.validate().unwrap();
        assert_eq!(config.batch_size(), 2);
        assert_eq!(config.training.total_epochs, 200);
        assert_eq!(config.optimizer.gate_weight_decay, 0.0);
    }

    #[test]
    fn test_architecture_parsing() {
        assert_eq!("AMTL".parse::<Architecture>().unwrap(), Architecture::Amtl);
        assert_eq!(
            "AMTL_new".parse::<Architecture>().unwrap(),
            Architecture::AmtlNew
        );
        let err = "MTAN".parse::<Architecture>().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(Architecture::AmtlNew.default_batch_size(), 14);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"model": {{"architecture": "AMTL_new", "gate_version": "v3"}},
                "training": {{"total_epochs": 3, "seed": 42}}}}"#
        )
        .unwrap();

        let config = ExperimentConfig::from_file(file.path()).unwrap();
        assert_eq!(config.model.gate_version, GateVersion::V3);
        assert_eq!(config.batch_size(), 14);
        assert_eq!(config.training.seed, 42);
        assert_eq!(config.model.tasks.len(), 3);
        assert_eq!(config.optimizer.learning_rate, 1e-4);
    }

    #[test]
    fn test_unknown_gate_version_in_file_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"model": {{"gate_version": "v4"}}}}"#).unwrap();
        assert!(ExperimentConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_validation_errors() {
        let mut config = ExperimentConfig::default();
        config.training.task_weights = Some(vec![1.0]);
        assert!(config.validate().is_err());

        let mut config = ExperimentConfig::default();
        config.scheduler.gamma = 0.0;
        assert!(config.validate().is_err());

        let mut config = ExperimentConfig::default();
        config.bilevel.inner_step_size = -1.0;
        assert!(config.validate().is_err());

        let mut config = ExperimentConfig::default();
        config.training.batch_size = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = ExperimentConfig::default();
        config.model.gate_version = GateVersion::V2;
        config.save(&path).unwrap();
        assert_eq!(ExperimentConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_split_settings() {
        let mut config = ExperimentConfig::default();
        config.data.augment = true;
        assert!(config.loader_config(Split::Train).augment);
        assert!(!config.loader_config(Split::Val).augment);
        assert!(!config.loader_config(Split::Test).shuffle);
        assert_ne!(
            config.synthetic_config(Split::Train).seed,
            config.synthetic_config(Split::Val).seed
        );
        assert_eq!(config.synthetic_config(Split::Test).len, 32);
    }

    #[test]
    fn test_training_mode_selection() {
        assert_eq!(ExperimentConfig::default().training.mode, TrainingMode::Bilevel);
        assert_eq!("Joint".parse::<TrainingMode>().unwrap(), TrainingMode::Joint);
        assert!(matches!(
            "alternating".parse::<TrainingMode>().unwrap_err(),
            Error::Config(_)
        ));

        let config: ExperimentConfig =
            serde_json::from_str(r#"{"training": {"mode": "joint"}}"#).unwrap();
        assert_eq!(config.training.mode, TrainingMode::Joint);
        assert!(serde_json::from_str::<ExperimentConfig>(r#"{"training": {"mode": "meta"}}"#)
            .is_err());
    }

    #[test]
    fn test_device_type_parsing() {
        assert_eq!("GPU".parse::<DeviceType>().unwrap(), DeviceType::Cuda);
        assert!("tpu".parse::<DeviceType>().is_err());
        assert!(DeviceConfig::default().to_device().unwrap().is_cpu());
    }
}
