//! AMTL - adaptive multi-task gating with bilevel optimization
//!
//! Every task blends a shared and a task-specific hidden representation
//! through a learned gate. The gate is trained by a meta-gradient: the
//! validation loss of a one-step-ahead copy of the model, differentiated
//! through that step.

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod data;
pub mod error;
pub mod gate;
pub mod metrics;
pub mod model;
pub mod tasks;
pub mod training;
pub mod utils;

// Re-exports
pub use config::{Architecture, ExperimentConfig, TrainingMode};
pub use error::{Error, Result};
pub use gate::{GateParameters, GateStrategy, GateVersion};
pub use model::{GatedMultiTaskNet, ParamStore};
pub use tasks::{TaskKind, TaskSpec};
pub use training::{BilevelTrainer, ConsoleReport, SplitLoaders, TrainingHistory};

use std::io::Write;

use candle_core::Device;
use tracing::{info, instrument};

/// A configured run: device, loaders and trainer
pub struct Experiment {
    config: ExperimentConfig,
    device: Device,
    loaders: SplitLoaders,
    trainer: BilevelTrainer,
}

impl Experiment {
    /// Build everything a run needs from a validated configuration
    #[instrument(skip(config))]
    pub fn new(config: ExperimentConfig) -> Result<Self> {
        config.validate()?;
        let device = config.device.to_device()?;
        info!(
            "Initializing {} ({} gate) on {:?}",
            config.model.architecture, config.model.gate_version, device
        );
        let loaders = SplitLoaders::from_config(&config, &device)?;
        let trainer = BilevelTrainer::from_config(&config, &device)?;
        Ok(Self {
            config,
            device,
            loaders,
            trainer,
        })
    }

    /// Train for the configured number of epochs, then write the history
    /// file if one is configured
    pub async fn run<W: Write>(&mut self, report: &mut ConsoleReport<W>) -> Result<TrainingHistory> {
        let history = self
            .trainer
            .fit(&self.loaders, self.config.training.total_epochs, report)
            .await?;
        if let Some(path) = &self.config.training.history_path {
            history.save_json(path)?;
            info!("Epoch history written to {}", path.display());
        }
        Ok(history)
    }

    /// Configuration of the run
    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// Compute device
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Trainer state
    pub fn trainer(&self) -> &BilevelTrainer {
        &self.trainer
    }
}
