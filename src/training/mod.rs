//! Training infrastructure for gated multi-task models
//!
//! # Main Components
//!
//! - **Optimizer**: Adam over an explicit variable list, coupled L2 decay
//! - **Scheduler**: step decay of the model learning rate
//! - **Bilevel**: clone, inner step, gate update and outer update per batch
//!   pair, epoch loop and evaluation. A joint mode steps gate and weights
//!   together on the training loss instead
//! - **Report**: console lines and JSON epoch history
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use amtl::config::ExperimentConfig;
//! use amtl::training::{BilevelTrainer, ConsoleReport, SplitLoaders};
//! use candle_core::Device;
//!
//! let config = ExperimentConfig::default();
//! let device = Device::Cpu;
//! let loaders = SplitLoaders::from_config(&config, &device)?;
//! let mut trainer = BilevelTrainer::from_config(&config, &device)?;
//! let mut report = ConsoleReport::new(std::io::stdout());
//! let history = trainer.fit(&loaders, config.training.total_epochs, &mut report).await?;
//! ```

pub mod bilevel;
pub mod optimizer;
pub mod report;
pub mod scheduler;

pub use bilevel::{
    apply_inner_update, weighted_task_loss, BilevelTrainer, InnerStep, Phase, SplitLoaders,
    StepReport, TaskWeights,
};
pub use optimizer::{Adam, AdamConfig, Optimizer, StepOutcome};
pub use report::{ConsoleReport, EpochRecord, TrainingHistory};
pub use scheduler::{LearningRateScheduler, StepScheduler};
