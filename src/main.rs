use std::path::PathBuf;

use amtl::config::{Architecture, DeviceType, ExperimentConfig, TrainingMode};
use amtl::gate::GateVersion;
use amtl::utils::autograd::enable_higher_order_gradients;
use amtl::{ConsoleReport, Experiment};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "amtl")]
#[command(about = "Adaptive multi-task gating trained by bilevel optimization", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a gated multi-task model
    Train(TrainArgs),

    /// Validate configuration file
    Config {
        /// Configuration file to validate
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Show system information
    Info,
}

#[derive(Args)]
struct TrainArgs {
    /// JSON configuration file; flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Model family: AMTL or AMTL_new
    #[arg(long)]
    model: Option<String>,

    /// Gate version: v1, v2 or v3
    #[arg(long = "version")]
    gate_version: Option<String>,

    /// Gate training: bilevel (meta-gradient) or joint (single level)
    #[arg(long)]
    mode: Option<String>,

    /// Number of epochs
    #[arg(long = "total-epoch")]
    total_epoch: Option<usize>,

    /// Random horizontal flips on the training split
    #[arg(long)]
    aug: bool,

    /// Seed for weights, data order, dropout and gate noise
    #[arg(long)]
    seed: Option<u64>,

    /// Batch size (defaults to the model family's)
    #[arg(long = "batch-size")]
    batch_size: Option<usize>,

    /// Device: cpu, cuda or metal
    #[arg(long, env = "AMTL_DEVICE")]
    device: Option<String>,

    /// GPU ordinal; implies cuda unless --device says otherwise
    #[arg(long = "gpu-id")]
    gpu_id: Option<usize>,

    /// Write the per-epoch history as JSON
    #[arg(long)]
    history: Option<PathBuf>,
}

fn main() -> Result<()> {
    // Logs go to stderr; stdout carries only the training report
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // Must precede the first backward pass on any thread
    enable_higher_order_gradients();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train(args) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to start async runtime")?;
            runtime.block_on(train(args))?;
        }

        Commands::Config { file } => {
            validate_config(file)?;
        }

        Commands::Info => {
            show_system_info();
        }
    }

    Ok(())
}

fn build_config(args: &TrainArgs) -> Result<ExperimentConfig> {
    let mut config = match &args.config {
        Some(path) => ExperimentConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration file {}", path.display()))?,
        None => ExperimentConfig::default(),
    };

    if let Some(model) = &args.model {
        config.model.architecture = model.parse::<Architecture>()?;
    }
    if let Some(version) = &args.gate_version {
        config.model.gate_version = version.parse::<GateVersion>()?;
    }
    if let Some(mode) = &args.mode {
        config.training.mode = mode.parse::<TrainingMode>()?;
    }
    if let Some(epochs) = args.total_epoch {
        config.training.total_epochs = epochs;
    }
    if args.aug {
        config.data.augment = true;
    }
    if let Some(seed) = args.seed {
        config.training.seed = seed;
        config.data.seed = seed;
    }
    if let Some(batch_size) = args.batch_size {
        config.training.batch_size = Some(batch_size);
    }
    if let Some(gpu_id) = args.gpu_id {
        config.device.device_type = DeviceType::Cuda;
        config.device.device_id = gpu_id;
    }
    if let Some(device) = &args.device {
        config.device.device_type = device.parse::<DeviceType>()?;
    }
    if let Some(history) = &args.history {
        config.training.history_path = Some(history.clone());
    }

    config.validate()?;
    Ok(config)
}

async fn train(args: TrainArgs) -> Result<()> {
    let config = build_config(&args).context("Invalid configuration")?;
    info!(
        "Model {} | gate {} ({}) | epochs {} | batch size {} | seed {}",
        config.model.architecture,
        config.model.gate_version,
        config.training.mode,
        config.training.total_epochs,
        config.batch_size(),
        config.training.seed
    );

    let mut experiment = Experiment::new(config).context("Failed to initialize experiment")?;
    let mut report = ConsoleReport::new(std::io::stdout().lock());
    let history = experiment.run(&mut report).await.context("Training failed")?;

    if let Some(last) = history.last() {
        info!(
            "Training complete: {} epochs, last epoch took {:.2}s",
            history.len(),
            last.elapsed_secs
        );
    }
    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    info!("Validating configuration file: {}", config_path.display());

    let config = ExperimentConfig::from_file(&config_path)
        .context("Failed to load configuration file")?;

    info!("Configuration is valid");
    info!(
        "  - Model: {} ({} gate, {} training)",
        config.model.architecture,
        config.model.gate_version,
        config.training.mode
    );
    info!(
        "  - Tasks: {}",
        config
            .model
            .tasks
            .iter()
            .map(|t| t.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    info!("  - Epochs: {}, batch size {}", config.training.total_epochs, config.batch_size());
    info!(
        "  - Learning rates: model {:e}, gate {:e}, inner step {:e}",
        config.optimizer.learning_rate,
        config.optimizer.gate_learning_rate,
        config.bilevel.inner_step_size
    );

    Ok(())
}

fn show_system_info() {
    println!("AMTL - adaptive multi-task gating");
    println!();
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Gate versions:");
    println!("  v1  softmax over (shared, specific)");
    println!("  v2  independent sigmoids");
    println!("  v3  hard Gumbel-softmax, thresholded at inference");
    println!();
    println!("Hardware support:");

    #[cfg(feature = "cuda")]
    println!("  [x] NVIDIA CUDA GPU acceleration");
    #[cfg(not(feature = "cuda"))]
    println!("  [ ] CUDA support (not compiled)");

    #[cfg(feature = "metal")]
    println!("  [x] Apple Metal GPU acceleration");
    #[cfg(not(feature = "metal"))]
    println!("  [ ] Metal support (not compiled)");

    #[cfg(feature = "accelerate")]
    println!("  [x] Apple Accelerate framework");
    #[cfg(not(feature = "accelerate"))]
    println!("  [ ] Accelerate support (not compiled)");

    println!("  [x] CPU");
    println!();
    println!("Usage:");
    println!("  amtl train --model AMTL --version v1 --total-epoch 200");
    println!("  amtl train --version v2 --mode joint  # Single-level baseline");
    println!("  amtl config -f config.json  # Validate configuration");
    println!("  amtl info                   # Show this information");
}
