//! Training CLI Tool
//!
//! Fits the license-plate fraud classifier from a TOML configuration, and
//! can re-evaluate a saved run on its validation or test split.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::data::dataset::Dataset;
use burn::module::AutodiffModule;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use plate_core::{
    load_toml_config, save_toml_config, setup_cli_logging, LogOptions, MetricSink, Stage,
    TracingSink, TrainConfig, LOSS_METRIC,
};
use plate_dataset::{
    ClassDirs, ImagePreprocessor, PlateBatcher, PlateImageDataset, PlateItem, PreprocessConfig,
};
use plate_training::{
    backend_name, default_device, evaluate, CheckpointManager, CheckpointMetadata,
    DefaultBackend, PlateClassifier, PlateClassifierConfig, Trainer, TrainerConfig,
    TrainingBackend,
};
use tracing::{info, warn};

/// License-Plate Fraud Classifier Training Tool
#[derive(Parser, Debug)]
#[command(
    name = "train",
    about = "Train the license-plate fraud classifier",
    long_about = "Train the license-plate fraud classifier (ResNet-18 trunk with a \
                  fully-connected head, averaged SGD) from a TOML configuration."
)]
struct Args {
    /// Path to training configuration file (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Override output directory
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Override number of epochs
    #[arg(short, long, value_name = "N")]
    epochs: Option<usize>,

    /// Override learning rate
    #[arg(short, long, value_name = "LR")]
    lr: Option<f64>,

    /// Override batch size
    #[arg(short, long, value_name = "SIZE")]
    batch_size: Option<usize>,

    /// Resume from the latest checkpoint in the output directory
    #[arg(short, long)]
    resume: bool,

    /// Evaluate the best saved model on the validation split (no training)
    #[arg(long)]
    validate_only: bool,

    /// Evaluate on the test split once training is done
    #[arg(long)]
    test: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Dry run (validate config without training)
    #[arg(long)]
    dry_run: bool,
}

/// Shows step metrics on a progress bar and forwards them to `tracing`
struct ProgressSink {
    bar: ProgressBar,
    tracing: TracingSink,
}

impl ProgressSink {
    fn new(total_steps: u64) -> Result<Self> {
        let bar = ProgressBar::new(total_steps);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} steps ({eta}) {msg}")
                .context("Invalid progress bar template")?
                .progress_chars("=>-"),
        );
        Ok(Self {
            bar,
            tracing: TracingSink,
        })
    }
}

impl MetricSink for ProgressSink {
    fn log(&mut self, name: &str, value: f64, options: LogOptions) {
        self.tracing.log(name, value, options);

        if name == LOSS_METRIC {
            self.bar.inc(1);
        } else if options.prog_bar && options.on_step {
            self.bar.set_message(format!("{name}={value:.4}"));
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    setup_cli_logging(args.verbose)?;

    info!("License-Plate Fraud Classifier - Training Tool");
    info!("==============================================");

    let mut config: TrainConfig =
        load_toml_config(&args.config).context("Failed to load configuration file")?;
    apply_overrides(&mut config, &args);

    if args.dry_run {
        config.validate().context("Invalid configuration")?;
        info!("Configuration validated successfully (dry run)");
        print_config_summary(&config);
        return Ok(());
    }

    config
        .validate_paths()
        .context("Invalid configuration")?;
    print_config_summary(&config);

    if args.validate_only {
        info!("Running validation only");
        run_validation(&config, args.test)?;
        return Ok(());
    }

    std::fs::create_dir_all(&config.output.output_dir)
        .context("Failed to create output directory")?;
    let config_path = config.output.output_dir.join("config.toml");
    save_toml_config(&config, &config_path).context("Failed to save configuration")?;
    info!("Configuration saved to: {}", config_path.display());

    info!("Starting training");
    run_training(&config, args.resume, args.test)?;

    info!("Training completed successfully!");
    Ok(())
}

fn apply_overrides(config: &mut TrainConfig, args: &Args) {
    if let Some(epochs) = args.epochs {
        config.training.num_epochs = epochs;
    }
    if let Some(lr) = args.lr {
        config.training.learning_rate = lr;
    }
    if let Some(batch_size) = args.batch_size {
        config.training.batch_size = batch_size;
    }
    if let Some(ref output) = args.output {
        config.output.output_dir = output.clone();
    }
}

fn print_config_summary(config: &TrainConfig) {
    let model = PlateClassifierConfig::from_train_config(config);
    info!("");
    info!("Configuration Summary:");
    info!("  Backend: {}", backend_name());
    info!("  Input: {}x{}", config.model.input_height, config.model.input_width);
    info!("  Trunk features: {}", model.feature_size());
    info!("  Head: {} -> {} -> 1", config.model.hidden1, config.model.hidden2);
    info!("  Batch norm: {}", model.uses_batch_norm());
    info!("  Freeze backbone: {}", config.model.freeze_backbone);
    info!("  Accuracy: {}", config.model.accuracy);
    info!("  Epochs: {}", config.training.num_epochs);
    info!("  Batch size: {}", config.training.batch_size);
    info!("  Learning rate: {}", config.training.learning_rate);
    info!("  ASGD: {:?}", config.training.optimizer);
    info!("  Train dir: {}", config.dataset.train_dir.display());
    if let Some(ref val_dir) = config.dataset.val_dir {
        info!("  Val dir: {}", val_dir.display());
    }
    if let Some(ref test_dir) = config.dataset.test_dir {
        info!("  Test dir: {}", test_dir.display());
    }
    info!("  Output dir: {}", config.output.output_dir.display());
    info!("");
}

fn preprocessor(config: &TrainConfig) -> ImagePreprocessor {
    ImagePreprocessor::new(PreprocessConfig::from_dataset(
        &config.dataset,
        config.model.input_height,
        config.model.input_width,
    ))
}

fn load_split(dir: &Path, config: &TrainConfig, name: &str) -> Result<PlateImageDataset> {
    let dataset = PlateImageDataset::from_dir(dir, &ClassDirs::from(&config.dataset), preprocessor(config))
        .with_context(|| format!("Failed to load {name} split from {}", dir.display()))?;
    let (genuine, fraud) = dataset.class_counts();
    info!("Loaded {name} split: {genuine} genuine, {fraud} fraud");
    Ok(dataset)
}

fn run_training(config: &TrainConfig, resume: bool, test: bool) -> Result<()> {
    let device = default_device();
    let batcher = PlateBatcher::new(preprocessor(config).config().target_size);

    let train = load_split(&config.dataset.train_dir, config, "training")?;
    let valid = match config.dataset.val_dir {
        // Validation runs every epoch, so decode it once
        Some(ref dir) if dir.exists() => Some(
            load_split(dir, config, "validation")?
                .load_all()
                .context("Failed to decode validation images")?,
        ),
        Some(ref dir) => {
            warn!("Validation directory does not exist, skipping validation: {}", dir.display());
            None
        }
        None => None,
    };

    let model_config = PlateClassifierConfig::from_train_config(config);
    let mut model: PlateClassifier<TrainingBackend> = model_config.init(&device)?;
    if let Some(ref weights) = config.model.backbone_weights {
        info!("Loading backbone weights: {}", weights.display());
        model = model
            .load_backbone(weights, &device)
            .context("Failed to load backbone weights")?;
    }

    let metadata = CheckpointMetadata {
        input_height: config.model.input_height,
        input_width: config.model.input_width,
        batch_size: config.training.batch_size,
        ..CheckpointMetadata::default()
    };
    let mut trainer = Trainer::new(TrainerConfig::from(config)).with_metadata(metadata);

    if resume {
        model = trainer
            .resume::<TrainingBackend, _>(model, &device)
            .context("Failed to resume from checkpoint")?;
        info!("Resumed after epoch {}", trainer.state().epoch);
    }

    let remaining_epochs = config
        .training
        .num_epochs
        .saturating_sub(trainer.state().epoch);
    let steps_per_epoch = train.samples().len().div_ceil(config.training.batch_size.max(1));
    let mut sink = ProgressSink::new((remaining_epochs * steps_per_epoch) as u64)?;

    let outcome = trainer.fit::<TrainingBackend, _>(
        model,
        &train,
        valid.as_ref().map(|v| v as &dyn Dataset<PlateItem>),
        &batcher,
        &mut sink,
        &device,
    )?;
    sink.bar.finish_with_message("Training completed");

    let history = trainer.training_history();
    info!("");
    info!("Training Summary:");
    info!("  Epochs run: {}", history.len());
    if let Some(loss) = history.train_loss.last() {
        info!("  Final training loss: {:.4}", loss);
    }
    if let Some(best) = history.best_val_loss() {
        info!("  Best validation loss: {:.4}", best);
    }
    if let Some(epoch) = outcome.best_epoch {
        info!("  Best epoch: {}", epoch);
    }
    if outcome.stopped_early {
        info!("  Stopped early");
    }
    info!("  Checkpoints saved to: {}", trainer.checkpoints().checkpoint_dir().display());

    if test {
        run_test(config, &outcome.model.valid())?;
    }

    Ok(())
}

/// Loads the best record of the run, or the latest when none was marked best
fn load_saved_model(config: &TrainConfig) -> Result<PlateClassifier<DefaultBackend>> {
    let device = default_device();
    let checkpoints = CheckpointManager::new(config.output.output_dir.clone());
    let name = if checkpoints.load_best().is_ok() {
        "best"
    } else {
        "latest"
    };
    info!("Loading {} model from {}", name, checkpoints.checkpoint_dir().display());

    let model = PlateClassifierConfig::from_train_config(config).init::<DefaultBackend>(&device)?;
    checkpoints
        .load_model::<DefaultBackend, _>(model, name, &device)
        .context("Failed to load saved model")
}

fn run_validation(config: &TrainConfig, test: bool) -> Result<()> {
    let Some(ref val_dir) = config.dataset.val_dir else {
        anyhow::bail!("No validation directory configured");
    };
    let valid = load_split(val_dir, config, "validation")?;
    let model = load_saved_model(config)?;

    report(config, &model, &valid, Stage::Validation)?;
    if test {
        run_test(config, &model)?;
    }
    Ok(())
}

fn run_test(config: &TrainConfig, model: &PlateClassifier<DefaultBackend>) -> Result<()> {
    let Some(ref test_dir) = config.dataset.test_dir else {
        warn!("No test directory configured, skipping test");
        return Ok(());
    };
    let test = load_split(test_dir, config, "test")?;
    report(config, model, &test, Stage::Test)
}

fn report(
    config: &TrainConfig,
    model: &PlateClassifier<DefaultBackend>,
    dataset: &PlateImageDataset,
    stage: Stage,
) -> Result<()> {
    let device = default_device();
    let batcher = PlateBatcher::new(preprocessor(config).config().target_size);

    info!("Running {stage}...");
    let metrics = evaluate::<DefaultBackend, _>(
        model,
        dataset,
        &batcher,
        config.training.batch_size,
        stage,
        &mut TracingSink,
        &device,
    )?;

    info!("");
    info!("{} Results:", capitalize(&stage.to_string()));
    for (name, value) in &metrics {
        info!("  {}: {:.4}", name, value);
    }
    info!("  Samples: {}", dataset.samples().len());
    Ok(())
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["train", "--config", "train.toml"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_overrides_replace_file_values() {
        let mut config = TrainConfig::default();
        let args = args(&["--epochs", "3", "--lr", "0.01", "--batch-size", "8", "-o", "/tmp/run"]);
        apply_overrides(&mut config, &args);

        assert_eq!(config.training.num_epochs, 3);
        assert_eq!(config.training.learning_rate, 0.01);
        assert_eq!(config.training.batch_size, 8);
        assert_eq!(config.output.output_dir, PathBuf::from("/tmp/run"));
    }

    #[test]
    fn test_no_overrides_keep_config() {
        let mut config = TrainConfig::default();
        apply_overrides(&mut config, &args(&["--resume", "--test"]));

        assert_eq!(config.training.num_epochs, 100);
        assert_eq!(config.training.batch_size, 1);
    }

    #[test]
    fn test_config_validation() {
        let mut config = TrainConfig::default();
        config.dataset.train_dir = PathBuf::from("/nonexistent/train");
        assert!(config.validate().is_ok());
        assert!(config.validate_paths().is_err());

        apply_overrides(&mut config, &args(&["--epochs", "0"]));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sample_config_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../configs/train.toml");
        let config: TrainConfig = load_toml_config(&path).unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.model.input_width, 295);
        assert_eq!(config.training.optimizer.t0, 1e6);
        assert_eq!(config.output.keep_last, Some(3));
    }

    #[test]
    fn test_capitalize() {
        assert_eq!(capitalize("validation"), "Validation");
        assert_eq!(capitalize(""), "");
    }
}
