//! Prediction CLI Tool
//!
//! Scores plate crops with a trained fraud classifier.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use plate_core::{load_toml_config, setup_cli_logging, TrainConfig};
use plate_dataset::{ImagePreprocessor, PreprocessConfig};
use plate_training::{
    default_device, DefaultBackend, PlateClassifierConfig, Prediction, Predictor,
    DEFAULT_THRESHOLD,
};
use tracing::info;

/// License-Plate Fraud Classifier Prediction Tool
#[derive(Parser, Debug)]
#[command(name = "predict", about = "Score license-plate crops for fraud")]
struct Args {
    /// Model record saved by `train` (e.g. runs/fraud/best.mpk)
    #[arg(short = 'm', long, value_name = "FILE")]
    checkpoint: PathBuf,

    /// Training configuration the model was built with (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Images to score
    #[arg(required = true, value_name = "IMAGE")]
    images: Vec<PathBuf>,

    /// Fraud probability at or above which a plate is flagged
    #[arg(short, long, default_value_t = DEFAULT_THRESHOLD)]
    threshold: f32,

    /// Print predictions as JSON
    #[arg(long)]
    json: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    setup_cli_logging(args.verbose)?;

    if !(0.0..=1.0).contains(&args.threshold) {
        anyhow::bail!("Threshold must be in [0, 1], got {}", args.threshold);
    }

    let config: TrainConfig =
        load_toml_config(&args.config).context("Failed to load configuration file")?;
    let model_config = PlateClassifierConfig::from_train_config(&config);
    let preprocessor = ImagePreprocessor::new(PreprocessConfig::from_dataset(
        &config.dataset,
        config.model.input_height,
        config.model.input_width,
    ));

    info!("Loading model: {}", args.checkpoint.display());
    let predictor = Predictor::<DefaultBackend>::load(
        &args.checkpoint,
        &model_config,
        preprocessor,
        default_device(),
    )
    .context("Failed to load model")?
    .with_threshold(args.threshold);

    let predictions = predictor
        .predict_paths(&args.images)
        .context("Prediction failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&predictions)?);
    } else {
        for prediction in &predictions {
            println!("{}", format_prediction(prediction));
        }
        let flagged = predictions.iter().filter(|p| p.is_fraud).count();
        info!("{} of {} plates flagged as fraud", flagged, predictions.len());
    }

    Ok(())
}

fn format_prediction(prediction: &Prediction) -> String {
    format!(
        "{}\t{:.4}\t{}\t{:.1} ms",
        prediction.path.display(),
        prediction.probability,
        prediction.label,
        prediction.inference_time_ms
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_args_parse() {
        let args = Args::parse_from([
            "predict", "-m", "best.mpk", "-c", "train.toml", "a.png", "b.png", "--json",
        ]);
        assert_eq!(args.images.len(), 2);
        assert_eq!(args.threshold, DEFAULT_THRESHOLD);
        assert!(args.json);
    }

    #[test]
    fn test_images_are_required() {
        assert!(Args::try_parse_from(["predict", "-m", "m", "-c", "c"]).is_err());
    }

    #[test]
    fn test_format_prediction() {
        let prediction = Prediction::new(PathBuf::from("plate.png"), 0.75, 0.5, Duration::ZERO);
        let line = format_prediction(&prediction);
        assert!(line.starts_with("plate.png\t0.7500\t"));
    }
}
