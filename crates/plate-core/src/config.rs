//! Configuration structures for training and evaluating the plate fraud
//! classifier. Every section has defaults so a TOML file only needs the
//! values it changes.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration for a training run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Model configuration
    pub model: ModelConfig,
    /// Training hyperparameters
    pub training: TrainingParams,
    /// Data configuration
    pub dataset: DatasetConfig,
    /// Output configuration
    pub output: OutputConfig,
    /// Random seed for reproducibility
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            training: TrainingParams::default(),
            dataset: DatasetConfig::default(),
            output: OutputConfig::default(),
            seed: 42,
        }
    }
}

impl TrainConfig {
    /// Checks values that would otherwise fail deep inside a run
    pub fn validate(&self) -> Result<()> {
        if self.training.num_epochs == 0 {
            return Err(Error::Config("num_epochs must be greater than 0".into()));
        }
        if self.training.batch_size == 0 {
            return Err(Error::Config("batch_size must be greater than 0".into()));
        }
        if !(self.training.learning_rate > 0.0) {
            return Err(Error::Config(format!(
                "learning_rate must be positive, got {}",
                self.training.learning_rate
            )));
        }
        if !(0.0..1.0).contains(&self.model.dropout) {
            return Err(Error::Config(format!(
                "dropout must be in [0, 1), got {}",
                self.model.dropout
            )));
        }
        if self.model.input_height == 0 || self.model.input_width == 0 {
            return Err(Error::Config("input size must be non-zero".into()));
        }
        if self.output.save_every == 0 {
            return Err(Error::Config("save_every must be greater than 0".into()));
        }
        Ok(())
    }

    /// Like [`validate`](Self::validate), and also requires the training
    /// directory to exist
    pub fn validate_paths(&self) -> Result<()> {
        self.validate()?;
        if !self.dataset.train_dir.exists() {
            return Err(Error::Config(format!(
                "training directory does not exist: {}",
                self.dataset.train_dir.display()
            )));
        }
        Ok(())
    }
}

/// How step accuracy is computed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AccuracyMode {
    /// A sample counts as correct only when the sigmoid output equals the
    /// label exactly. This is the historical behaviour of the model and
    /// almost always reports 0.
    #[default]
    ExactMatch,
    /// A sample counts as correct when `probability >= 0.5` agrees with the
    /// label.
    Threshold,
}

impl std::fmt::Display for AccuracyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccuracyMode::ExactMatch => write!(f, "exact_match"),
            AccuracyMode::Threshold => write!(f, "threshold"),
        }
    }
}

/// Model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Input height the head is sized for
    pub input_height: usize,
    /// Input width the head is sized for
    pub input_width: usize,
    /// Width of the first hidden layer
    pub hidden1: usize,
    /// Width of the second hidden layer
    pub hidden2: usize,
    /// Dropout before the output layer
    pub dropout: f64,
    /// Keep backbone weights fixed during training
    pub freeze_backbone: bool,
    /// Pretrained backbone weights (Burn record, or PyTorch state dict with
    /// the `pytorch` feature)
    pub backbone_weights: Option<PathBuf>,
    /// Accuracy policy for step metrics
    pub accuracy: AccuracyMode,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            input_height: 64,
            input_width: 295,
            hidden1: 512,
            hidden2: 256,
            dropout: 0.1,
            freeze_backbone: false,
            backbone_weights: None,
            accuracy: AccuracyMode::ExactMatch,
        }
    }
}

/// Training hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingParams {
    /// Number of training epochs
    pub num_epochs: usize,
    /// Batch size; 1 disables batch normalisation in the head
    pub batch_size: usize,
    /// Learning rate
    pub learning_rate: f64,
    /// Averaged SGD hyperparameters
    pub optimizer: AsgdParams,
    /// Early stopping patience (epochs without validation loss improvement)
    pub early_stopping_patience: Option<usize>,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            num_epochs: 100,
            batch_size: 1,
            learning_rate: 0.005,
            optimizer: AsgdParams::default(),
            early_stopping_patience: Some(10),
        }
    }
}

/// Averaged SGD hyperparameters
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AsgdParams {
    /// Decay term
    pub lambd: f64,
    /// Power for the eta update
    pub alpha: f64,
    /// Step at which averaging starts
    pub t0: f64,
    /// L2 penalty
    pub weight_decay: f64,
}

impl Default for AsgdParams {
    fn default() -> Self {
        Self {
            lambd: 1e-4,
            alpha: 0.75,
            t0: 1e6,
            weight_decay: 0.0,
        }
    }
}

/// Data configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Training images, one sub-directory per class
    pub train_dir: PathBuf,
    /// Validation images
    pub val_dir: Option<PathBuf>,
    /// Test images
    pub test_dir: Option<PathBuf>,
    /// Sub-directory name holding fraudulent plates (label 1)
    pub fraud_dir: String,
    /// Sub-directory name holding genuine plates (label 0)
    pub genuine_dir: String,
    /// Normalisation means [R, G, B]
    pub mean: [f32; 3],
    /// Normalisation standard deviations [R, G, B]
    pub std: [f32; 3],
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            train_dir: PathBuf::from("data/train"),
            val_dir: Some(PathBuf::from("data/val")),
            test_dir: None,
            fraud_dir: "fraud".to_string(),
            genuine_dir: "genuine".to_string(),
            // ImageNet statistics expected by the pretrained backbone
            mean: [0.485, 0.456, 0.406],
            std: [0.229, 0.224, 0.225],
        }
    }
}

/// Output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory for checkpoints and run metadata
    pub output_dir: PathBuf,
    /// Checkpoint every N epochs
    pub save_every: usize,
    /// Keep only the most recent N periodic checkpoints
    pub keep_last: Option<usize>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("runs/fraud"),
            save_every: 5,
            keep_last: Some(3),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_train_config() {
        let config = TrainConfig::default();
        assert_eq!(config.seed, 42);
        assert_eq!(config.training.batch_size, 1);
        assert_eq!(config.training.learning_rate, 0.005);
        assert_eq!(config.model.input_height, 64);
        assert_eq!(config.model.input_width, 295);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_optimizer_params() {
        let params = AsgdParams::default();
        assert_eq!(params.lambd, 0.0001);
        assert_eq!(params.alpha, 0.75);
        assert_eq!(params.t0, 1_000_000.0);
        assert_eq!(params.weight_decay, 0.0);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = TrainConfig::default();
        config.training.learning_rate = 0.0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = TrainConfig::default();
        config.training.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = TrainConfig::default();
        config.model.dropout = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: TrainConfig = toml::from_str(
            r#"
            seed = 7

            [training]
            batch_size = 16

            [model]
            accuracy = "threshold"
            "#,
        )
        .unwrap();

        assert_eq!(config.seed, 7);
        assert_eq!(config.training.batch_size, 16);
        assert_eq!(config.training.learning_rate, 0.005);
        assert_eq!(config.model.accuracy, AccuracyMode::Threshold);
        assert_eq!(config.dataset.fraud_dir, "fraud");
    }

    #[test]
    fn test_accuracy_mode_display() {
        assert_eq!(AccuracyMode::ExactMatch.to_string(), "exact_match");
        assert_eq!(AccuracyMode::default(), AccuracyMode::ExactMatch);
    }
}
