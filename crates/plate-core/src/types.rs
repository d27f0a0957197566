//! Core type definitions for the plate fraud classifier.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Binary label of a plate crop
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PlateLabel {
    /// A genuine, readable plate
    Genuine,
    /// A fraudulent or otherwise invalid plate
    Fraud,
}

impl PlateLabel {
    /// Label value fed to the loss (`0.0` or `1.0`)
    pub fn as_f32(&self) -> f32 {
        match self {
            PlateLabel::Genuine => 0.0,
            PlateLabel::Fraud => 1.0,
        }
    }

    /// Label for a probability under a decision threshold
    pub fn from_probability(probability: f32, threshold: f32) -> Self {
        if probability >= threshold {
            PlateLabel::Fraud
        } else {
            PlateLabel::Genuine
        }
    }
}

impl std::fmt::Display for PlateLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlateLabel::Genuine => write!(f, "genuine"),
            PlateLabel::Fraud => write!(f, "fraud"),
        }
    }
}

/// An image file with its label
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSample {
    /// Path to the image file
    pub path: PathBuf,
    /// Binary label
    pub label: PlateLabel,
}

impl ImageSample {
    /// Creates a new image sample
    pub fn new(path: PathBuf, label: PlateLabel) -> Self {
        Self { path, label }
    }
}

/// Phase of a run a step belongs to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Optimisation steps
    Train,
    /// Held-out evaluation during fitting
    Validation,
    /// Final evaluation
    Test,
}

impl Stage {
    /// Name of the loss metric reported for this stage
    pub fn loss_metric(&self) -> &'static str {
        match self {
            Stage::Train => "train_loss",
            Stage::Validation => "val_loss",
            Stage::Test => "test_loss",
        }
    }

    /// Name of the accuracy metric reported for this stage
    pub fn accuracy_metric(&self) -> &'static str {
        match self {
            Stage::Train => "train_accuracy",
            Stage::Validation => "val_accuracy",
            Stage::Test => "test_accuracy",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Train => write!(f, "train"),
            Stage::Validation => write!(f, "validation"),
            Stage::Test => write!(f, "test"),
        }
    }
}

/// Image dimensions as fed to the backbone
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageDimensions {
    /// Image height in pixels
    pub height: usize,
    /// Image width in pixels
    pub width: usize,
    /// Number of channels (3 for RGB)
    pub channels: usize,
}

impl ImageDimensions {
    /// Creates new RGB image dimensions
    pub fn new(height: usize, width: usize) -> Self {
        Self {
            height,
            width,
            channels: 3,
        }
    }

    /// Plate crop size the fraud model is trained on (64x295)
    pub fn plate_crop() -> Self {
        Self::new(64, 295)
    }

    /// Number of values in one CHW image
    pub fn num_values(&self) -> usize {
        self.channels * self.height * self.width
    }
}

impl Default for ImageDimensions {
    fn default() -> Self {
        Self::plate_crop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_values() {
        assert_eq!(PlateLabel::Genuine.as_f32(), 0.0);
        assert_eq!(PlateLabel::Fraud.as_f32(), 1.0);
        assert_eq!(PlateLabel::Fraud.to_string(), "fraud");
    }

    #[test]
    fn test_label_from_probability() {
        assert_eq!(PlateLabel::from_probability(0.5, 0.5), PlateLabel::Fraud);
        assert_eq!(PlateLabel::from_probability(0.49, 0.5), PlateLabel::Genuine);
    }

    #[test]
    fn test_stage_metric_names() {
        assert_eq!(Stage::Train.loss_metric(), "train_loss");
        assert_eq!(Stage::Validation.accuracy_metric(), "val_accuracy");
        assert_eq!(Stage::Test.loss_metric(), "test_loss");
        assert_eq!(Stage::Test.accuracy_metric(), "test_accuracy");
    }

    #[test]
    fn test_image_dimensions() {
        let dims = ImageDimensions::plate_crop();
        assert_eq!(dims.height, 64);
        assert_eq!(dims.width, 295);
        assert_eq!(dims.num_values(), 3 * 64 * 295);
    }
}
