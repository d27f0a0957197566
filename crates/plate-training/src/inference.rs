//! Scoring plate crops with a trained classifier.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use burn::{
    module::Module,
    record::CompactRecorder,
    tensor::{backend::Backend, Tensor, TensorData},
};
use plate_core::{Error, ImageDimensions, PlateLabel, Result};
use plate_dataset::ImagePreprocessor;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{record_stem, PlateClassifier, PlateClassifierConfig};

/// Default decision threshold on the fraud probability
pub const DEFAULT_THRESHOLD: f32 = 0.5;

/// Result of scoring one image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub path: PathBuf,
    /// Sigmoid output of the model
    pub probability: f32,
    pub is_fraud: bool,
    pub label: PlateLabel,
    pub inference_time_ms: f64,
}

impl Prediction {
    pub fn new(path: PathBuf, probability: f32, threshold: f32, elapsed: Duration) -> Self {
        let label = PlateLabel::from_probability(probability, threshold);
        Self {
            path,
            probability,
            is_fraud: label == PlateLabel::Fraud,
            label,
            inference_time_ms: elapsed.as_secs_f64() * 1000.0,
        }
    }
}

/// A classifier in inference mode plus the preprocessing it expects
pub struct Predictor<B: Backend> {
    model: PlateClassifier<B>,
    preprocessor: ImagePreprocessor,
    threshold: f32,
    device: B::Device,
}

impl<B: Backend> Predictor<B> {
    pub fn new(model: PlateClassifier<B>, preprocessor: ImagePreprocessor, device: B::Device) -> Self {
        Self {
            model,
            preprocessor,
            threshold: DEFAULT_THRESHOLD,
            device,
        }
    }

    /// Builds the model from `config` and loads a `CompactRecorder` record
    pub fn load(
        checkpoint: &Path,
        config: &PlateClassifierConfig,
        preprocessor: ImagePreprocessor,
        device: B::Device,
    ) -> Result<Self> {
        let expected = ImageDimensions::new(config.input_height, config.input_width);
        if preprocessor.config().target_size != expected {
            return Err(Error::InvalidArgument(format!(
                "preprocessor produces {:?}, model expects {:?}",
                preprocessor.config().target_size,
                expected
            )));
        }

        let model = config
            .init::<B>(&device)?
            .load_file(record_stem(checkpoint), &CompactRecorder::new(), &device)
            .map_err(|e| {
                Error::Checkpoint(format!("Failed to load model {}: {e:?}", checkpoint.display()))
            })?;

        debug!(checkpoint = %checkpoint.display(), "Model loaded");
        Ok(Self::new(model, preprocessor, device))
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn model(&self) -> &PlateClassifier<B> {
        &self.model
    }

    /// Probabilities for preprocessed CHW buffers
    pub fn predict_batch(&self, images: Vec<Vec<f32>>) -> Result<Vec<f32>> {
        if images.is_empty() {
            return Ok(Vec::new());
        }

        let [channels, height, width] = self.preprocessor.output_shape();
        let batch_size = images.len();
        let data: Vec<f32> = images.into_iter().flatten().collect();
        if data.len() != batch_size * channels * height * width {
            return Err(Error::InvalidArgument(format!(
                "expected {batch_size} images of {channels}x{height}x{width}"
            )));
        }

        let input = Tensor::<B, 4>::from_data(
            TensorData::new(data, [batch_size, channels, height, width]),
            &self.device,
        );
        let output = self.model.forward(input);

        output
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| Error::Model(format!("Failed to read model output: {e:?}")))
    }

    pub fn predict_path(&self, path: &Path) -> Result<Prediction> {
        let start = Instant::now();
        let image = self.preprocessor.preprocess_path(path)?;
        let probability = self
            .predict_batch(vec![image])?
            .first()
            .copied()
            .ok_or_else(|| Error::Model("model returned no output".into()))?;

        Ok(Prediction::new(
            path.to_path_buf(),
            probability,
            self.threshold,
            start.elapsed(),
        ))
    }

    /// Scores every path; unreadable images fail the whole call
    pub fn predict_paths(&self, paths: &[PathBuf]) -> Result<Vec<Prediction>> {
        paths.iter().map(|p| self.predict_path(p)).collect()
    }
}
