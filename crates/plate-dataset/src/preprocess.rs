//! Turns plate crops on disk into normalised CHW float buffers.

use std::path::Path;

use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use plate_core::{DatasetConfig, Error, ImageDimensions, Result};
use serde::{Deserialize, Serialize};

/// Configuration for image preprocessing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessConfig {
    /// Size every crop is resized to
    pub target_size: ImageDimensions,
    /// Normalisation means [R, G, B]
    pub mean: [f32; 3],
    /// Normalisation standard deviations [R, G, B]
    pub std: [f32; 3],
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            target_size: ImageDimensions::plate_crop(),
            mean: [0.485, 0.456, 0.406],
            std: [0.229, 0.224, 0.225],
        }
    }
}

impl PreprocessConfig {
    /// Preprocessing for a run: input size from the model section, statistics
    /// from the dataset section
    pub fn from_dataset(dataset: &DatasetConfig, height: usize, width: usize) -> Self {
        Self {
            target_size: ImageDimensions::new(height, width),
            mean: dataset.mean,
            std: dataset.std,
        }
    }
}

/// Resizes and normalises plate crops
#[derive(Debug, Clone)]
pub struct ImagePreprocessor {
    config: PreprocessConfig,
}

impl Default for ImagePreprocessor {
    fn default() -> Self {
        Self::new(PreprocessConfig::default())
    }
}

impl ImagePreprocessor {
    pub fn new(config: PreprocessConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PreprocessConfig {
        &self.config
    }

    /// Decodes and preprocesses an image file
    pub fn preprocess_path(&self, path: &Path) -> Result<Vec<f32>> {
        let image = image::ImageReader::open(path)?
            .decode()
            .map_err(|e| Error::Image(format!("Failed to decode {}: {e}", path.display())))?;
        self.preprocess(&image)
    }

    /// Resizes exactly to the target size (aspect ratio is not kept) and
    /// returns a normalised CHW buffer
    pub fn preprocess(&self, image: &DynamicImage) -> Result<Vec<f32>> {
        let resized = self.resize(image);
        self.normalize(&resized)
    }

    fn resize(&self, image: &DynamicImage) -> RgbImage {
        let target = self.config.target_size;
        let (w, h) = (target.width as u32, target.height as u32);
        if image.width() == w && image.height() == h {
            return image.to_rgb8();
        }
        image.resize_exact(w, h, FilterType::Triangle).to_rgb8()
    }

    fn normalize(&self, image: &RgbImage) -> Result<Vec<f32>> {
        let (width, height) = image.dimensions();
        let target = self.config.target_size;
        if width as usize != target.width || height as usize != target.height {
            return Err(Error::InvalidArgument(format!(
                "expected a {}x{} image, got {}x{}",
                target.width, target.height, width, height
            )));
        }

        let plane = (width * height) as usize;
        let mut out = vec![0.0f32; plane * 3];
        for (x, y, pixel) in image.enumerate_pixels() {
            let offset = y as usize * width as usize + x as usize;
            for c in 0..3 {
                let value = pixel[c] as f32 / 255.0;
                out[c * plane + offset] = (value - self.config.mean[c]) / self.config.std[c];
            }
        }
        Ok(out)
    }

    /// `[channels, height, width]` of a preprocessed buffer
    pub fn output_shape(&self) -> [usize; 3] {
        let target = self.config.target_size;
        [target.channels, target.height, target.width]
    }
}
