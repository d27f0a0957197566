//! Burn datasets over labelled plate crops.
//!
//! On disk a split looks like `root/fraud/*.png` and `root/genuine/*.png`.
//! Images are decoded lazily in [`Dataset::get`].

use std::fs;
use std::path::Path;

use burn::data::dataset::Dataset;
use plate_core::{DatasetConfig, Error, ImageSample, PlateLabel, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::preprocess::ImagePreprocessor;

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// A single preprocessed plate crop
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlateItem {
    /// Normalised CHW values, `3 * H * W` long
    pub image: Vec<f32>,
    /// 1.0 for fraud, 0.0 for genuine
    pub label: f32,
    /// Source path, for logging and predictions
    pub path: String,
}

impl PlateItem {
    pub fn new(image: Vec<f32>, label: PlateLabel, path: impl Into<String>) -> Self {
        Self {
            image,
            label: label.as_f32(),
            path: path.into(),
        }
    }

    /// Loads and preprocesses one sample
    pub fn from_sample(sample: &ImageSample, preprocessor: &ImagePreprocessor) -> Result<Self> {
        let image = preprocessor.preprocess_path(&sample.path)?;
        Ok(Self::new(
            image,
            sample.label,
            sample.path.to_string_lossy().to_string(),
        ))
    }
}

/// Class directory names of a split
#[derive(Debug, Clone)]
pub struct ClassDirs {
    pub fraud: String,
    pub genuine: String,
}

impl Default for ClassDirs {
    fn default() -> Self {
        Self {
            fraud: "fraud".to_string(),
            genuine: "genuine".to_string(),
        }
    }
}

impl From<&DatasetConfig> for ClassDirs {
    fn from(config: &DatasetConfig) -> Self {
        Self {
            fraud: config.fraud_dir.clone(),
            genuine: config.genuine_dir.clone(),
        }
    }
}

impl ClassDirs {
    fn label_for(&self, dir_name: &str) -> Option<PlateLabel> {
        if dir_name == self.fraud {
            Some(PlateLabel::Fraud)
        } else if dir_name == self.genuine {
            Some(PlateLabel::Genuine)
        } else {
            None
        }
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// Lists the labelled images under `root`, sorted by path
pub fn scan_split(root: &Path, classes: &ClassDirs) -> Result<Vec<ImageSample>> {
    if !root.is_dir() {
        return Err(Error::Dataset(format!(
            "dataset directory not found: {}",
            root.display()
        )));
    }

    let mut samples = Vec::new();
    for entry in fs::read_dir(root)? {
        let class_path = entry?.path();
        if !class_path.is_dir() {
            continue;
        }
        let dir_name = class_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let Some(label) = classes.label_for(&dir_name) else {
            warn!(dir = %class_path.display(), "Ignoring directory with unknown class");
            continue;
        };

        for file in fs::read_dir(&class_path)? {
            let path = file?.path();
            if path.is_file() && is_image(&path) {
                samples.push(ImageSample::new(path, label));
            }
        }
    }

    samples.sort_by(|a, b| a.path.cmp(&b.path));
    debug!(root = %root.display(), samples = samples.len(), "Scanned split");
    Ok(samples)
}

/// Plate crops read from a class-per-directory split
#[derive(Debug, Clone)]
pub struct PlateImageDataset {
    samples: Vec<ImageSample>,
    preprocessor: ImagePreprocessor,
}

impl PlateImageDataset {
    pub fn new(samples: Vec<ImageSample>, preprocessor: ImagePreprocessor) -> Self {
        Self {
            samples,
            preprocessor,
        }
    }

    /// Scans `root` for `fraud` / `genuine` sub-directories
    pub fn from_dir(
        root: impl AsRef<Path>,
        classes: &ClassDirs,
        preprocessor: ImagePreprocessor,
    ) -> Result<Self> {
        let samples = scan_split(root.as_ref(), classes)?;
        Ok(Self::new(samples, preprocessor))
    }

    pub fn samples(&self) -> &[ImageSample] {
        &self.samples
    }

    /// `(genuine, fraud)` sample counts
    pub fn class_counts(&self) -> (usize, usize) {
        let fraud = self
            .samples
            .iter()
            .filter(|s| s.label == PlateLabel::Fraud)
            .count();
        (self.samples.len() - fraud, fraud)
    }

    /// Decodes every image up front
    pub fn load_all(&self) -> Result<InMemoryDataset> {
        let items = self
            .samples
            .iter()
            .map(|s| PlateItem::from_sample(s, &self.preprocessor))
            .collect::<Result<Vec<_>>>()?;
        Ok(InMemoryDataset::new(items))
    }
}

impl Dataset<PlateItem> for PlateImageDataset {
    fn get(&self, index: usize) -> Option<PlateItem> {
        let sample = self.samples.get(index)?;
        match PlateItem::from_sample(sample, &self.preprocessor) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!(path = %sample.path.display(), error = %e, "Skipping unreadable image");
                None
            }
        }
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// Items held in memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataset {
    items: Vec<PlateItem>,
}

impl InMemoryDataset {
    pub fn new(items: Vec<PlateItem>) -> Self {
        Self { items }
    }

    pub fn push(&mut self, item: PlateItem) {
        self.items.push(item);
    }

    pub fn items(&self) -> &[PlateItem] {
        &self.items
    }
}

impl Dataset<PlateItem> for InMemoryDataset {
    fn get(&self, index: usize) -> Option<PlateItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::PreprocessConfig;
    use image::{ImageBuffer, Rgb};
    use plate_core::ImageDimensions;
    use tempfile::TempDir;

    fn write_png(path: &Path, value: u8) {
        ImageBuffer::from_pixel(30, 6, Rgb([value, value, value]))
            .save(path)
            .unwrap();
    }

    fn make_split() -> TempDir {
        let dir = TempDir::new().unwrap();
        let fraud = dir.path().join("fraud");
        let genuine = dir.path().join("genuine");
        let other = dir.path().join("unsure");
        for d in [&fraud, &genuine, &other] {
            fs::create_dir_all(d).unwrap();
        }
        write_png(&fraud.join("a.png"), 10);
        write_png(&genuine.join("b.png"), 200);
        write_png(&genuine.join("c.png"), 100);
        write_png(&other.join("d.png"), 0);
        fs::write(genuine.join("notes.txt"), "not an image").unwrap();
        dir
    }

    fn preprocessor() -> ImagePreprocessor {
        ImagePreprocessor::new(PreprocessConfig {
            target_size: ImageDimensions::new(4, 12),
            ..PreprocessConfig::default()
        })
    }

    #[test]
    fn test_scan_split_labels() {
        let dir = make_split();
        let samples = scan_split(dir.path(), &ClassDirs::default()).unwrap();

        assert_eq!(samples.len(), 3);
        let fraud: Vec<_> = samples
            .iter()
            .filter(|s| s.label == PlateLabel::Fraud)
            .collect();
        assert_eq!(fraud.len(), 1);
        assert!(fraud[0].path.ends_with("fraud/a.png"));
    }

    #[test]
    fn test_scan_missing_dir() {
        let err = scan_split(Path::new("/nonexistent/split"), &ClassDirs::default()).unwrap_err();
        assert!(matches!(err, Error::Dataset(_)));
    }

    #[test]
    fn test_image_dataset_get() {
        let dir = make_split();
        let dataset =
            PlateImageDataset::from_dir(dir.path(), &ClassDirs::default(), preprocessor()).unwrap();

        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.class_counts(), (2, 1));

        let item = dataset.get(0).unwrap();
        assert_eq!(item.image.len(), 3 * 4 * 12);
        assert_eq!(item.label, 1.0);
        assert!(dataset.get(3).is_none());
    }

    #[test]
    fn test_load_all() {
        let dir = make_split();
        let dataset =
            PlateImageDataset::from_dir(dir.path(), &ClassDirs::default(), preprocessor()).unwrap();
        let memory = dataset.load_all().unwrap();

        assert_eq!(memory.len(), 3);
        assert_eq!(memory.get(1).unwrap().label, 0.0);
    }

    #[test]
    fn test_custom_class_dirs() {
        let dir = make_split();
        let classes = ClassDirs {
            fraud: "unsure".to_string(),
            genuine: "genuine".to_string(),
        };
        let samples = scan_split(dir.path(), &classes).unwrap();
        assert_eq!(samples.len(), 3);
        assert!(samples.iter().all(|s| !s.path.starts_with(dir.path().join("fraud"))));
    }
}
