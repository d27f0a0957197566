//! Plate crop loading, preprocessing and batching.
//!
//! Splits are laid out one directory per class (`fraud/`, `genuine/`).
//! Items are decoded and normalised on access and stacked into
//! [`PlateBatch`]es by [`PlateBatcher`].

pub mod batcher;
pub mod dataset;
pub mod preprocess;

pub use batcher::{PlateBatch, PlateBatcher};
pub use dataset::{scan_split, ClassDirs, InMemoryDataset, PlateImageDataset, PlateItem};
pub use preprocess::{ImagePreprocessor, PreprocessConfig};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::batcher::*;
    pub use crate::dataset::*;
    pub use crate::preprocess::*;
}
