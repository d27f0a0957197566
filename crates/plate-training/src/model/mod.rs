//! Model definitions.

pub mod backbone;
pub mod classifier;

pub use backbone::{record_extension, record_stem, trunk_feature_size, BasicBlock, Downsample, ResNetTrunk};
pub use classifier::{batch_accuracy, batch_loss, PlateClassifier, PlateClassifierConfig};
