//! Fraud classifier model, averaged SGD and the training loop.
//!
//! - [`model`]: ResNet-18 trunk and the binary classification head
//! - [`optim`]: averaged SGD as a Burn optimizer
//! - [`hooks`]: step and optimizer hooks the trainer drives
//! - [`trainer`]: epoch loop with validation, early stopping and checkpoints
//! - [`inference`]: scoring image files with a saved model

pub mod backend;
pub mod checkpoint;
pub mod hooks;
pub mod inference;
pub mod model;
pub mod optim;
pub mod trainer;

pub use backend::{backend_name, default_device, DefaultBackend, TrainingBackend};
pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointMetadata};
pub use hooks::{ConfigureOptimizers, ConfiguredOptimizer, StepHooks, StepOutput};
pub use inference::{Prediction, Predictor, DEFAULT_THRESHOLD};
pub use model::{PlateClassifier, PlateClassifierConfig, ResNetTrunk};
pub use optim::{Asgd, AsgdConfig, AsgdState};
pub use trainer::{evaluate, EpochSummary, FitOutcome, Trainer, TrainerConfig, TrainingState};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::checkpoint::{Checkpoint, CheckpointManager};
    pub use crate::hooks::*;
    pub use crate::model::{PlateClassifier, PlateClassifierConfig};
    pub use crate::optim::AsgdConfig;
    pub use crate::trainer::{Trainer, TrainerConfig};
}
