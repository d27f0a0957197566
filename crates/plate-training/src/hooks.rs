//! Lifecycle hooks a model exposes to the training driver.
//!
//! The driver owns the loop. A model only answers "what is the loss and what
//! should be logged for this batch" and "which optimizer trains me".

use std::collections::BTreeMap;

use burn::{
    module::AutodiffModule,
    optim::Optimizer,
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Tensor,
    },
};
use plate_core::LoggedMetric;

/// Result of one training, validation or test step
#[derive(Debug, Clone)]
pub struct StepOutput<B: Backend> {
    /// Mean batch loss, shape `[1]`; carries the autodiff graph on an
    /// autodiff backend
    pub loss: Tensor<B, 1>,
    /// Values for the progress display (`train_loss`, `acc`, ...)
    pub metrics: BTreeMap<String, f64>,
    /// Entries to forward to a [`plate_core::MetricSink`]
    pub logs: Vec<LoggedMetric>,
}

impl<B: Backend> StepOutput<B> {
    /// Loss as a plain number
    pub fn loss_value(&self) -> f64 {
        self.loss.clone().into_scalar().elem::<f64>()
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }
}

/// Per-batch hooks of a trainable model
pub trait StepHooks<B: Backend> {
    type Batch;

    fn training_step(&self, batch: Self::Batch) -> StepOutput<B>;

    fn validation_step(&self, batch: Self::Batch) -> StepOutput<B>;

    fn test_step(&self, batch: Self::Batch) -> StepOutput<B>;

    /// Smallest batch `training_step` can learn from. Batch statistics
    /// need at least two samples.
    fn min_training_batch(&self) -> usize {
        1
    }
}

/// An optimizer together with the settings it should be driven with
pub struct ConfiguredOptimizer<O> {
    pub optimizer: O,
    /// Learning rate to pass to every `step`
    pub learning_rate: f64,
    /// Number of scalar parameters the optimizer will update
    pub num_trainable_params: usize,
}

/// Builds the optimizer for a model
pub trait ConfigureOptimizers<B: AutodiffBackend>: AutodiffModule<B> + Sized {
    type Optimizer: Optimizer<Self, B>;

    fn configure_optimizers(&self) -> ConfiguredOptimizer<Self::Optimizer>;
}
