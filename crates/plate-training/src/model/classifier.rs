//! Binary fraud classifier: ResNet trunk plus a three-layer head.
//!
//! ```text
//! images [B, 3, H, W]
//!   -> ResNetTrunk -> flatten          [B, 256 * ceil(H/16) * ceil(W/16)]
//!   -> fc1 -> relu -> batchnorm1?      [B, 512]
//!   -> fc2 -> relu -> batchnorm2?      [B, 256]
//!   -> dropout -> fc3 -> sigmoid       [B, 1]
//! ```
//!
//! The batch-norm layers only exist when the model is built for batches
//! larger than one.

use std::collections::BTreeMap;
use std::path::Path;

use burn::{
    config::Config,
    module::{Ignored, Module},
    nn::{
        loss::BinaryCrossEntropyLossConfig, BatchNorm, BatchNormConfig, Dropout, DropoutConfig,
        Linear, LinearConfig, Relu,
    },
    optim::adaptor::OptimizerAdaptor,
    tensor::{
        activation::sigmoid,
        backend::{AutodiffBackend, Backend},
        ElementConversion, Tensor,
    },
};
use plate_core::{
    AccuracyMode, Error, LogOptions, LoggedMetric, Stage, TrainConfig, ACCURACY_KEY,
    LOSS_METRIC,
};
use plate_dataset::PlateBatch;

use super::backbone::{trunk_feature_size, ResNetTrunk};
use crate::hooks::{ConfigureOptimizers, ConfiguredOptimizer, StepHooks, StepOutput};
use crate::optim::{Asgd, AsgdConfig};

/// Configuration for [`PlateClassifier`]
#[derive(Config, Debug)]
pub struct PlateClassifierConfig {
    /// Batch size the model is trained with; 1 disables batch normalisation
    pub batch_size: usize,
    /// Learning rate handed to the optimizer
    pub learning_rate: f64,
    /// Input height
    #[config(default = "64")]
    pub input_height: usize,
    /// Input width
    #[config(default = "295")]
    pub input_width: usize,
    /// Width of fc1
    #[config(default = "512")]
    pub hidden1: usize,
    /// Width of fc2
    #[config(default = "256")]
    pub hidden2: usize,
    #[config(default = "0.1")]
    pub dropout: f64,
    /// Keep the trunk out of the optimizer
    #[config(default = false)]
    pub freeze_backbone: bool,
    #[config(default = "AccuracyMode::ExactMatch")]
    pub accuracy: AccuracyMode,
    #[config(default = "AsgdConfig::new()")]
    pub optimizer: AsgdConfig,
}

impl PlateClassifierConfig {
    /// Model settings of a training run
    pub fn from_train_config(config: &TrainConfig) -> Self {
        let model = &config.model;
        Self::new(config.training.batch_size, config.training.learning_rate)
            .with_input_height(model.input_height)
            .with_input_width(model.input_width)
            .with_hidden1(model.hidden1)
            .with_hidden2(model.hidden2)
            .with_dropout(model.dropout)
            .with_freeze_backbone(model.freeze_backbone)
            .with_accuracy(model.accuracy)
            .with_optimizer(AsgdConfig::from(config.training.optimizer))
    }

    pub fn validate(&self) -> plate_core::Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".into()));
        }
        if !(self.learning_rate > 0.0) {
            return Err(Error::Config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.input_height == 0 || self.input_width == 0 {
            return Err(Error::Config("input size must be non-zero".into()));
        }
        if self.hidden1 == 0 || self.hidden2 == 0 {
            return Err(Error::Config("hidden layer widths must be non-zero".into()));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::Config(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        Ok(())
    }

    /// Length of the flattened trunk output for the configured input size
    pub fn feature_size(&self) -> usize {
        trunk_feature_size(self.input_height, self.input_width)
    }

    pub fn uses_batch_norm(&self) -> bool {
        self.batch_size > 1
    }

    /// Builds a randomly initialised model
    pub fn init<B: Backend>(&self, device: &B::Device) -> plate_core::Result<PlateClassifier<B>> {
        self.validate()?;

        let batch_norm = |features: usize| -> Option<BatchNorm<B, 1>> {
            self.uses_batch_norm()
                .then(|| BatchNormConfig::new(features).init(device))
        };

        let model = PlateClassifier {
            backbone: ResNetTrunk::new(device),
            fc1: LinearConfig::new(self.feature_size(), self.hidden1).init(device),
            batchnorm1: batch_norm(self.hidden1),
            fc2: LinearConfig::new(self.hidden1, self.hidden2).init(device),
            batchnorm2: batch_norm(self.hidden2),
            dropout: DropoutConfig::new(self.dropout).init(),
            fc3: LinearConfig::new(self.hidden2, 1).init(device),
            relu: Relu::new(),
            config: Ignored(self.clone()),
        };

        Ok(model.apply_freeze())
    }
}

/// License-plate fraud classifier
#[derive(Module, Debug)]
pub struct PlateClassifier<B: Backend> {
    pub backbone: ResNetTrunk<B>,
    pub fc1: Linear<B>,
    pub batchnorm1: Option<BatchNorm<B, 1>>,
    pub fc2: Linear<B>,
    pub batchnorm2: Option<BatchNorm<B, 1>>,
    pub dropout: Dropout,
    pub fc3: Linear<B>,
    relu: Relu,
    config: Ignored<PlateClassifierConfig>,
}

/// Batch norm over `[batch, features]` activations
fn batch_norm_1d<B: Backend>(bn: &Option<BatchNorm<B, 1>>, x: Tensor<B, 2>) -> Tensor<B, 2> {
    match bn {
        Some(bn) => {
            let [batch, features] = x.dims();
            bn.forward(x.reshape([batch, features, 1]))
                .reshape([batch, features])
        }
        None => x,
    }
}

impl<B: Backend> PlateClassifier<B> {
    pub fn config(&self) -> &PlateClassifierConfig {
        &self.config.0
    }

    /// Flattened trunk features, `[batch, feature_size]`
    pub fn forward_features(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.backbone.forward(images);
        let [batch, channels, height, width] = features.dims();
        features.reshape([batch, channels * height * width])
    }

    /// Fraud probabilities, `[batch, 1]`
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.forward_features(images);

        let x = self.relu.forward(self.fc1.forward(x));
        let x = batch_norm_1d(&self.batchnorm1, x);
        let x = self.relu.forward(self.fc2.forward(x));
        let x = batch_norm_1d(&self.batchnorm2, x);
        let x = self.dropout.forward(x);

        sigmoid(self.fc3.forward(x))
    }

    pub fn feature_size(&self) -> usize {
        self.config().feature_size()
    }

    /// Loss and accuracy (percent, rounded half to even) of a batch
    pub fn compute_loss_and_accuracy(&self, batch: PlateBatch<B>) -> (Tensor<B, 1>, f64) {
        let probabilities = self.forward(batch.images);
        let labels = batch.labels.unsqueeze_dim::<2>(1);

        let accuracy = batch_accuracy(probabilities.clone(), labels.clone(), self.config().accuracy);
        let loss = batch_loss(probabilities, labels);
        (loss, accuracy)
    }

    /// Scalar parameters the optimizer updates
    pub fn num_trainable_params(&self) -> usize {
        if self.config().freeze_backbone {
            self.num_params() - self.backbone.num_params()
        } else {
            self.num_params()
        }
    }

    /// Replaces the trunk weights, keeping the freeze setting
    pub fn load_backbone(mut self, path: &Path, device: &B::Device) -> plate_core::Result<Self> {
        self.backbone = self.backbone.load_weights(path, device)?;
        Ok(self.apply_freeze())
    }

    fn apply_freeze(mut self) -> Self {
        if self.config().freeze_backbone {
            self.backbone = self.backbone.no_grad();
        }
        self
    }

    fn run_step(&self, batch: PlateBatch<B>, stage: Stage) -> StepOutput<B> {
        let (loss, accuracy) = self.compute_loss_and_accuracy(batch);
        let loss_value = loss.clone().into_scalar().elem::<f64>();

        let options = match stage {
            Stage::Train => LogOptions::step_and_epoch(),
            Stage::Validation | Stage::Test => LogOptions::epoch_only(),
        };

        let mut logs = Vec::with_capacity(3);
        if stage == Stage::Train {
            logs.push(LoggedMetric::new(LOSS_METRIC, loss_value, options));
        }
        logs.push(LoggedMetric::new(stage.loss_metric(), loss_value, options));
        logs.push(LoggedMetric::new(stage.accuracy_metric(), accuracy, options));

        let metrics = BTreeMap::from([
            (stage.loss_metric().to_string(), loss_value),
            (ACCURACY_KEY.to_string(), accuracy),
        ]);

        StepOutput {
            loss,
            metrics,
            logs,
        }
    }
}

/// Binary cross-entropy with logits, applied to the sigmoid output.
///
/// The model was trained this way, so the loss is kept as is even though the
/// input is already a probability.
pub fn batch_loss<B: Backend>(probabilities: Tensor<B, 2>, labels: Tensor<B, 2>) -> Tensor<B, 1> {
    BinaryCrossEntropyLossConfig::new()
        .with_logits(true)
        .init(&probabilities.device())
        .forward(probabilities, labels.int())
}

/// Percentage of samples whose prediction matches the label, rounded half to
/// even. NaN for an empty batch.
pub fn batch_accuracy<B: Backend>(
    probabilities: Tensor<B, 2>,
    labels: Tensor<B, 2>,
    mode: AccuracyMode,
) -> f64 {
    let total = labels.dims()[0];
    let matches = match mode {
        AccuracyMode::ExactMatch => probabilities.equal(labels),
        AccuracyMode::Threshold => probabilities
            .greater_equal_elem(0.5)
            .equal(labels.greater_equal_elem(0.5)),
    };
    let correct = matches.int().sum().into_scalar().elem::<f64>();

    (100.0 * correct / total as f64).round_ties_even()
}

impl<B: Backend> StepHooks<B> for PlateClassifier<B> {
    type Batch = PlateBatch<B>;

    fn training_step(&self, batch: Self::Batch) -> StepOutput<B> {
        self.run_step(batch, Stage::Train)
    }

    fn validation_step(&self, batch: Self::Batch) -> StepOutput<B> {
        self.run_step(batch, Stage::Validation)
    }

    fn test_step(&self, batch: Self::Batch) -> StepOutput<B> {
        self.run_step(batch, Stage::Test)
    }

    fn min_training_batch(&self) -> usize {
        if self.config().uses_batch_norm() {
            2
        } else {
            1
        }
    }
}

impl<B: AutodiffBackend> ConfigureOptimizers<B> for PlateClassifier<B> {
    type Optimizer = OptimizerAdaptor<Asgd, PlateClassifier<B>, B>;

    fn configure_optimizers(&self) -> ConfiguredOptimizer<Self::Optimizer> {
        ConfiguredOptimizer {
            optimizer: self.config().optimizer.init(),
            learning_rate: self.config().learning_rate,
            num_trainable_params: self.num_trainable_params(),
        }
    }
}
