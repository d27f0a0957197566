//! Training loop driving a model through its [`StepHooks`].
//!
//! Per epoch: shuffle with a seeded `ChaCha8Rng`, build batches lazily,
//! `training_step` -> backward -> optimizer step, then `validation_step` over
//! the validation set on the inner (non-autodiff) model. Epoch means come from
//! an [`EpochAggregator`] fed with the steps' log entries.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    module::{AutodiffModule, Module},
    optim::{GradientsParams, Optimizer},
    tensor::backend::{AutodiffBackend, Backend},
};
use plate_core::{
    forward_metrics, EpochAggregator, Error, MetricSink, Result, Stage, TrainConfig,
    TrainingHistory, ACCURACY_KEY,
};
use plate_dataset::{PlateBatch, PlateBatcher, PlateItem};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointManager, CheckpointMetadata};
use crate::hooks::{ConfigureOptimizers, ConfiguredOptimizer, StepHooks};

const STATE_FILE: &str = "training_state.json";

/// Training state for checkpointing and resumption
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingState {
    /// Epochs completed
    pub epoch: usize,
    pub best_val_loss: Option<f64>,
    pub best_epoch: Option<usize>,
    pub patience_counter: usize,
    pub history: TrainingHistory,
}

/// Configuration for the trainer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerConfig {
    pub num_epochs: usize,
    pub batch_size: usize,
    pub early_stopping_patience: Option<usize>,
    pub checkpoint_dir: PathBuf,
    pub save_every: usize,
    pub keep_last: Option<usize>,
    pub seed: u64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self::from(&TrainConfig::default())
    }
}

impl From<&TrainConfig> for TrainerConfig {
    fn from(config: &TrainConfig) -> Self {
        Self {
            num_epochs: config.training.num_epochs,
            batch_size: config.training.batch_size,
            early_stopping_patience: config.training.early_stopping_patience,
            checkpoint_dir: config.output.output_dir.clone(),
            save_every: config.output.save_every,
            keep_last: config.output.keep_last,
            seed: config.seed,
        }
    }
}

/// Means of one epoch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochSummary {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: Option<f64>,
    pub val_accuracy: Option<f64>,
    pub learning_rate: f64,
}

/// What [`Trainer::fit`] hands back
#[derive(Debug)]
pub struct FitOutcome<M> {
    pub model: M,
    pub best_epoch: Option<usize>,
    pub stopped_early: bool,
}

pub struct Trainer {
    config: TrainerConfig,
    state: TrainingState,
    checkpoints: CheckpointManager,
    metadata: CheckpointMetadata,
    resume_optimizer: bool,
}

impl Trainer {
    pub fn new(config: TrainerConfig) -> Self {
        let checkpoints = CheckpointManager::new(config.checkpoint_dir.clone())
            .keep_last_n(config.keep_last);
        Self {
            config,
            state: TrainingState::default(),
            checkpoints,
            metadata: CheckpointMetadata::default(),
            resume_optimizer: false,
        }
    }

    /// Metadata written into every checkpoint
    pub fn with_metadata(mut self, metadata: CheckpointMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn training_history(&self) -> &TrainingHistory {
        &self.state.history
    }

    /// Records an epoch; returns true when validation loss improved
    pub fn update_epoch(&mut self, summary: &EpochSummary) -> bool {
        self.state.epoch = summary.epoch;
        self.state.history.add_epoch(
            summary.epoch,
            summary.train_loss,
            summary.train_accuracy,
            summary.val_loss,
            summary.val_accuracy,
            summary.learning_rate,
        );

        let Some(val_loss) = summary.val_loss else {
            return false;
        };

        let improved = self.state.best_val_loss.is_none_or(|best| val_loss < best);
        if improved {
            if let Some(best) = self.state.best_val_loss {
                info!("Validation loss improved from {best:.4} to {val_loss:.4}");
            }
            self.state.best_val_loss = Some(val_loss);
            self.state.best_epoch = Some(summary.epoch);
            self.state.patience_counter = 0;
        } else {
            self.state.patience_counter += 1;
            warn!(
                "No improvement. Patience: {}/{:?}",
                self.state.patience_counter, self.config.early_stopping_patience
            );
        }
        improved
    }

    pub fn should_stop(&self) -> bool {
        self.config
            .early_stopping_patience
            .is_some_and(|patience| self.state.patience_counter >= patience)
    }

    pub fn should_save_checkpoint(&self) -> bool {
        self.config.save_every > 0 && self.state.epoch % self.config.save_every == 0
    }

    /// Restores the latest checkpoint into `model` and continues from its
    /// epoch on the next [`fit`](Self::fit)
    pub fn resume<B: Backend, M: Module<B>>(&mut self, model: M, device: &B::Device) -> Result<M> {
        let checkpoint = self.checkpoints.load_latest()?;
        let model = self.checkpoints.load_model::<B, M>(model, "latest", device)?;

        let state_path = self.checkpoints.checkpoint_dir().join(STATE_FILE);
        self.state = match fs::read_to_string(&state_path) {
            Ok(json) => serde_json::from_str(&json)?,
            Err(_) => {
                warn!(path = %state_path.display(), "No training state found, keeping only the epoch");
                TrainingState {
                    epoch: checkpoint.epoch,
                    ..TrainingState::default()
                }
            }
        };
        self.resume_optimizer = true;

        info!(epoch = self.state.epoch, "Resuming from checkpoint");
        Ok(model)
    }

    fn save_state(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.state)?;
        fs::create_dir_all(self.checkpoints.checkpoint_dir())?;
        fs::write(self.checkpoints.checkpoint_dir().join(STATE_FILE), json)?;
        Ok(())
    }

    /// Fits `model` on `train`, validating on `valid` after every epoch
    pub fn fit<B, M>(
        &mut self,
        mut model: M,
        train: &dyn Dataset<PlateItem>,
        valid: Option<&dyn Dataset<PlateItem>>,
        batcher: &PlateBatcher,
        sink: &mut dyn MetricSink,
        device: &B::Device,
    ) -> Result<FitOutcome<M>>
    where
        B: AutodiffBackend,
        M: ConfigureOptimizers<B> + StepHooks<B, Batch = PlateBatch<B>>,
        M::InnerModule: StepHooks<B::InnerBackend, Batch = PlateBatch<B::InnerBackend>>,
    {
        if train.is_empty() {
            return Err(Error::Dataset("training set is empty".into()));
        }
        if valid.is_some_and(|v| v.is_empty()) {
            return Err(Error::Dataset("validation set is empty".into()));
        }
        let min_batch = model.min_training_batch();
        if train.len() < min_batch {
            return Err(Error::Dataset(format!(
                "training set has {} samples, batch norm needs at least {min_batch}",
                train.len()
            )));
        }

        let ConfiguredOptimizer {
            mut optimizer,
            learning_rate,
            num_trainable_params,
        } = model.configure_optimizers();

        if self.resume_optimizer {
            optimizer = match self.checkpoints.load_optimizer::<B, M, _>(optimizer, device) {
                Ok(restored) => restored,
                Err(e) => {
                    warn!(error = %e, "Optimizer state not restored, starting fresh");
                    model.configure_optimizers().optimizer
                }
            };
        }

        let metadata = CheckpointMetadata {
            num_parameters: model.num_params(),
            num_trainable_parameters: num_trainable_params,
            training_samples: train.len(),
            ..self.metadata.clone()
        };

        info!(
            samples = train.len(),
            val_samples = valid.map_or(0, |v| v.len()),
            epochs = self.config.num_epochs,
            batch_size = self.config.batch_size,
            learning_rate,
            trainable_params = num_trainable_params,
            "Starting training"
        );

        let batch_size = self.config.batch_size.max(1);
        let mut stopped_early = false;
        let mut aggregator = EpochAggregator::new();

        for epoch in self.state.epoch + 1..=self.config.num_epochs {
            aggregator.reset();

            let mut indices: Vec<usize> = (0..train.len()).collect();
            let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed.wrapping_add(epoch as u64));
            indices.shuffle(&mut rng);
            let num_batches = indices.len().div_ceil(batch_size);

            for (batch_idx, chunk) in indices.chunks(batch_size).enumerate() {
                let items: Vec<PlateItem> = chunk.iter().filter_map(|&i| train.get(i)).collect();
                if items.len() < min_batch {
                    debug!(epoch, samples = items.len(), "Skipping undersized batch");
                    continue;
                }
                let batch =
                    Batcher::<B, PlateItem, PlateBatch<B>>::batch(batcher, items, device);

                let output = model.training_step(batch);
                forward_metrics(&output.logs, &mut aggregator);
                forward_metrics(&output.logs, sink);

                let grads = GradientsParams::from_grads(output.loss.backward(), &model);
                model = optimizer.step(learning_rate, model, grads);

                debug!(epoch, batch = batch_idx + 1, num_batches, "Batch done");
            }

            let train_loss = aggregator.mean(Stage::Train.loss_metric()).unwrap_or(f64::NAN);
            let train_accuracy = aggregator
                .mean(Stage::Train.accuracy_metric())
                .unwrap_or(f64::NAN);

            let (val_loss, val_accuracy) = match valid {
                Some(valid) => {
                    let metrics = evaluate::<B::InnerBackend, _>(
                        &model.valid(),
                        valid,
                        batcher,
                        batch_size,
                        Stage::Validation,
                        sink,
                        device,
                    )?;
                    (
                        metrics.get(Stage::Validation.loss_metric()).copied(),
                        metrics.get(Stage::Validation.accuracy_metric()).copied(),
                    )
                }
                None => (None, None),
            };

            let summary = EpochSummary {
                epoch,
                train_loss,
                train_accuracy,
                val_loss,
                val_accuracy,
                learning_rate,
            };
            let improved = self.update_epoch(&summary);

            info!(
                epoch,
                train_loss,
                train_accuracy,
                val_loss = ?val_loss,
                val_accuracy = ?val_accuracy,
                "Epoch complete"
            );

            let checkpoint = Checkpoint::new(
                epoch,
                train_loss,
                val_loss.unwrap_or(f64::NAN),
                val_accuracy.unwrap_or(f64::NAN),
                learning_rate,
                metadata.clone(),
            );
            if self.should_save_checkpoint() || epoch == self.config.num_epochs {
                self.checkpoints.save::<B, M>(&model, &checkpoint, improved)?;
                self.checkpoints.save_optimizer::<B, M, _>(&optimizer)?;
                self.save_state()?;
            } else if improved {
                self.checkpoints.save_best::<B, M>(&model, &checkpoint)?;
            }

            if self.should_stop() {
                info!(epoch, "Early stopping triggered");
                self.checkpoints.save::<B, M>(&model, &checkpoint, false)?;
                self.checkpoints.save_optimizer::<B, M, _>(&optimizer)?;
                self.save_state()?;
                stopped_early = true;
                break;
            }
        }

        Ok(FitOutcome {
            model,
            best_epoch: self.state.best_epoch,
            stopped_early,
        })
    }
}

/// Runs validation or test steps over a dataset and returns the epoch means
/// keyed by metric name, plus `acc`
pub fn evaluate<B, M>(
    model: &M,
    dataset: &dyn Dataset<PlateItem>,
    batcher: &PlateBatcher,
    batch_size: usize,
    stage: Stage,
    sink: &mut dyn MetricSink,
    device: &B::Device,
) -> Result<BTreeMap<String, f64>>
where
    B: Backend,
    M: StepHooks<B, Batch = PlateBatch<B>>,
{
    if dataset.is_empty() {
        return Err(Error::Dataset(format!("{stage} set is empty")));
    }

    let mut aggregator = EpochAggregator::new();
    let indices: Vec<usize> = (0..dataset.len()).collect();

    for chunk in indices.chunks(batch_size.max(1)) {
        let items: Vec<PlateItem> = chunk.iter().filter_map(|&i| dataset.get(i)).collect();
        if items.is_empty() {
            continue;
        }
        let batch = Batcher::<B, PlateItem, PlateBatch<B>>::batch(batcher, items, device);

        let output = match stage {
            Stage::Train => model.training_step(batch),
            Stage::Validation => model.validation_step(batch),
            Stage::Test => model.test_step(batch),
        };
        forward_metrics(&output.logs, &mut aggregator);
        forward_metrics(&output.logs, sink);
    }

    let mut means = aggregator.means();
    if let Some(acc) = means.get(stage.accuracy_metric()).copied() {
        means.insert(ACCURACY_KEY.to_string(), acc);
    }
    debug!(%stage, ?means, "Evaluation done");
    Ok(means)
}
