//! Checkpoints on disk.
//!
//! A checkpoint is a Burn record (`CompactRecorder`, `<name>.mpk`) plus a
//! JSON metadata file (`<name>.json`) under one directory:
//!
//! ```text
//! epoch_5.mpk    epoch_5.json     periodic, pruned to the last N
//! best.mpk       best.json        lowest validation loss so far
//! latest.mpk     latest.json      last save, used for --resume
//! optimizer.mpk                   optimizer state of the latest save
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use burn::{
    module::{AutodiffModule, Module},
    optim::Optimizer,
    record::{CompactRecorder, Recorder},
    tensor::backend::{AutodiffBackend, Backend},
};
use plate_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::model::record_extension;

const BEST: &str = "best";
const LATEST: &str = "latest";
const OPTIMIZER: &str = "optimizer";
const EPOCH_PREFIX: &str = "epoch_";

/// Metadata stored next to a model record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub epoch: usize,
    pub train_loss: f64,
    /// Absent when the run has no validation set
    pub val_loss: Option<f64>,
    pub val_accuracy: Option<f64>,
    pub learning_rate: f64,
    pub timestamp: String,
    pub metadata: CheckpointMetadata,
}

/// Description of the model a checkpoint belongs to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub model_architecture: String,
    pub input_height: usize,
    pub input_width: usize,
    pub batch_size: usize,
    pub num_parameters: usize,
    pub num_trainable_parameters: usize,
    pub training_samples: usize,
    pub notes: Option<String>,
}

impl Default for CheckpointMetadata {
    fn default() -> Self {
        Self {
            model_architecture: String::from("resnet18-trunk+fc3"),
            input_height: 64,
            input_width: 295,
            batch_size: 1,
            num_parameters: 0,
            num_trainable_parameters: 0,
            training_samples: 0,
            notes: None,
        }
    }
}

/// JSON-finite view of a metric
fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

impl Checkpoint {
    pub fn new(
        epoch: usize,
        train_loss: f64,
        val_loss: f64,
        val_accuracy: f64,
        learning_rate: f64,
        metadata: CheckpointMetadata,
    ) -> Self {
        Self {
            epoch,
            train_loss,
            val_loss: finite(val_loss),
            val_accuracy: finite(val_accuracy),
            learning_rate,
            timestamp: chrono::Utc::now().to_rfc3339(),
            metadata,
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Serialization(format!("Failed to serialize checkpoint: {e}")))?;
        fs::write(path, json)?;

        debug!(path = %path.display(), "Checkpoint metadata saved");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path).map_err(|e| {
            Error::Checkpoint(format!("Failed to read checkpoint {}: {e}", path.display()))
        })?;

        serde_json::from_str(&json)
            .map_err(|e| Error::Serialization(format!("Failed to deserialize checkpoint: {e}")))
    }
}

/// Saves, loads and prunes checkpoints in one directory
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    checkpoint_dir: PathBuf,
    keep_last_n: Option<usize>,
}

impl CheckpointManager {
    pub fn new(checkpoint_dir: impl Into<PathBuf>) -> Self {
        Self {
            checkpoint_dir: checkpoint_dir.into(),
            keep_last_n: Some(3),
        }
    }

    /// How many periodic checkpoints to keep; `None` keeps all
    pub fn keep_last_n(mut self, n: Option<usize>) -> Self {
        self.keep_last_n = n;
        self
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    /// Record path without extension, as Burn's recorders expect
    pub fn record_path(&self, name: &str) -> PathBuf {
        self.checkpoint_dir.join(name)
    }

    /// Record file as written by the recorder
    pub fn record_file(&self, name: &str) -> PathBuf {
        self.record_path(name).with_extension(record_extension())
    }

    fn meta_path(&self, name: &str) -> PathBuf {
        self.checkpoint_dir.join(format!("{name}.json"))
    }

    /// Writes the periodic checkpoint, `latest`, and `best` when `is_best`
    pub fn save<B: Backend, M: Module<B>>(
        &self,
        model: &M,
        checkpoint: &Checkpoint,
        is_best: bool,
    ) -> Result<()> {
        fs::create_dir_all(&self.checkpoint_dir)?;

        let name = format!("{EPOCH_PREFIX}{}", checkpoint.epoch);
        self.save_named(model, checkpoint, &name)?;

        if is_best {
            self.save_named(model, checkpoint, BEST)?;
            info!(epoch = checkpoint.epoch, "Best checkpoint saved");
        }

        self.save_named(model, checkpoint, LATEST)?;

        if let Some(keep_n) = self.keep_last_n {
            self.cleanup_old_checkpoints(keep_n)?;
        }
        Ok(())
    }

    /// Writes only `best`
    pub fn save_best<B: Backend, M: Module<B>>(&self, model: &M, checkpoint: &Checkpoint) -> Result<()> {
        fs::create_dir_all(&self.checkpoint_dir)?;
        self.save_named(model, checkpoint, BEST)?;
        info!(epoch = checkpoint.epoch, "Best checkpoint saved");
        Ok(())
    }

    fn save_named<B: Backend, M: Module<B>>(
        &self,
        model: &M,
        checkpoint: &Checkpoint,
        name: &str,
    ) -> Result<()> {
        model
            .clone()
            .save_file(self.record_path(name), &CompactRecorder::new())
            .map_err(|e| Error::Checkpoint(format!("Failed to save model record {name}: {e:?}")))?;
        checkpoint.save(&self.meta_path(name))
    }

    /// Loads a named model record into `model`
    pub fn load_model<B: Backend, M: Module<B>>(
        &self,
        model: M,
        name: &str,
        device: &B::Device,
    ) -> Result<M> {
        model
            .load_file(self.record_path(name), &CompactRecorder::new(), device)
            .map_err(|e| Error::Checkpoint(format!("Failed to load model record {name}: {e:?}")))
    }

    pub fn save_optimizer<B, M, O>(&self, optimizer: &O) -> Result<()>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        fs::create_dir_all(&self.checkpoint_dir)?;
        <CompactRecorder as Recorder<B>>::record(
            &CompactRecorder::new(),
            optimizer.to_record(),
            self.record_path(OPTIMIZER),
        )
        .map_err(|e| Error::Checkpoint(format!("Failed to save optimizer state: {e:?}")))?;
        Ok(())
    }

    pub fn load_optimizer<B, M, O>(&self, optimizer: O, device: &B::Device) -> Result<O>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let record = <CompactRecorder as Recorder<B>>::load(
            &CompactRecorder::new(),
            self.record_path(OPTIMIZER),
            device,
        )
        .map_err(|e| Error::Checkpoint(format!("Failed to load optimizer state: {e:?}")))?;
        Ok(optimizer.load_record(record))
    }

    pub fn load_latest(&self) -> Result<Checkpoint> {
        Checkpoint::load(&self.meta_path(LATEST))
    }

    pub fn load_best(&self) -> Result<Checkpoint> {
        Checkpoint::load(&self.meta_path(BEST))
    }

    pub fn has_latest(&self) -> bool {
        self.meta_path(LATEST).exists()
    }

    /// Epochs with a periodic checkpoint, ascending
    pub fn list_checkpoints(&self) -> Result<Vec<usize>> {
        if !self.checkpoint_dir.exists() {
            return Ok(Vec::new());
        }

        let mut epochs = Vec::new();
        for entry in fs::read_dir(&self.checkpoint_dir)? {
            let path = entry?.path();
            let epoch = path
                .file_name()
                .and_then(|s| s.to_str())
                .and_then(extract_epoch_from_filename);
            if let Some(epoch) = epoch {
                epochs.push(epoch);
            }
        }

        epochs.sort_unstable();
        Ok(epochs)
    }

    fn cleanup_old_checkpoints(&self, keep_n: usize) -> Result<()> {
        let epochs = self.list_checkpoints()?;
        if epochs.len() <= keep_n {
            return Ok(());
        }

        let to_remove = epochs.len() - keep_n;
        for epoch in epochs.iter().take(to_remove) {
            let name = format!("{EPOCH_PREFIX}{epoch}");
            let files = [
                self.meta_path(&name),
                self.record_file(&name),
            ];
            for file in files.iter().filter(|f| f.exists()) {
                if let Err(e) = fs::remove_file(file) {
                    warn!(path = %file.display(), error = %e, "Failed to remove old checkpoint");
                }
            }
            debug!(epoch, "Removed old checkpoint");
        }

        Ok(())
    }
}

/// Epoch of an `epoch_<n>.json` metadata file
pub fn extract_epoch_from_filename(filename: &str) -> Option<usize> {
    filename
        .strip_prefix(EPOCH_PREFIX)
        .and_then(|s| s.strip_suffix(".json"))
        .and_then(|s| s.parse().ok())
}
