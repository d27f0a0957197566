//! Metric plumbing between the classifier's step functions and whoever
//! reports them.
//!
//! Step functions never write to a global logger. They return
//! [`LoggedMetric`] entries, and the training driver forwards them to one or
//! more [`MetricSink`]s.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Name of the loss entry the optimiser consumes
pub const LOSS_METRIC: &str = "loss";

/// Key of the accuracy value in a step's metrics map
pub const ACCURACY_KEY: &str = "acc";

/// Where a logged value should be reported
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogOptions {
    /// Report the raw per-step value
    pub on_step: bool,
    /// Aggregate into the epoch mean
    pub on_epoch: bool,
    /// Show on the progress bar
    pub prog_bar: bool,
    /// Send to the persistent logger
    pub logger: bool,
}

impl LogOptions {
    /// Reported per step and aggregated per epoch (training metrics)
    pub fn step_and_epoch() -> Self {
        Self {
            on_step: true,
            on_epoch: true,
            prog_bar: true,
            logger: true,
        }
    }

    /// Aggregated per epoch only (validation and test metrics)
    pub fn epoch_only() -> Self {
        Self {
            on_step: false,
            on_epoch: true,
            prog_bar: true,
            logger: true,
        }
    }
}

/// A named scalar produced by a step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggedMetric {
    pub name: String,
    pub value: f64,
    pub options: LogOptions,
}

impl LoggedMetric {
    pub fn new(name: impl Into<String>, value: f64, options: LogOptions) -> Self {
        Self {
            name: name.into(),
            value,
            options,
        }
    }
}

/// Destination for step metrics
pub trait MetricSink {
    fn log(&mut self, name: &str, value: f64, options: LogOptions);
}

/// Forward every entry to a sink
pub fn forward_metrics(metrics: &[LoggedMetric], sink: &mut dyn MetricSink) {
    for metric in metrics {
        sink.log(&metric.name, metric.value, metric.options);
    }
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MetricSink for NullSink {
    fn log(&mut self, _name: &str, _value: f64, _options: LogOptions) {}
}

/// Emits per-step logger entries as `tracing` debug events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricSink for TracingSink {
    fn log(&mut self, name: &str, value: f64, options: LogOptions) {
        if options.logger && options.on_step {
            tracing::debug!(metric = name, value, "step metric");
        }
    }
}

/// Averages `on_epoch` entries until reset
#[derive(Debug, Default, Clone)]
pub struct EpochAggregator {
    totals: HashMap<String, (f64, usize)>,
}

impl EpochAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mean of a metric over the current epoch
    pub fn mean(&self, name: &str) -> Option<f64> {
        self.totals
            .get(name)
            .filter(|(_, count)| *count > 0)
            .map(|(sum, count)| sum / *count as f64)
    }

    /// All epoch means, sorted by name
    pub fn means(&self) -> BTreeMap<String, f64> {
        self.totals
            .iter()
            .filter(|(_, (_, count))| *count > 0)
            .map(|(name, (sum, count))| (name.clone(), sum / *count as f64))
            .collect()
    }

    pub fn reset(&mut self) {
        self.totals.clear();
    }
}

impl MetricSink for EpochAggregator {
    fn log(&mut self, name: &str, value: f64, options: LogOptions) {
        if !options.on_epoch {
            return;
        }
        let entry = self.totals.entry(name.to_string()).or_insert((0.0, 0));
        entry.0 += value;
        entry.1 += 1;
    }
}

/// Per-epoch history of a training run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingHistory {
    /// Epoch numbers
    pub epochs: Vec<usize>,
    /// Training loss history
    pub train_loss: Vec<f64>,
    /// Training accuracy history
    pub train_accuracy: Vec<f64>,
    /// Validation loss history (`None` when no validation set)
    pub val_loss: Vec<Option<f64>>,
    /// Validation accuracy history (`None` when no validation set)
    pub val_accuracy: Vec<Option<f64>>,
    /// Learning rate history
    pub learning_rate: Vec<f64>,
}

impl TrainingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds metrics for an epoch
    pub fn add_epoch(
        &mut self,
        epoch: usize,
        train_loss: f64,
        train_acc: f64,
        val_loss: Option<f64>,
        val_acc: Option<f64>,
        lr: f64,
    ) {
        self.epochs.push(epoch);
        self.train_loss.push(train_loss);
        self.train_accuracy.push(train_acc);
        self.val_loss.push(val_loss);
        self.val_accuracy.push(val_acc);
        self.learning_rate.push(lr);
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    /// Lowest validation loss seen
    pub fn best_val_loss(&self) -> Option<f64> {
        self.val_loss
            .iter()
            .flatten()
            .copied()
            .filter(|v| !v.is_nan())
            .min_by(f64::total_cmp)
    }

    /// Epoch with the lowest validation loss
    pub fn best_epoch(&self) -> Option<usize> {
        self.val_loss
            .iter()
            .enumerate()
            .filter_map(|(idx, v)| v.filter(|v| !v.is_nan()).map(|v| (idx, v)))
            .min_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(idx, _)| self.epochs[idx])
    }
}
