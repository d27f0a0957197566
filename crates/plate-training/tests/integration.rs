//! End-to-end checks of the classifier hooks, the optimizer and the trainer.

use burn::backend::{Autodiff, NdArray};
use burn::data::dataloader::batcher::Batcher;
use burn::module::{AutodiffModule, Module};
use burn::nn::BatchNorm;
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::{Distribution, Tensor, TensorData};
use plate_core::{
    AccuracyMode, ImageDimensions, LogOptions, MetricSink, NullSink, PlateLabel, Stage,
};
use plate_dataset::{InMemoryDataset, PlateBatch, PlateBatcher, PlateItem};
use plate_training::model::batch_loss;
use plate_training::{
    evaluate, ConfigureOptimizers, PlateClassifier, PlateClassifierConfig, ResNetTrunk, StepHooks,
    Trainer, TrainerConfig,
};
use tempfile::TempDir;

type TestBackend = NdArray<f32>;
type TestAutodiffBackend = Autodiff<TestBackend>;

const HEIGHT: usize = 16;
const WIDTH: usize = 32;

#[derive(Default)]
struct RecordingSink {
    entries: Vec<(String, f64, LogOptions)>,
}

impl MetricSink for RecordingSink {
    fn log(&mut self, name: &str, value: f64, options: LogOptions) {
        self.entries.push((name.to_string(), value, options));
    }
}

fn small_config(batch_size: usize) -> PlateClassifierConfig {
    PlateClassifierConfig::new(batch_size, 0.005)
        .with_input_height(HEIGHT)
        .with_input_width(WIDTH)
        .with_hidden1(16)
        .with_hidden2(8)
}

fn batch<B: burn::tensor::backend::Backend>(labels: &[f32], device: &B::Device) -> PlateBatch<B> {
    let images = Tensor::<B, 4>::random(
        [labels.len(), 3, HEIGHT, WIDTH],
        Distribution::Normal(0.0, 1.0),
        device,
    );
    let labels = Tensor::<B, 1>::from_data(TensorData::new(labels.to_vec(), [labels.len()]), device);
    PlateBatch::new(images, labels)
}

fn dataset(len: usize) -> InMemoryDataset {
    let dims = ImageDimensions::new(HEIGHT, WIDTH);
    let items = (0..len)
        .map(|i| {
            let label = if i % 2 == 0 { PlateLabel::Fraud } else { PlateLabel::Genuine };
            let value = if label == PlateLabel::Fraud { 0.5 } else { -0.5 };
            PlateItem::new(vec![value; dims.num_values()], label, format!("plate_{i}.png"))
        })
        .collect();
    InMemoryDataset::new(items)
}

fn values<const D: usize>(tensor: Tensor<TestAutodiffBackend, D>) -> Vec<f32> {
    tensor.into_data().to_vec().unwrap()
}

type Params = Vec<(String, Vec<f32>)>;

fn push_bn(params: &mut Params, name: &str, bn: &BatchNorm<TestAutodiffBackend, 2>) {
    params.push((format!("{name}.gamma"), values(bn.gamma.val())));
    params.push((format!("{name}.beta"), values(bn.beta.val())));
}

fn trunk_params(trunk: &ResNetTrunk<TestAutodiffBackend>) -> Params {
    let mut params = vec![("conv1.weight".to_string(), values(trunk.conv1.weight.val()))];
    push_bn(&mut params, "bn1", &trunk.bn1);

    let layers = [
        ("layer1", &trunk.layer1),
        ("layer2", &trunk.layer2),
        ("layer3", &trunk.layer3),
    ];
    for (layer, blocks) in layers {
        for (i, block) in blocks.iter().enumerate() {
            let prefix = format!("{layer}.{i}");
            params.push((format!("{prefix}.conv1.weight"), values(block.conv1.weight.val())));
            push_bn(&mut params, &format!("{prefix}.bn1"), &block.bn1);
            params.push((format!("{prefix}.conv2.weight"), values(block.conv2.weight.val())));
            push_bn(&mut params, &format!("{prefix}.bn2"), &block.bn2);
            if let Some(downsample) = &block.downsample {
                params.push((
                    format!("{prefix}.downsample.0.weight"),
                    values(downsample.conv.weight.val()),
                ));
                push_bn(&mut params, &format!("{prefix}.downsample.1"), &downsample.bn);
            }
        }
    }
    params
}

fn head_params(model: &PlateClassifier<TestAutodiffBackend>) -> Params {
    let mut params = Vec::new();
    for (name, linear) in [("fc1", &model.fc1), ("fc2", &model.fc2), ("fc3", &model.fc3)] {
        params.push((format!("{name}.weight"), values(linear.weight.val())));
        if let Some(bias) = &linear.bias {
            params.push((format!("{name}.bias"), values(bias.val())));
        }
    }
    for (name, bn) in [("batchnorm1", &model.batchnorm1), ("batchnorm2", &model.batchnorm2)] {
        if let Some(bn) = bn {
            params.push((format!("{name}.gamma"), values(bn.gamma.val())));
            params.push((format!("{name}.beta"), values(bn.beta.val())));
        }
    }
    params
}

fn all_params(model: &PlateClassifier<TestAutodiffBackend>) -> Params {
    let mut params = trunk_params(&model.backbone);
    params.extend(head_params(model));
    params
}

#[test]
fn training_step_on_full_size_batch() {
    let device = Default::default();
    let model = PlateClassifierConfig::new(4, 0.005)
        .with_input_height(256)
        .with_input_width(256)
        .init::<TestAutodiffBackend>(&device)
        .unwrap();

    let batch = PlateBatch::new(
        Tensor::<TestAutodiffBackend, 4>::random([4, 3, 256, 256], Distribution::Default, &device),
        Tensor::from_data(TensorData::from([1.0f32, 0.0, 0.0, 1.0]), &device),
    );
    let output = model.training_step(batch);

    let loss = output.loss_value();
    assert!(loss.is_finite());
    assert!(loss >= 0.0);
    assert!(output.metrics.contains_key("train_loss"));
    assert!(output.metrics.contains_key("acc"));
    assert_eq!(output.metric("train_loss"), Some(loss));
}

#[test]
fn forward_with_single_sample_batches() {
    let device = Default::default();
    let model = small_config(1).init::<TestAutodiffBackend>(&device).unwrap();
    assert!(model.batchnorm1.is_none());

    let output = model.forward(Tensor::random([1, 3, HEIGHT, WIDTH], Distribution::Default, &device));
    assert_eq!(output.dims(), [1, 1]);
}

#[test]
fn batch_norm_keeps_output_shape_in_training() {
    let device = Default::default();
    let model = small_config(4).init::<TestAutodiffBackend>(&device).unwrap();

    let output = model.forward(Tensor::random([4, 3, HEIGHT, WIDTH], Distribution::Default, &device));
    assert_eq!(output.dims(), [4, 1]);
    assert!(values(output).iter().all(|p| (0.0..=1.0).contains(p)));
}

#[test]
fn step_logs_follow_stage() {
    let device = Default::default();
    let model = small_config(2).init::<TestAutodiffBackend>(&device).unwrap();

    let train = model.training_step(batch(&[1.0, 0.0], &device));
    let names: Vec<&str> = train.logs.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, ["loss", "train_loss", "train_accuracy"]);
    assert!(train.logs.iter().all(|m| m.options == LogOptions::step_and_epoch()));

    let inner = model.valid();
    let val = inner.validation_step(batch(&[1.0, 0.0], &device));
    let names: Vec<&str> = val.logs.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, ["val_loss", "val_accuracy"]);
    assert!(val.logs.iter().all(|m| m.options == LogOptions::epoch_only()));
    assert!(val.metrics.contains_key("val_loss"));

    let test = inner.test_step(batch(&[0.0, 1.0], &device));
    assert!(test.metrics.contains_key("test_loss"));
    assert!(test.metrics.contains_key("acc"));
    assert_eq!(test.logs[1].name, "test_accuracy");
}

#[test]
fn configure_optimizers_uses_constructor_learning_rate() {
    let device = Default::default();
    let model = PlateClassifierConfig::new(1, 0.02)
        .with_input_height(HEIGHT)
        .with_input_width(WIDTH)
        .with_hidden1(16)
        .with_hidden2(8)
        .init::<TestAutodiffBackend>(&device)
        .unwrap();

    let configured = model.configure_optimizers();
    assert_eq!(configured.learning_rate, 0.02);
    assert_eq!(configured.num_trainable_params, model.num_params());
}

type Model = PlateClassifier<TestAutodiffBackend>;

/// A fresh model and the same model after one ASGD step on 4 samples
fn one_step(freeze_backbone: bool) -> (Model, Model) {
    let device = Default::default();
    let model = PlateClassifierConfig::new(4, 0.05)
        .with_input_height(HEIGHT)
        .with_input_width(WIDTH)
        .with_hidden1(16)
        .with_hidden2(8)
        .with_freeze_backbone(freeze_backbone)
        .init::<TestAutodiffBackend>(&device)
        .unwrap();
    let before = model.clone();

    let mut configured = model.configure_optimizers();
    let output = model.training_step(batch(&[1.0, 0.0, 0.0, 1.0], &device));
    let grads = GradientsParams::from_grads(output.loss.backward(), &model);
    let after = configured
        .optimizer
        .step(configured.learning_rate, model, grads);
    (before, after)
}

#[test]
fn optimizer_step_updates_every_trainable_parameter() {
    let (before, after) = one_step(false);

    let before = all_params(&before);
    let after = all_params(&after);
    assert_eq!(before.len(), after.len());
    for ((name, old), (_, new)) in before.iter().zip(&after) {
        assert_ne!(old, new, "{name} was not updated");
    }
}

#[test]
fn frozen_backbone_is_not_updated() {
    let (before, after) = one_step(true);

    let trunk_before = trunk_params(&before.backbone);
    let trunk_after = trunk_params(&after.backbone);
    assert!(!trunk_before.is_empty());
    for ((name, old), (_, new)) in trunk_before.iter().zip(&trunk_after) {
        assert_eq!(old, new, "{name} changed while frozen");
    }
    for ((name, old), (_, new)) in head_params(&before).iter().zip(&head_params(&after)) {
        assert_ne!(old, new, "{name} was not updated");
    }
}

#[test]
fn compute_loss_and_accuracy_on_batch() {
    let device = Default::default();
    let model = small_config(4)
        .with_accuracy(AccuracyMode::Threshold)
        .init::<TestBackend>(&device)
        .unwrap();
    let labels = [1.0, 0.0, 0.0, 1.0];
    let batch = batch::<TestBackend>(&labels, &device);

    let probabilities = model.forward(batch.images.clone());
    let expected_loss: f32 = batch_loss(
        probabilities.clone(),
        batch.labels.clone().unsqueeze_dim::<2>(1),
    )
    .into_scalar();
    let probabilities: Vec<f32> = probabilities.into_data().to_vec().unwrap();
    let correct = probabilities
        .iter()
        .zip(labels)
        .filter(|(p, label)| (**p >= 0.5) == (*label == 1.0))
        .count();

    let (loss, accuracy) = model.compute_loss_and_accuracy(batch);
    let loss: f32 = loss.into_scalar();
    assert!(loss.is_finite());
    assert!((loss - expected_loss).abs() < 1e-6);
    assert_eq!(accuracy, (100.0 * correct as f64 / 4.0).round_ties_even());
}

#[test]
fn batcher_feeds_training_step() {
    let device = Default::default();
    let model = small_config(2).init::<TestAutodiffBackend>(&device).unwrap();
    let batcher = PlateBatcher::new(ImageDimensions::new(HEIGHT, WIDTH));

    let items = dataset(2).items().to_vec();
    let batch: PlateBatch<TestAutodiffBackend> = batcher.batch(items, &device);
    let output = model.training_step(batch);
    assert!(output.loss_value().is_finite());
}

#[test]
fn fit_writes_checkpoints_and_resumes() {
    let dir = TempDir::new().unwrap();
    let device = Default::default();
    let batcher = PlateBatcher::new(ImageDimensions::new(HEIGHT, WIDTH));
    let train = dataset(6);
    let valid = dataset(2);

    let trainer_config = TrainerConfig {
        num_epochs: 2,
        batch_size: 2,
        early_stopping_patience: None,
        checkpoint_dir: dir.path().to_path_buf(),
        save_every: 1,
        keep_last: Some(1),
        seed: 7,
    };

    let model = small_config(2).init::<TestAutodiffBackend>(&device).unwrap();
    let mut sink = RecordingSink::default();
    let mut trainer = Trainer::new(trainer_config.clone());
    let outcome = trainer
        .fit::<TestAutodiffBackend, _>(model, &train, Some(&valid), &batcher, &mut sink, &device)
        .unwrap();

    assert!(!outcome.stopped_early);
    assert_eq!(trainer.training_history().len(), 2);
    assert!(outcome.best_epoch.is_some());
    assert!(dir.path().join("latest.json").exists());
    assert!(trainer.checkpoints().record_file("latest").exists());
    assert!(dir.path().join("best.json").exists());
    assert!(trainer.checkpoints().record_file("optimizer").exists());
    assert!(dir.path().join("training_state.json").exists());
    assert_eq!(trainer.checkpoints().list_checkpoints().unwrap(), vec![2]);

    // 3 batches per epoch, 3 training entries each
    let step_entries = sink
        .entries
        .iter()
        .filter(|(name, _, _)| name == "train_loss")
        .count();
    assert_eq!(step_entries, 6);
    assert!(sink.entries.iter().any(|(name, _, _)| name == "val_loss"));

    let mut resumed = Trainer::new(TrainerConfig {
        num_epochs: 3,
        ..trainer_config
    });
    let model = resumed
        .resume::<TestAutodiffBackend, _>(small_config(2).init(&device).unwrap(), &device)
        .unwrap();
    assert_eq!(resumed.state().epoch, 2);

    resumed
        .fit::<TestAutodiffBackend, _>(model, &train, Some(&valid), &batcher, &mut NullSink, &device)
        .unwrap();
    assert_eq!(resumed.training_history().len(), 3);
    assert_eq!(resumed.state().epoch, 3);
}

#[test]
fn fit_rejects_empty_training_set() {
    let dir = TempDir::new().unwrap();
    let device = Default::default();
    let model = small_config(1).init::<TestAutodiffBackend>(&device).unwrap();
    let mut trainer = Trainer::new(TrainerConfig {
        checkpoint_dir: dir.path().to_path_buf(),
        ..TrainerConfig::default()
    });

    let result = trainer.fit::<TestAutodiffBackend, _>(
        model,
        &InMemoryDataset::default(),
        None,
        &PlateBatcher::new(ImageDimensions::new(HEIGHT, WIDTH)),
        &mut NullSink,
        &device,
    );
    assert!(matches!(result, Err(plate_core::Error::Dataset(_))));
}

fn fit_one_epoch(model_batch_size: usize, samples: usize) -> plate_core::Result<RecordingSink> {
    let dir = TempDir::new().unwrap();
    let device = Default::default();
    let model = small_config(model_batch_size)
        .init::<TestAutodiffBackend>(&device)
        .unwrap();
    let mut trainer = Trainer::new(TrainerConfig {
        num_epochs: 1,
        batch_size: 2,
        early_stopping_patience: None,
        checkpoint_dir: dir.path().to_path_buf(),
        save_every: 1,
        keep_last: None,
        seed: 3,
    });

    let mut sink = RecordingSink::default();
    trainer.fit::<TestAutodiffBackend, _>(
        model,
        &dataset(samples),
        None,
        &PlateBatcher::new(ImageDimensions::new(HEIGHT, WIDTH)),
        &mut sink,
        &device,
    )?;
    Ok(sink)
}

fn train_losses(sink: &RecordingSink) -> Vec<f64> {
    sink.entries
        .iter()
        .filter(|(name, _, _)| name == "train_loss")
        .map(|(_, value, _)| *value)
        .collect()
}

#[test]
fn fit_skips_single_sample_batch_with_batch_norm() {
    // 5 samples in batches of 2: the trailing sample is never a batch of its own
    let sink = fit_one_epoch(2, 5).unwrap();
    let losses = train_losses(&sink);
    assert_eq!(losses.len(), 2);
    assert!(losses.iter().all(|loss| loss.is_finite()));
}

#[test]
fn fit_keeps_single_sample_batch_without_batch_norm() {
    let sink = fit_one_epoch(1, 5).unwrap();
    assert_eq!(train_losses(&sink).len(), 3);
}

#[test]
fn fit_rejects_training_set_smaller_than_batch_norm_needs() {
    let result = fit_one_epoch(2, 1);
    assert!(matches!(result, Err(plate_core::Error::Dataset(_))));
}

#[test]
fn evaluate_reports_test_metrics() {
    let device = Default::default();
    let model = small_config(2).init::<TestBackend>(&device).unwrap();
    let batcher = PlateBatcher::new(ImageDimensions::new(HEIGHT, WIDTH));

    let metrics = evaluate::<TestBackend, _>(
        &model,
        &dataset(5),
        &batcher,
        2,
        Stage::Test,
        &mut NullSink,
        &device,
    )
    .unwrap();

    assert!(metrics["test_loss"].is_finite());
    assert!(metrics.contains_key("test_accuracy"));
    assert_eq!(metrics["acc"], metrics["test_accuracy"]);
}
