//! ResNet-18 trunk used as the plate feature extractor.
//!
//! Only the stem and the first three stages are kept, so an `H x W` crop
//! comes out as `256 x ceil(H/16) x ceil(W/16)`. Field names follow
//! torchvision (`conv1`, `bn1`, `layer1.0.conv1`, ...) so pretrained
//! weights map over with a single key remap for `downsample`.

use std::path::{Path, PathBuf};

use burn::{
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d, Relu,
    },
    record::{CompactRecorder, FileRecorder},
    tensor::{backend::Backend, Tensor},
};
use plate_core::{Error, Result};
use tracing::info;

use crate::backend::DefaultBackend;

/// Channels produced by the trunk
pub const TRUNK_CHANNELS: usize = 256;

/// Total downsampling factor of the trunk
const TRUNK_STRIDE_HALVINGS: usize = 4;

/// Spatial size after the trunk for one input side (`ceil(side / 16)`)
pub fn trunk_output_side(side: usize) -> usize {
    (0..TRUNK_STRIDE_HALVINGS).fold(side, |s, _| s.div_ceil(2))
}

/// Flattened trunk output length for an `height x width` input
pub fn trunk_feature_size(height: usize, width: usize) -> usize {
    TRUNK_CHANNELS * trunk_output_side(height) * trunk_output_side(width)
}

/// Extension `CompactRecorder` gives its files
pub fn record_extension() -> &'static str {
    <CompactRecorder as FileRecorder<DefaultBackend>>::file_extension()
}

/// Path without the record extension; Burn's file recorders append their own
pub fn record_stem(path: &Path) -> PathBuf {
    match path.extension() {
        Some(ext) if ext == record_extension() => path.with_extension(""),
        _ => path.to_path_buf(),
    }
}

fn conv3x3<B: Backend>(in_ch: usize, out_ch: usize, stride: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([in_ch, out_ch], [3, 3])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .with_bias(false)
        .init(device)
}

/// 1x1 projection on the skip path of a strided block
#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B, 2>,
}

impl<B: Backend> Downsample<B> {
    fn new(in_ch: usize, out_ch: usize, stride: usize, device: &B::Device) -> Self {
        Self {
            conv: Conv2dConfig::new([in_ch, out_ch], [1, 1])
                .with_stride([stride, stride])
                .with_bias(false)
                .init(device),
            bn: BatchNormConfig::new(out_ch).init(device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.bn.forward(self.conv.forward(x))
    }
}

/// Two 3x3 convolutions with a residual connection
#[derive(Module, Debug)]
pub struct BasicBlock<B: Backend> {
    pub conv1: Conv2d<B>,
    pub bn1: BatchNorm<B, 2>,
    pub conv2: Conv2d<B>,
    pub bn2: BatchNorm<B, 2>,
    pub downsample: Option<Downsample<B>>,
    relu: Relu,
}

impl<B: Backend> BasicBlock<B> {
    pub fn new(in_ch: usize, out_ch: usize, stride: usize, device: &B::Device) -> Self {
        let downsample =
            (stride != 1 || in_ch != out_ch).then(|| Downsample::new(in_ch, out_ch, stride, device));

        Self {
            conv1: conv3x3(in_ch, out_ch, stride, device),
            bn1: BatchNormConfig::new(out_ch).init(device),
            conv2: conv3x3(out_ch, out_ch, 1, device),
            bn2: BatchNormConfig::new(out_ch).init(device),
            downsample,
            relu: Relu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(downsample) => downsample.forward(x.clone()),
            None => x.clone(),
        };

        let out = self.relu.forward(self.bn1.forward(self.conv1.forward(x)));
        let out = self.bn2.forward(self.conv2.forward(out));
        self.relu.forward(out + identity)
    }
}

fn stage<B: Backend>(in_ch: usize, out_ch: usize, stride: usize, device: &B::Device) -> Vec<BasicBlock<B>> {
    vec![
        BasicBlock::new(in_ch, out_ch, stride, device),
        BasicBlock::new(out_ch, out_ch, 1, device),
    ]
}

/// ResNet-18 stem plus `layer1`..`layer3`
#[derive(Module, Debug)]
pub struct ResNetTrunk<B: Backend> {
    pub conv1: Conv2d<B>,
    pub bn1: BatchNorm<B, 2>,
    pub layer1: Vec<BasicBlock<B>>,
    pub layer2: Vec<BasicBlock<B>>,
    pub layer3: Vec<BasicBlock<B>>,
    relu: Relu,
    maxpool: MaxPool2d,
}

impl<B: Backend> ResNetTrunk<B> {
    /// Randomly initialised trunk
    pub fn new(device: &B::Device) -> Self {
        Self {
            conv1: Conv2dConfig::new([3, 64], [7, 7])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(3, 3))
                .with_bias(false)
                .init(device),
            bn1: BatchNormConfig::new(64).init(device),
            layer1: stage(64, 64, 1, device),
            layer2: stage(64, 128, 2, device),
            layer3: stage(128, TRUNK_CHANNELS, 2, device),
            relu: Relu::new(),
            maxpool: MaxPool2dConfig::new([3, 3])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(),
        }
    }

    /// `[batch, 3, H, W]` to `[batch, 256, ceil(H/16), ceil(W/16)]`
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.relu.forward(self.bn1.forward(self.conv1.forward(x)));
        let x = self.maxpool.forward(x);

        self.layer1
            .iter()
            .chain(&self.layer2)
            .chain(&self.layer3)
            .fold(x, |x, block| block.forward(x))
    }

    /// Loads weights from a file.
    ///
    /// `.pt` / `.pth` files are read as PyTorch state dicts (requires the
    /// `pytorch` feature); anything else as a Burn compact record.
    pub fn load_weights(self, path: &Path, device: &B::Device) -> Result<Self> {
        let is_torch = path
            .extension()
            .is_some_and(|ext| ext == "pt" || ext == "pth");

        let trunk = if is_torch {
            self.load_pytorch(path, device)?
        } else {
            self.load_file(record_stem(path), &CompactRecorder::new(), device)
                .map_err(|e| {
                    Error::Model(format!("Failed to load backbone {}: {e:?}", path.display()))
                })?
        };

        info!(path = %path.display(), "Loaded backbone weights");
        Ok(trunk)
    }

    #[cfg(feature = "pytorch")]
    fn load_pytorch(self, path: &Path, device: &B::Device) -> Result<Self> {
        use burn::record::{FullPrecisionSettings, Recorder};
        use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};

        let args = LoadArgs::new(path.to_path_buf())
            .with_key_remap(r"(.+)\.downsample\.0\.(.+)", "$1.downsample.conv.$2")
            .with_key_remap(r"(.+)\.downsample\.1\.(.+)", "$1.downsample.bn.$2");

        let record: ResNetTrunkRecord<B> = PyTorchFileRecorder::<FullPrecisionSettings>::default()
            .load(args, device)
            .map_err(|e| {
                Error::Model(format!("Failed to read state dict {}: {e:?}", path.display()))
            })?;

        Ok(self.load_record(record))
    }

    #[cfg(not(feature = "pytorch"))]
    fn load_pytorch(self, path: &Path, _device: &B::Device) -> Result<Self> {
        Err(Error::Model(format!(
            "{} is a PyTorch checkpoint; rebuild with the `pytorch` feature to load it",
            path.display()
        )))
    }
}
