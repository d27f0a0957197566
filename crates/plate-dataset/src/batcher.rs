//! Batching of [`PlateItem`]s into tensors.

use burn::data::dataloader::batcher::Batcher;
use burn::prelude::*;
use plate_core::ImageDimensions;

use crate::dataset::PlateItem;

/// A batch of plate crops
#[derive(Clone, Debug)]
pub struct PlateBatch<B: Backend> {
    /// Images with shape `[batch, 3, height, width]`
    pub images: Tensor<B, 4>,
    /// Labels with shape `[batch]`, each 0.0 or 1.0
    pub labels: Tensor<B, 1>,
}

impl<B: Backend> PlateBatch<B> {
    pub fn new(images: Tensor<B, 4>, labels: Tensor<B, 1>) -> Self {
        Self { images, labels }
    }

    pub fn len(&self) -> usize {
        self.images.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Stacks preprocessed items; normalisation already happened per item
#[derive(Clone, Debug)]
pub struct PlateBatcher {
    dims: ImageDimensions,
}

impl Default for PlateBatcher {
    fn default() -> Self {
        Self::new(ImageDimensions::plate_crop())
    }
}

impl PlateBatcher {
    pub fn new(dims: ImageDimensions) -> Self {
        Self { dims }
    }

    pub fn dims(&self) -> ImageDimensions {
        self.dims
    }
}

impl<B: Backend> Batcher<B, PlateItem, PlateBatch<B>> for PlateBatcher {
    fn batch(&self, items: Vec<PlateItem>, device: &B::Device) -> PlateBatch<B> {
        let batch_size = items.len();
        let ImageDimensions {
            height,
            width,
            channels,
        } = self.dims;

        let mut images_data = Vec::with_capacity(batch_size * self.dims.num_values());
        let mut labels_data = Vec::with_capacity(batch_size);
        for item in items {
            images_data.extend_from_slice(&item.image);
            labels_data.push(item.label);
        }

        let images = Tensor::<B, 4>::from_data(
            TensorData::new(images_data, [batch_size, channels, height, width]),
            device,
        );
        let labels = Tensor::<B, 1>::from_data(TensorData::new(labels_data, [batch_size]), device);

        PlateBatch { images, labels }
    }
}
