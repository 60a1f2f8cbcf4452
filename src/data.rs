use std::sync::Arc;

use burn::{
    data::{
        dataloader::{batcher::Batcher, DataLoader, DataLoaderBuilder},
        dataset::{transform::PartialDataset, vision::MnistItem, Dataset},
    },
    prelude::*,
};

use crate::error::{EstimatorError, ShapeError};

pub const IMAGE_HEIGHT: usize = 28;
pub const IMAGE_WIDTH: usize = 28;
pub const IMAGE_CHANNELS: usize = 1;
pub const IMAGE_SIZE: usize = IMAGE_HEIGHT * IMAGE_WIDTH * IMAGE_CHANNELS;

/// Images at the end of the MNIST training split kept out of training.
pub const VALIDATION_SIZE: usize = 5_000;

/// Batch of images laid out as `[batch, height, width, channels]`.
///
/// The pixels live on the host so the same batch can feed both the autodiff
/// backend (train) and its inner backend (evaluate, predict).
#[derive(Clone, Debug, PartialEq)]
pub struct ImageBatch {
    pixels: Vec<f32>,
    dims: [usize; 4],
}

impl ImageBatch {
    /// Wraps a pixel buffer with its shape. Only the buffer length is checked
    /// here, the image dimensions are checked when the batch is consumed.
    pub fn new(pixels: Vec<f32>, dims: [usize; 4]) -> Result<Self, ShapeError> {
        let expected = dims.iter().product::<usize>();

        if pixels.len() != expected {
            return Err(ShapeError::PixelCount {
                dims,
                expected,
                actual: pixels.len(),
            });
        }

        Ok(Self { pixels, dims })
    }

    /// Reinterprets a flat buffer of `n * 784` pixels as `n` images of 28x28x1.
    pub fn from_flat(pixels: Vec<f32>) -> Result<Self, ShapeError> {
        if pixels.len() % IMAGE_SIZE != 0 {
            return Err(ShapeError::PartialImage {
                image_size: IMAGE_SIZE,
                actual: pixels.len(),
            });
        }

        let batch_size = pixels.len() / IMAGE_SIZE;
        Self::new(
            pixels,
            [batch_size, IMAGE_HEIGHT, IMAGE_WIDTH, IMAGE_CHANNELS],
        )
    }

    pub fn zeros(batch_size: usize) -> Self {
        Self {
            pixels: vec![0.0; batch_size * IMAGE_SIZE],
            dims: [batch_size, IMAGE_HEIGHT, IMAGE_WIDTH, IMAGE_CHANNELS],
        }
    }

    pub fn dims(&self) -> [usize; 4] {
        self.dims
    }

    pub fn pixels(&self) -> &[f32] {
        &self.pixels
    }

    pub fn len(&self) -> usize {
        self.dims[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks the `[batch, 28, 28, 1]` contract and returns the batch size.
    pub fn validate(&self) -> Result<usize, ShapeError> {
        let [batch_size, height, width, channels] = self.dims;

        if (height, width, channels) != (IMAGE_HEIGHT, IMAGE_WIDTH, IMAGE_CHANNELS) {
            return Err(ShapeError::ImageDims {
                height: IMAGE_HEIGHT,
                width: IMAGE_WIDTH,
                channels: IMAGE_CHANNELS,
                actual: self.dims,
            });
        }
        if batch_size == 0 {
            return Err(ShapeError::EmptyBatch);
        }

        Ok(batch_size)
    }

    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 4> {
        let data = TensorData::new(self.pixels.clone(), self.dims);
        Tensor::from_data(data.convert::<B::FloatElem>(), device)
    }
}

/// Class ids, positionally matching an [ImageBatch].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelBatch {
    labels: Vec<u8>,
}

impl LabelBatch {
    pub fn new(labels: Vec<u8>) -> Self {
        Self { labels }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Checks the labels against the image batch they belong to.
    pub fn validate(&self, batch_size: usize, num_classes: usize) -> Result<(), EstimatorError> {
        if self.labels.len() != batch_size {
            return Err(ShapeError::LabelCount {
                images: batch_size,
                labels: self.labels.len(),
            }
            .into());
        }

        match self
            .labels
            .iter()
            .position(|label| *label as usize >= num_classes)
        {
            Some(index) => Err(EstimatorError::InvalidLabel {
                index,
                label: self.labels[index],
                num_classes,
            }),
            None => Ok(()),
        }
    }

    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 1, Int> {
        let labels = self
            .labels
            .iter()
            .map(|label| *label as i64)
            .collect::<Vec<_>>();
        let data = TensorData::new(labels, [self.labels.len()]);

        Tensor::from_data(data.convert::<B::IntElem>(), device)
    }
}

impl From<Vec<u8>> for LabelBatch {
    fn from(labels: Vec<u8>) -> Self {
        Self::new(labels)
    }
}

#[derive(Clone, Debug)]
pub struct DigitBatch {
    pub images: ImageBatch,
    pub labels: LabelBatch,
}

/// Turns MNIST items into host-side [digit batches](DigitBatch) with pixels in `[0, 1]`.
#[derive(Clone, Debug, Default)]
pub struct MnistBatcher;

impl MnistBatcher {
    pub fn new() -> Self {
        Self
    }
}

impl<B: Backend> Batcher<B, MnistItem, DigitBatch> for MnistBatcher {
    fn batch(&self, items: Vec<MnistItem>, _device: &B::Device) -> DigitBatch {
        let batch_size = items.len();
        let mut pixels = Vec::with_capacity(batch_size * IMAGE_SIZE);
        let mut labels = Vec::with_capacity(batch_size);

        for item in items {
            pixels.extend(item.image.iter().flatten().map(|pixel| pixel / 255.0));
            labels.push(item.label);
        }

        DigitBatch {
            images: ImageBatch {
                pixels,
                dims: [batch_size, IMAGE_HEIGHT, IMAGE_WIDTH, IMAGE_CHANNELS],
            },
            labels: LabelBatch::new(labels),
        }
    }
}

/// Drops the last [VALIDATION_SIZE] items, leaving 55000 of the 60000 MNIST
/// training images.
pub fn without_validation<D>(dataset: D) -> impl Dataset<MnistItem> + 'static
where
    D: Dataset<MnistItem> + 'static,
{
    let end = dataset.len().saturating_sub(VALIDATION_SIZE);
    PartialDataset::new(Arc::new(dataset), 0, end)
}

/// Shuffled loader over the MNIST training split.
pub fn train_loader<B: Backend>(
    dataset: impl Dataset<MnistItem> + 'static,
    batch_size: usize,
    seed: u64,
    num_workers: usize,
) -> Arc<dyn DataLoader<B, DigitBatch>> {
    DataLoaderBuilder::new(MnistBatcher::new())
        .batch_size(batch_size)
        .shuffle(seed)
        .num_workers(num_workers)
        .build(dataset)
}

/// Ordered loader visiting every item exactly once.
pub fn eval_loader<B: Backend>(
    dataset: impl Dataset<MnistItem> + 'static,
    batch_size: usize,
    num_workers: usize,
) -> Arc<dyn DataLoader<B, DigitBatch>> {
    DataLoaderBuilder::new(MnistBatcher::new())
        .batch_size(batch_size)
        .num_workers(num_workers)
        .build(dataset)
}

/// Restarts the loader every time it runs dry. A shuffled loader draws a new
/// permutation on each pass. An empty loader yields nothing.
pub fn repeat<'a, B: Backend, O: 'a>(
    loader: &'a dyn DataLoader<B, O>,
) -> impl Iterator<Item = O> + 'a {
    let passes = if loader.num_items() == 0 {
        0
    } else {
        usize::MAX
    };

    core::iter::repeat_with(move || loader.iter())
        .take(passes)
        .flatten()
}
