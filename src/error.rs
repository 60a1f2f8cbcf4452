use burn::config::ConfigError;
use burn::record::RecorderError;
use thiserror::Error;

use crate::mode::Mode;

/// Input tensors that violate the fixed `[batch, 28, 28, 1]` contract.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    #[error("Expected images of shape [batch, {height}, {width}, {channels}], got {actual:?}")]
    ImageDims {
        height: usize,
        width: usize,
        channels: usize,
        actual: [usize; 4],
    },
    #[error("Pixel buffer holds {actual} values but the shape {dims:?} needs {expected}")]
    PixelCount {
        dims: [usize; 4],
        expected: usize,
        actual: usize,
    },
    #[error("Pixel buffer of {actual} values is not a whole number of {image_size}-pixel images")]
    PartialImage { image_size: usize, actual: usize },
    #[error("Batch is empty")]
    EmptyBatch,
    #[error("Got {labels} labels for {images} images")]
    LabelCount { images: usize, labels: usize },
}

/// Unsupported or inconsistent mode/label combination.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModeError {
    #[error("Mode {0} requires a label batch")]
    MissingLabels(Mode),
    #[error("Unknown mode '{0}', expected one of train, eval, infer")]
    Unknown(String),
    #[error("Expected a {expected} output, got a {actual} output")]
    UnexpectedOutput { expected: Mode, actual: Mode },
}

#[derive(Error, Debug)]
pub enum EstimatorError {
    #[error("Shape error => {0}")]
    Shape(#[from] ShapeError),
    #[error("Mode error => {0}")]
    Mode(#[from] ModeError),
    #[error("Label {label} at position {index} is outside [0, {num_classes})")]
    InvalidLabel {
        index: usize,
        label: u8,
        num_classes: usize,
    },
    #[error("Tensor data error => {0}")]
    Data(String),
    #[error(transparent)]
    Record(#[from] RecorderError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
