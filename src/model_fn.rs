use burn::{
    module::AutodiffModule,
    nn::loss::CrossEntropyLossConfig,
    prelude::*,
    tensor::{activation::softmax, backend::AutodiffBackend, ElementConversion},
};
use serde::{Deserialize, Serialize};

use crate::{
    data::{ImageBatch, LabelBatch},
    error::{EstimatorError, ModeError},
    hooks::LoggingTensorHook,
    mode::Mode,
    params::ParameterStore,
};

/// Per-call context handed to [model_fn]: the device the batch is placed on and
/// the optional probability logging of training steps.
#[derive(Clone, Debug)]
pub struct RunContext<B: Backend> {
    pub device: B::Device,
    pub logging_hook: Option<LoggingTensorHook>,
    /// Global step at which the current training run started.
    pub start_step: u64,
}

impl<B: Backend> RunContext<B> {
    pub fn new(device: B::Device) -> Self {
        Self {
            device,
            logging_hook: None,
            start_step: 0,
        }
    }

    pub fn with_logging_hook(mut self, hook: LoggingTensorHook) -> Self {
        self.logging_hook = Some(hook);
        self
    }

    pub fn with_start_step(mut self, start_step: u64) -> Self {
        self.start_step = start_step;
        self
    }

    /// Iteration of the current training run that `global_step` falls on,
    /// counted from 0.
    pub fn iteration(&self, global_step: u64) -> u64 {
        global_step.saturating_sub(self.start_step)
    }
}

/// Predicted class of one image with its probability distribution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub class: usize,
    pub probabilities: Vec<f32>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrainOutcome {
    pub loss: f32,
    pub global_step: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EvalOutcome {
    pub loss: f32,
    /// Fraction of images whose predicted class equals the label.
    pub accuracy: f32,
    pub correct: usize,
    pub total: usize,
}

/// Result of one [model_fn] call, tagged by the mode that produced it.
#[derive(Clone, Debug, PartialEq)]
pub enum ModelOutput {
    Predict(Vec<PredictionRecord>),
    Train(TrainOutcome),
    Evaluate(EvalOutcome),
}

impl ModelOutput {
    pub fn mode(&self) -> Mode {
        match self {
            Self::Predict(_) => Mode::Predict,
            Self::Train(_) => Mode::Train,
            Self::Evaluate(_) => Mode::Evaluate,
        }
    }

    pub fn into_predict(self) -> Result<Vec<PredictionRecord>, EstimatorError> {
        match self {
            Self::Predict(records) => Ok(records),
            other => Err(other.mismatch(Mode::Predict)),
        }
    }

    pub fn into_train(self) -> Result<TrainOutcome, EstimatorError> {
        match self {
            Self::Train(outcome) => Ok(outcome),
            other => Err(other.mismatch(Mode::Train)),
        }
    }

    pub fn into_evaluate(self) -> Result<EvalOutcome, EstimatorError> {
        match self {
            Self::Evaluate(outcome) => Ok(outcome),
            other => Err(other.mismatch(Mode::Evaluate)),
        }
    }

    fn mismatch(&self, expected: Mode) -> EstimatorError {
        ModeError::UnexpectedOutput {
            expected,
            actual: self.mode(),
        }
        .into()
    }
}

/// Runs the classifier on one batch.
///
/// - `Predict` returns the classes and probabilities; labels are ignored.
/// - `Train` computes the mean sparse softmax cross-entropy and hands it to the
///   parameter store for one update, dropout active.
/// - `Evaluate` computes the same loss and the accuracy, parameters untouched.
///
/// Every input is validated before anything runs, so a failed call leaves the
/// store as it was.
pub fn model_fn<B, S>(
    store: &mut S,
    images: &ImageBatch,
    labels: Option<&LabelBatch>,
    mode: Mode,
    context: &RunContext<B>,
) -> Result<ModelOutput, EstimatorError>
where
    B: AutodiffBackend,
    S: ParameterStore<B>,
{
    let batch_size = images.validate()?;
    let labels = match (mode.requires_labels(), labels) {
        (true, None) => return Err(ModeError::MissingLabels(mode).into()),
        (true, Some(labels)) => {
            labels.validate(batch_size, store.model().num_classes())?;
            Some(labels)
        }
        (false, _) => None,
    };

    match (mode, labels) {
        (Mode::Predict, _) => {
            let model = store.model().valid();
            let logits = model.forward(images.to_tensor(&context.device));

            predictions(logits).map(ModelOutput::Predict)
        }
        (Mode::Train, Some(labels)) => {
            let step = store.global_step();
            let logits = store.model().forward(images.to_tensor(&context.device));

            if let Some(hook) = &context.logging_hook {
                if hook.should_trigger(context.iteration(step)) {
                    hook.log(step, &predictions(logits.clone().detach())?);
                }
            }

            let loss = cross_entropy(logits, labels.to_tensor(&context.device));
            let loss_value = loss.clone().into_scalar().elem::<f32>();
            let global_step = store.minimize(loss);

            Ok(ModelOutput::Train(TrainOutcome {
                loss: loss_value,
                global_step,
            }))
        }
        (Mode::Evaluate, Some(labels)) => {
            let model = store.model().valid();
            let logits = model.forward(images.to_tensor(&context.device));
            let loss = cross_entropy(logits.clone(), labels.to_tensor(&context.device))
                .into_scalar()
                .elem::<f32>();

            let classes = argmax(logits)?;
            let correct = classes
                .iter()
                .zip(labels.as_slice())
                .filter(|(class, label)| **class == **label as usize)
                .count();

            Ok(ModelOutput::Evaluate(EvalOutcome {
                loss,
                accuracy: correct as f32 / batch_size as f32,
                correct,
                total: batch_size,
            }))
        }
        (Mode::Train | Mode::Evaluate, None) => Err(ModeError::MissingLabels(mode).into()),
    }
}

/// Mean sparse softmax cross-entropy between logits and class ids.
fn cross_entropy<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> Tensor<B, 1> {
    CrossEntropyLossConfig::new()
        .init(&logits.device())
        .forward(logits, targets)
}

/// Classes and softmax probabilities for every row of `logits`.
pub fn predictions<B: Backend>(
    logits: Tensor<B, 2>,
) -> Result<Vec<PredictionRecord>, EstimatorError> {
    let [_, num_classes] = logits.dims();
    let classes = argmax(logits.clone())?;
    let probabilities = to_vec(softmax(logits, 1))?;

    Ok(classes
        .into_iter()
        .zip(probabilities.chunks(num_classes))
        .map(|(class, probabilities)| PredictionRecord {
            class,
            probabilities: probabilities.to_vec(),
        })
        .collect())
}

/// Index of the largest logit of every row, lowest index on ties.
fn argmax<B: Backend>(logits: Tensor<B, 2>) -> Result<Vec<usize>, EstimatorError> {
    let [_, num_classes] = logits.dims();
    let values = to_vec(logits)?;

    Ok(values
        .chunks(num_classes)
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |(best, max), (index, value)| {
                    if *value > max {
                        (index, *value)
                    } else {
                        (best, max)
                    }
                })
                .0
        })
        .collect())
}

fn to_vec<B: Backend>(tensor: Tensor<B, 2>) -> Result<Vec<f32>, EstimatorError> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| EstimatorError::Data(format!("{err:?}")))
}
