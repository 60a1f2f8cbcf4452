use std::path::Path;

use burn::{
    optim::{GradientsParams, Optimizer},
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder},
    tensor::backend::AutodiffBackend,
    LearningRate,
};

use crate::{error::EstimatorError, model::Classifier};

pub const MODEL_FILE: &str = "model";
pub const OPTIMIZER_FILE: &str = "optimizer";
pub const CHECKPOINT_FILE: &str = "checkpoint.json";

type CheckpointRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// Progress saved next to the model weights.
#[derive(Config, Debug)]
pub struct CheckpointState {
    pub global_step: u64,
}

/// Owner of the trainable parameters and of the global step counter.
///
/// The model function only reads the current parameters and hands the loss of
/// a training step back through [minimize](ParameterStore::minimize).
pub trait ParameterStore<B: AutodiffBackend> {
    /// Current parameter values.
    fn model(&self) -> &Classifier<B>;

    fn global_step(&self) -> u64;

    /// Applies one update derived from the gradients of `loss` and returns the
    /// new global step.
    fn minimize(&mut self, loss: Tensor<B, 1>) -> u64;

    /// Writes the parameters and the global step into `dir`.
    fn save(&self, dir: &Path) -> Result<(), EstimatorError>;

    /// Loads the latest checkpoint from `dir`. Returns `false` when the
    /// directory holds no checkpoint.
    fn restore(&mut self, dir: &Path) -> Result<bool, EstimatorError>;
}

/// Parameter store driven by a burn [optimizer](Optimizer), SGD in the
/// reference configuration.
pub struct GradientDescentStore<B: AutodiffBackend, O> {
    model: Classifier<B>,
    optimizer: O,
    learning_rate: LearningRate,
    global_step: u64,
    device: B::Device,
}

impl<B, O> GradientDescentStore<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<Classifier<B>, B> + Clone,
{
    pub fn new(
        model: Classifier<B>,
        optimizer: O,
        learning_rate: LearningRate,
        device: B::Device,
    ) -> Self {
        Self {
            model,
            optimizer,
            learning_rate,
            global_step: 0,
            device,
        }
    }

    pub fn learning_rate(&self) -> LearningRate {
        self.learning_rate
    }

    pub fn into_model(self) -> Classifier<B> {
        self.model
    }
}

impl<B, O> ParameterStore<B> for GradientDescentStore<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<Classifier<B>, B> + Clone,
{
    fn model(&self) -> &Classifier<B> {
        &self.model
    }

    fn global_step(&self) -> u64 {
        self.global_step
    }

    fn minimize(&mut self, loss: Tensor<B, 1>) -> u64 {
        // Gradients for the current backward pass
        let grads = loss.backward();
        // Gradients linked to each parameter of the model.
        let grads = GradientsParams::from_grads(grads, &self.model);

        self.model = self
            .optimizer
            .step(self.learning_rate, self.model.clone(), grads);
        self.global_step += 1;
        self.global_step
    }

    fn save(&self, dir: &Path) -> Result<(), EstimatorError> {
        std::fs::create_dir_all(dir)?;

        let recorder = CheckpointRecorder::new();
        self.model
            .clone()
            .save_file(dir.join(MODEL_FILE), &recorder)?;
        Recorder::<B>::record(
            &recorder,
            self.optimizer.to_record(),
            dir.join(OPTIMIZER_FILE),
        )?;
        CheckpointState::new(self.global_step).save(dir.join(CHECKPOINT_FILE))?;

        log::info!(
            "Saved checkpoint for step {} into {}",
            self.global_step,
            dir.display()
        );
        Ok(())
    }

    fn restore(&mut self, dir: &Path) -> Result<bool, EstimatorError> {
        let state_path = dir.join(CHECKPOINT_FILE);
        if !state_path.exists() {
            return Ok(false);
        }

        let state = CheckpointState::load(&state_path)?;
        let recorder = CheckpointRecorder::new();

        self.model = self
            .model
            .clone()
            .load_file(dir.join(MODEL_FILE), &recorder, &self.device)?;
        let record = Recorder::<B>::load(&recorder, dir.join(OPTIMIZER_FILE), &self.device)?;
        self.optimizer = self.optimizer.clone().load_record(record);
        self.global_step = state.global_step;

        log::info!(
            "Restored checkpoint for step {} from {}",
            self.global_step,
            dir.display()
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ImageBatch;
    use crate::model::ClassifierConfig;
    use burn::backend::{Autodiff, NdArray};
    use burn::module::AutodiffModule;
    use burn::nn::loss::CrossEntropyLossConfig;
    use burn::optim::{adaptor::OptimizerAdaptor, Sgd, SgdConfig};
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<TestBackend>;

    fn sgd() -> OptimizerAdaptor<
        Sgd<TestBackend>,
        Classifier<TestAutodiffBackend>,
        TestAutodiffBackend,
    > {
        SgdConfig::new().init()
    }

    fn config() -> ClassifierConfig {
        ClassifierConfig::new()
            .with_conv1_filters(4)
            .with_conv2_filters(8)
            .with_hidden_size(16)
            .with_dropout(0.0)
    }

    fn images() -> ImageBatch {
        let pixels = (0..2 * 784).map(|i| (i % 17) as f32 / 17.0).collect();
        ImageBatch::from_flat(pixels).unwrap()
    }

    fn loss(model: &Classifier<TestAutodiffBackend>) -> Tensor<TestAutodiffBackend, 1> {
        let device = Default::default();
        let logits = model.forward(images().to_tensor(&device));
        let targets = Tensor::from_data([3, 7], &device);

        CrossEntropyLossConfig::new()
            .init(&device)
            .forward(logits, targets)
    }

    fn valid_logits(model: &Classifier<TestAutodiffBackend>) -> TensorData {
        let device = Default::default();
        model
            .valid()
            .forward(images().to_tensor::<TestBackend>(&device))
            .into_data()
    }

    #[test]
    fn minimize_advances_step_and_moves_parameters() {
        let device = Default::default();
        let model = config().init::<TestAutodiffBackend>(&device);
        let mut store = GradientDescentStore::new(model, sgd(), 0.1, device);
        let before = valid_logits(store.model());

        let step = store.minimize(loss(store.model()));

        assert_eq!(step, 1);
        assert_eq!(store.global_step(), 1);
        assert_ne!(before, valid_logits(store.model()));
    }

    #[test]
    fn restore_without_checkpoint_keeps_state() {
        let device = Default::default();
        let model = config().init::<TestAutodiffBackend>(&device);
        let mut store = GradientDescentStore::new(model, sgd(), 0.1, device);
        let dir = TempDir::new().unwrap();

        assert!(!store.restore(dir.path()).unwrap());
        assert_eq!(store.global_step(), 0);
    }

    #[test]
    fn save_then_restore_recovers_parameters_and_step() {
        let device = Default::default();
        let dir = TempDir::new().unwrap();

        let model = config().init::<TestAutodiffBackend>(&device);
        let mut trained =
            GradientDescentStore::new(model, sgd(), 0.1, device.clone());
        trained.minimize(loss(trained.model()));
        trained.minimize(loss(trained.model()));
        trained.save(dir.path()).unwrap();

        let model = config().init::<TestAutodiffBackend>(&device);
        let mut restored = GradientDescentStore::new(model, sgd(), 0.1, device);
        assert!(restored.restore(dir.path()).unwrap());

        assert_eq!(restored.global_step(), 2);
        valid_logits(restored.model()).assert_eq(&valid_logits(trained.model()), true);
    }
}
