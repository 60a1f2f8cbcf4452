use core::fmt;
use std::path::{Path, PathBuf};

use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};

use crate::{
    data::{DigitBatch, ImageBatch},
    error::{EstimatorError, ShapeError},
    mode::Mode,
    model_fn::{model_fn, PredictionRecord, RunContext},
    params::ParameterStore,
};

pub const EVAL_RESULTS_FILE: &str = "eval_results.json";

/// Aggregated metrics of a full evaluation pass.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvalResults {
    pub accuracy: f32,
    pub loss: f32,
    pub global_step: u64,
}

impl fmt::Display for EvalResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{'accuracy': {:.8}, 'loss': {:.8}, 'global_step': {}}}",
            self.accuracy, self.loss, self.global_step
        )
    }
}

/// Drives [model_fn] over streams of batches: training runs, evaluation passes
/// and predictions, with checkpoints kept in an optional model directory.
pub struct Estimator<B: AutodiffBackend, S> {
    store: S,
    context: RunContext<B>,
    model_dir: Option<PathBuf>,
    log_loss_every: u64,
    save_checkpoint_steps: Option<u64>,
}

impl<B, S> Estimator<B, S>
where
    B: AutodiffBackend,
    S: ParameterStore<B>,
{
    pub fn new(store: S, context: RunContext<B>) -> Self {
        Self {
            store,
            context,
            model_dir: None,
            log_loss_every: 100,
            save_checkpoint_steps: None,
        }
    }

    /// Keeps checkpoints in `dir`, resuming from the checkpoint already there.
    pub fn with_model_dir(mut self, dir: impl Into<PathBuf>) -> Result<Self, EstimatorError> {
        let dir = dir.into();

        if !self.store.restore(&dir)? {
            log::info!("No checkpoint in {}, starting from scratch", dir.display());
        }

        self.model_dir = Some(dir);
        Ok(self)
    }

    pub fn with_log_loss_every(mut self, steps: u64) -> Self {
        self.log_loss_every = steps.max(1);
        self
    }

    pub fn with_save_checkpoint_steps(mut self, steps: Option<u64>) -> Self {
        self.save_checkpoint_steps = steps.filter(|steps| *steps > 0);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn model_dir(&self) -> Option<&Path> {
        self.model_dir.as_deref()
    }

    pub fn global_step(&self) -> u64 {
        self.store.global_step()
    }

    pub fn context(&self) -> &RunContext<B> {
        &self.context
    }

    /// Runs up to `steps` training steps, fewer if the stream ends first, and
    /// returns the global step reached.
    pub fn train<I>(&mut self, batches: I, steps: u64) -> Result<u64, EstimatorError>
    where
        I: IntoIterator<Item = DigitBatch>,
    {
        let start = self.store.global_step();
        let mut batches = batches.into_iter();
        self.context.start_step = start;
        log::info!("Training for {steps} steps from global step {start}");

        for iteration in 0..steps {
            let Some(batch) = batches.next() else {
                log::warn!("Input stream exhausted after {iteration} steps");
                break;
            };

            let outcome = model_fn(
                &mut self.store,
                &batch.images,
                Some(&batch.labels),
                Mode::Train,
                &self.context,
            )?
            .into_train()?;

            if self.logs_loss_at(iteration) {
                log::info!("loss = {}, step = {}", outcome.loss, outcome.global_step);
            }
            if let Some(every) = self.save_checkpoint_steps {
                if outcome.global_step % every == 0 {
                    self.save_checkpoint()?;
                }
            }
        }

        let global_step = self.store.global_step();
        log::info!("Training done at global step {global_step}");
        self.save_checkpoint()?;

        Ok(global_step)
    }

    /// One evaluation call per batch. Accuracy is pooled over every image,
    /// loss is the mean of the batch losses.
    pub fn evaluate<I>(&mut self, batches: I) -> Result<EvalResults, EstimatorError>
    where
        I: IntoIterator<Item = DigitBatch>,
    {
        let mut correct = 0;
        let mut total = 0;
        let mut loss_sum = 0.0;
        let mut num_batches = 0;

        for batch in batches {
            let outcome = model_fn(
                &mut self.store,
                &batch.images,
                Some(&batch.labels),
                Mode::Evaluate,
                &self.context,
            )?
            .into_evaluate()?;

            correct += outcome.correct;
            total += outcome.total;
            loss_sum += outcome.loss as f64;
            num_batches += 1;
        }

        if total == 0 {
            return Err(ShapeError::EmptyBatch.into());
        }

        let results = EvalResults {
            accuracy: correct as f32 / total as f32,
            loss: (loss_sum / num_batches as f64) as f32,
            global_step: self.store.global_step(),
        };
        log::info!(
            "Evaluation over {total} images at step {}: {results}",
            results.global_step
        );

        if let Some(dir) = &self.model_dir {
            std::fs::create_dir_all(dir)?;
            let file = std::fs::File::create(dir.join(EVAL_RESULTS_FILE))?;
            serde_json::to_writer_pretty(file, &results)?;
        }

        Ok(results)
    }

    pub fn predict(&mut self, images: &ImageBatch) -> Result<Vec<PredictionRecord>, EstimatorError> {
        model_fn(&mut self.store, images, None, Mode::Predict, &self.context)?.into_predict()
    }

    /// The loss is logged on the first iteration of a run, then every
    /// `log_loss_every` iterations.
    fn logs_loss_at(&self, iteration: u64) -> bool {
        iteration % self.log_loss_every == 0
    }

    fn save_checkpoint(&self) -> Result<(), EstimatorError> {
        match &self.model_dir {
            Some(dir) => self.store.save(dir),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{LabelBatch, IMAGE_SIZE};
    use crate::model::{Classifier, ClassifierConfig};
    use crate::params::{CheckpointState, GradientDescentStore, CHECKPOINT_FILE};
    use burn::backend::{Autodiff, NdArray};
    use burn::config::Config;
    use burn::optim::{adaptor::OptimizerAdaptor, Sgd, SgdConfig};
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<TestBackend>;
    type TestStore = GradientDescentStore<
        TestAutodiffBackend,
        OptimizerAdaptor<Sgd<TestBackend>, Classifier<TestAutodiffBackend>, TestAutodiffBackend>,
    >;

    fn estimator() -> Estimator<TestAutodiffBackend, TestStore> {
        let device = Default::default();
        let model = ClassifierConfig::new()
            .with_conv1_filters(4)
            .with_conv2_filters(8)
            .with_hidden_size(16)
            .init::<TestAutodiffBackend>(&device);
        let store =
            GradientDescentStore::new(model, SgdConfig::new().init(), 1.0e-2, device.clone());

        Estimator::new(store, RunContext::new(device))
    }

    fn batch(batch_size: usize, offset: usize) -> DigitBatch {
        let pixels = (0..batch_size * IMAGE_SIZE)
            .map(|i| ((i + offset) % 13) as f32 / 13.0)
            .collect();

        DigitBatch {
            images: ImageBatch::from_flat(pixels).unwrap(),
            labels: LabelBatch::new((0..batch_size).map(|i| ((i + offset) % 10) as u8).collect()),
        }
    }

    #[test]
    fn train_runs_requested_steps() {
        let mut estimator = estimator();
        let batches = (0..10).map(|i| batch(2, i));

        let step = estimator.train(batches, 4).unwrap();

        assert_eq!(step, 4);
        assert_eq!(estimator.global_step(), 4);
    }

    #[test]
    fn train_stops_when_stream_ends() {
        let mut estimator = estimator();

        let step = estimator.train(vec![batch(2, 0), batch(2, 1)], 5).unwrap();

        assert_eq!(step, 2);
    }

    #[test]
    fn train_propagates_batch_errors() {
        let mut estimator = estimator();
        let bad = DigitBatch {
            images: ImageBatch::zeros(2),
            labels: LabelBatch::new(vec![1]),
        };

        let result = estimator.train(vec![batch(2, 0), bad, batch(2, 1)], 3);

        assert!(matches!(result, Err(EstimatorError::Shape(_))));
        assert_eq!(estimator.global_step(), 1);
    }

    #[test]
    fn model_dir_checkpoints_and_resumes() {
        let dir = TempDir::new().unwrap();

        let mut first = estimator().with_model_dir(dir.path()).unwrap();
        first.train((0..3).map(|i| batch(2, i)), 3).unwrap();
        assert!(dir.path().join(CHECKPOINT_FILE).exists());

        let mut resumed = estimator().with_model_dir(dir.path()).unwrap();
        assert_eq!(resumed.global_step(), 3);

        let images = batch(2, 0).images;
        assert_eq!(
            resumed.predict(&images).unwrap(),
            first.predict(&images).unwrap()
        );

        resumed.train((0..2).map(|i| batch(2, i)), 2).unwrap();
        assert_eq!(resumed.global_step(), 5);
    }

    #[test]
    fn resumed_run_counts_iterations_from_its_start() {
        let dir = TempDir::new().unwrap();
        estimator()
            .with_model_dir(dir.path())
            .unwrap()
            .train((0..3).map(|i| batch(2, i)), 3)
            .unwrap();

        let mut resumed = estimator().with_model_dir(dir.path()).unwrap();
        resumed.train((0..2).map(|i| batch(2, i)), 2).unwrap();

        assert_eq!(resumed.context().start_step, 3);
        assert_eq!(resumed.context().iteration(3), 0);
        assert_eq!(resumed.global_step(), 5);
    }

    #[test]
    fn loss_is_logged_on_first_iteration_then_every_interval() {
        let estimator = estimator().with_log_loss_every(100);

        assert!(estimator.logs_loss_at(0));
        assert!(!estimator.logs_loss_at(1));
        assert!(!estimator.logs_loss_at(99));
        assert!(estimator.logs_loss_at(100));
        assert!(estimator.logs_loss_at(200));
    }

    #[test]
    fn periodic_checkpoints_are_written() {
        let dir = TempDir::new().unwrap();
        let mut estimator = estimator()
            .with_model_dir(dir.path())
            .unwrap()
            .with_save_checkpoint_steps(Some(2));

        estimator.train((0..3).map(|i| batch(1, i)), 3).unwrap();

        let state = CheckpointState::load(dir.path().join(CHECKPOINT_FILE)).unwrap();
        assert_eq!(state.global_step, 3);
    }

    #[test]
    fn evaluate_pools_accuracy_over_batches() {
        let mut estimator = estimator();
        let batches = vec![batch(3, 0), batch(5, 3)];

        let expected_correct = batches
            .iter()
            .map(|batch| {
                let records = estimator.predict(&batch.images).unwrap();
                records
                    .iter()
                    .zip(batch.labels.as_slice())
                    .filter(|(record, label)| record.class == **label as usize)
                    .count()
            })
            .sum::<usize>();

        let results = estimator.evaluate(batches).unwrap();

        assert_eq!(results.accuracy, expected_correct as f32 / 8.0);
        assert_eq!(results.global_step, 0);
        assert!(results.loss.is_finite());
    }

    #[test]
    fn evaluate_writes_results_into_model_dir() {
        let dir = TempDir::new().unwrap();
        let mut estimator = estimator().with_model_dir(dir.path()).unwrap();

        let results = estimator.evaluate(vec![batch(2, 0)]).unwrap();

        let file = std::fs::File::open(dir.path().join(EVAL_RESULTS_FILE)).unwrap();
        let written: EvalResults = serde_json::from_reader(file).unwrap();
        assert_eq!(written, results);
    }

    #[test]
    fn evaluate_empty_stream_is_an_error() {
        let mut estimator = estimator();

        let result = estimator.evaluate(Vec::new());

        assert!(matches!(
            result,
            Err(EstimatorError::Shape(ShapeError::EmptyBatch))
        ));
    }

    #[test]
    fn predict_returns_one_record_per_image() {
        let mut estimator = estimator();

        let records = estimator.predict(&ImageBatch::zeros(3)).unwrap();

        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|record| record.class < 10));
    }

    #[test]
    fn eval_results_display_like_a_dict() {
        let results = EvalResults {
            accuracy: 0.5,
            loss: 0.25,
            global_step: 20000,
        };

        assert_eq!(
            results.to_string(),
            "{'accuracy': 0.50000000, 'loss': 0.25000000, 'global_step': 20000}"
        );
    }
}
