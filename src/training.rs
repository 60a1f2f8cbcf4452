use std::path::Path;

use burn::{
    data::dataset::{vision::MnistDataset, Dataset},
    optim::SgdConfig,
    prelude::*,
    tensor::backend::AutodiffBackend,
};

use crate::{
    data::{eval_loader, repeat, train_loader, without_validation, ImageBatch},
    error::EstimatorError,
    estimator::{EvalResults, Estimator},
    hooks::LoggingTensorHook,
    model::{Classifier, ClassifierConfig},
    model_fn::{PredictionRecord, RunContext},
    params::{GradientDescentStore, ParameterStore},
};

pub const DEFAULT_MODEL_DIR: &str = "/tmp/mnist_convnet_model";
pub const CONFIG_FILE: &str = "config.json";

#[derive(Config, Debug)]
pub struct TrainingConfig {
    pub model: ClassifierConfig,
    #[config(default = 20000)]
    pub num_steps: u64,
    #[config(default = 100)]
    pub batch_size: usize,
    #[config(default = 128)]
    pub eval_batch_size: usize,
    #[config(default = 1.0e-3)]
    pub learning_rate: f64,
    #[config(default = 50)]
    pub log_probabilities_every: u64,
    #[config(default = 100)]
    pub log_loss_every: u64,
    pub save_checkpoint_steps: Option<u64>,
    #[config(default = 4)]
    pub num_workers: usize,
    #[config(default = 42)]
    pub seed: u64,
}

impl TrainingConfig {
    /// Loads the config saved by a previous run, or the reference one.
    pub fn load_or_default(model_dir: &Path) -> Result<Self, EstimatorError> {
        let path = model_dir.join(CONFIG_FILE);

        if path.exists() {
            Ok(Self::load(path)?)
        } else {
            Ok(Self::new(ClassifierConfig::new()))
        }
    }
}

/// Builds an estimator over a fresh SGD parameter store, restored from
/// `model_dir` when it holds a checkpoint.
pub fn build_estimator<B: AutodiffBackend>(
    config: &TrainingConfig,
    model_dir: &Path,
    device: B::Device,
) -> Result<Estimator<B, impl ParameterStore<B>>, EstimatorError> {
    let model = config.model.init::<B>(&device);
    let optimizer = SgdConfig::new().init::<B, Classifier<B>>();
    let store = GradientDescentStore::new(model, optimizer, config.learning_rate, device.clone());
    let context = RunContext::new(device)
        .with_logging_hook(LoggingTensorHook::new(config.log_probabilities_every));

    Ok(Estimator::new(store, context)
        .with_log_loss_every(config.log_loss_every)
        .with_save_checkpoint_steps(config.save_checkpoint_steps)
        .with_model_dir(model_dir)?)
}

/// Trains for `config.num_steps` on the MNIST training split, then evaluates on
/// the test split.
pub fn run<B: AutodiffBackend>(
    config: TrainingConfig,
    model_dir: &Path,
    device: B::Device,
) -> Result<EvalResults, EstimatorError> {
    std::fs::create_dir_all(model_dir)?;
    config.save(model_dir.join(CONFIG_FILE))?;

    B::seed(config.seed);

    let mut estimator = build_estimator::<B>(&config, model_dir, device)?;

    let train = train_loader::<B>(
        without_validation(MnistDataset::train()),
        config.batch_size,
        config.seed,
        config.num_workers,
    );
    estimator.train(repeat(train.as_ref()), config.num_steps)?;

    evaluate_with(&mut estimator, &config)
}

/// Evaluates the checkpoint in `model_dir` on the MNIST test split.
pub fn evaluate<B: AutodiffBackend>(
    model_dir: &Path,
    device: B::Device,
) -> Result<EvalResults, EstimatorError> {
    let config = TrainingConfig::load_or_default(model_dir)?;
    let mut estimator = build_estimator::<B>(&config, model_dir, device)?;

    evaluate_with(&mut estimator, &config)
}

/// Predicts the first `count` images of the MNIST test split with the
/// checkpoint in `model_dir`. Returns each record with its true label.
pub fn predict<B: AutodiffBackend>(
    model_dir: &Path,
    count: usize,
    device: B::Device,
) -> Result<Vec<(PredictionRecord, u8)>, EstimatorError> {
    let config = TrainingConfig::load_or_default(model_dir)?;
    let mut estimator = build_estimator::<B>(&config, model_dir, device)?;

    let dataset = MnistDataset::test();
    let items = (0..count.min(dataset.len()))
        .filter_map(|index| dataset.get(index))
        .collect::<Vec<_>>();
    let labels = items.iter().map(|item| item.label).collect::<Vec<_>>();
    let pixels = items
        .iter()
        .flat_map(|item| item.image.iter().flatten().map(|pixel| pixel / 255.0))
        .collect::<Vec<_>>();

    let records = estimator.predict(&ImageBatch::from_flat(pixels)?)?;
    Ok(records.into_iter().zip(labels).collect())
}

fn evaluate_with<B, S>(
    estimator: &mut Estimator<B, S>,
    config: &TrainingConfig,
) -> Result<EvalResults, EstimatorError>
where
    B: AutodiffBackend,
    S: ParameterStore<B>,
{
    let test = eval_loader::<B>(
        MnistDataset::test(),
        config.eval_batch_size,
        config.num_workers,
    );

    estimator.evaluate(test.iter())
}
