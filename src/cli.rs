use std::path::PathBuf;

use burn::tensor::backend::AutodiffBackend;
use clap::{Parser, Subcommand};

use crate::{
    error::EstimatorError,
    hooks::format_probabilities,
    model::ClassifierConfig,
    training::{self, TrainingConfig, DEFAULT_MODEL_DIR},
};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Directory holding checkpoints, the saved config and the experiment log
    #[clap(long, global = true, default_value = DEFAULT_MODEL_DIR)]
    pub model_dir: PathBuf,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Trains on the MNIST training split, then evaluates on the test split
    Train(TrainArgs),
    /// Evaluates the latest checkpoint on the MNIST test split
    Evaluate,
    /// Predicts the first images of the MNIST test split
    Predict {
        #[clap(short, long, default_value_t = 10)]
        count: usize,
    },
}

#[derive(Parser, Debug)]
pub struct TrainArgs {
    #[clap(short = 's', long, default_value_t = 20000)]
    pub steps: u64,
    #[clap(short, long, default_value_t = 100)]
    pub batch_size: usize,
    #[clap(short, long, default_value_t = 0.001)]
    pub learning_rate: f64,
    /// Also write a checkpoint every N steps
    #[clap(long)]
    pub save_checkpoint_steps: Option<u64>,
    #[clap(long, default_value_t = 4)]
    pub num_workers: usize,
    #[clap(long, default_value_t = 42)]
    pub seed: u64,
}

impl TrainArgs {
    pub fn config(&self) -> TrainingConfig {
        TrainingConfig::new(ClassifierConfig::new())
            .with_num_steps(self.steps)
            .with_batch_size(self.batch_size)
            .with_learning_rate(self.learning_rate)
            .with_save_checkpoint_steps(self.save_checkpoint_steps)
            .with_num_workers(self.num_workers)
            .with_seed(self.seed)
    }
}

/// Runs the parsed command on backend `B`.
pub fn execute<B: AutodiffBackend>(cli: Cli, device: B::Device) -> Result<(), EstimatorError> {
    match cli.command {
        Commands::Train(args) => {
            let results = training::run::<B>(args.config(), &cli.model_dir, device)?;
            println!("{results}");
        }
        Commands::Evaluate => {
            let results = training::evaluate::<B>(&cli.model_dir, device)?;
            println!("{results}");
        }
        Commands::Predict { count } => {
            for (index, (record, label)) in training::predict::<B>(&cli.model_dir, count, device)?
                .into_iter()
                .enumerate()
            {
                println!(
                    "#{index}: predicted {} (label {label}), probabilities {}",
                    record.class,
                    format_probabilities(&record.probabilities),
                );
            }
        }
    }

    Ok(())
}
