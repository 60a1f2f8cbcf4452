pub mod cli;
pub mod data;
pub mod error;
pub mod estimator;
pub mod hooks;
pub mod logger;
pub mod mode;
pub mod model;
pub mod model_fn;
pub mod params;
pub mod training;

pub use error::{EstimatorError, ModeError, ShapeError};
pub use mode::Mode;
pub use model_fn::{model_fn, ModelOutput, PredictionRecord, RunContext};
