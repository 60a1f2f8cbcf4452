use core::fmt;
use core::str::FromStr;

use crate::error::ModeError;

/// Execution mode of a single [model_fn](crate::model_fn::model_fn) call.
///
/// The mode is fixed for the whole call: it selects which branch of the
/// topology runs, whether dropout is active and whether the parameters move.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Compute the loss and apply one gradient-descent update.
    Train,
    /// Compute the loss and the accuracy without touching the parameters.
    Evaluate,
    /// Compute classes and probabilities only.
    Predict,
}

impl Mode {
    /// Whether the mode needs a label batch.
    pub fn requires_labels(&self) -> bool {
        match self {
            Mode::Train | Mode::Evaluate => true,
            Mode::Predict => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Train => "train",
            Mode::Evaluate => "eval",
            Mode::Predict => "infer",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = ModeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "train" => Ok(Mode::Train),
            "eval" | "evaluate" => Ok(Mode::Evaluate),
            "infer" | "predict" => Ok(Mode::Predict),
            _ => Err(ModeError::Unknown(value.to_string())),
        }
    }
}
