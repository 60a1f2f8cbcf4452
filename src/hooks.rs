use crate::model_fn::PredictionRecord;

/// Logs the softmax probabilities of the training batch every `every_n_iter` steps.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoggingTensorHook {
    every_n_iter: u64,
}

impl LoggingTensorHook {
    pub fn new(every_n_iter: u64) -> Self {
        Self {
            every_n_iter: every_n_iter.max(1),
        }
    }

    /// Whether the iteration about to run should be logged. Iterations count
    /// from 0 at the start of each training run, so the first one is always
    /// logged, resumed runs included.
    pub fn should_trigger(&self, iteration: u64) -> bool {
        iteration % self.every_n_iter == 0
    }

    pub fn log(&self, global_step: u64, records: &[PredictionRecord]) {
        let probabilities = records
            .iter()
            .map(|record| format_probabilities(&record.probabilities))
            .collect::<Vec<_>>();

        log::info!(
            "probabilities = [{}] (step {global_step})",
            probabilities.join(", ")
        );
    }
}

pub fn format_probabilities(probabilities: &[f32]) -> String {
    let values = probabilities
        .iter()
        .map(|value| format!("{value:.8}"))
        .collect::<Vec<_>>();

    format!("[{}]", values.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, true)]
    #[case(49, false)]
    #[case(50, true)]
    #[case(125, false)]
    #[case(20_000, true)]
    fn triggers_every_n_iterations(#[case] iteration: u64, #[case] expected: bool) {
        let hook = LoggingTensorHook::new(50);

        assert_eq!(hook.should_trigger(iteration), expected);
    }

    #[test]
    fn zero_interval_logs_every_step() {
        let hook = LoggingTensorHook::new(0);

        assert!((0..5).all(|iteration| hook.should_trigger(iteration)));
    }

    #[test]
    fn formats_each_probability() {
        assert_eq!(format_probabilities(&[0.5, 0.25]), "[0.50000000 0.25000000]");
    }
}
