//! Duration estimates from history: EWMA with outlier dampening.

use std::time::Duration;

use crate::core::task::Task;
use crate::optimizer::history::{task_signature, DurationHistory};

/// Samples above this multiple of the running average count as outliers.
const OUTLIER_FACTOR: f64 = 3.0;
/// Outliers are folded in at this multiple of the running average.
const OUTLIER_CAP: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DurationEstimate {
    pub seconds: f64,
    /// Samples the estimate was computed from.
    pub samples: usize,
    /// Whether the history held enough samples to trust the estimate.
    pub reliable: bool,
}

impl DurationEstimate {
    pub fn as_duration(&self) -> Duration {
        Duration::from_secs_f64(self.seconds.max(0.0))
    }
}

/// Exponentially weighted moving average over `newest_first` samples.
///
/// Folds from oldest to newest with weight `alpha` on each new sample. A
/// sample greater than three times the running average is capped at twice
/// the running average first. Returns `None` for no samples.
pub fn ewma(newest_first: &[f64], alpha: f64) -> Option<f64> {
    let mut samples = newest_first.iter().rev();
    let mut average = *samples.next()?;
    for &sample in samples {
        let sample = if average > 0.0 && sample > OUTLIER_FACTOR * average {
            OUTLIER_CAP * average
        } else {
            sample
        };
        average = alpha * sample + (1.0 - alpha) * average;
    }
    Some(average)
}

/// Estimates task durations from a [`DurationHistory`].
pub struct DurationEstimator<'a> {
    history: &'a dyn DurationHistory,
    alpha: f64,
    limit: usize,
    min_samples: usize,
}

impl<'a> DurationEstimator<'a> {
    pub fn new(history: &'a dyn DurationHistory, alpha: f64, limit: usize, min_samples: usize) -> Self {
        Self {
            history,
            alpha,
            limit,
            min_samples,
        }
    }

    pub fn estimate_signature(&self, signature: &str) -> Option<DurationEstimate> {
        let recent: Vec<f64> = self
            .history
            .get_recent_durations(signature, self.limit)
            .iter()
            .map(Duration::as_secs_f64)
            .collect();
        let seconds = ewma(&recent, self.alpha)?;
        let total = self.history.get_sample_count(signature);
        Some(DurationEstimate {
            seconds,
            samples: recent.len(),
            reliable: total >= self.min_samples,
        })
    }

    pub fn estimate(&self, task: &Task) -> Option<DurationEstimate> {
        self.estimate_signature(&task_signature(task))
    }
}
