//! Contention analysis over a batch of estimated tasks.
//!
//! Finds the parameter whose value best explains duration differences (the
//! contention driver), then flags driver values whose average duration is a
//! statistical outlier.

use std::collections::BTreeSet;

use indexmap::IndexMap;

use crate::core::task::TaskId;

/// One task of the batch under analysis with its estimated duration.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchTask {
    pub id: TaskId,
    pub parameters: IndexMap<String, String>,
    pub seconds: f64,
}

impl BatchTask {
    /// Parameter value, with a missing key reading as empty.
    pub fn value(&self, key: &str) -> &str {
        self.parameters.get(key).map(String::as_str).unwrap_or("")
    }
}

/// Tasks sharing one value of the grouping parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentionGroup {
    pub value: String,
    pub average: f64,
    pub members: usize,
}

/// Duration spread attributable to one varying parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterAnalysis {
    pub key: String,
    pub groups: Vec<ContentionGroup>,
    /// Largest minus smallest group average.
    pub range: f64,
}

/// Parameter keys with more than one distinct value across the batch,
/// in first-seen order.
pub fn varying_keys(batch: &[BatchTask]) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    for task in batch {
        for key in task.parameters.keys() {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
    }
    keys.retain(|key| {
        let distinct: BTreeSet<&str> = batch.iter().map(|t| t.value(key)).collect();
        distinct.len() > 1
    });
    keys
}

/// Group the batch by the value of `key`, in first-seen order.
pub fn group_by(batch: &[BatchTask], key: &str) -> Vec<ContentionGroup> {
    let mut sums: IndexMap<&str, (f64, usize)> = IndexMap::new();
    for task in batch {
        let entry = sums.entry(task.value(key)).or_insert((0.0, 0));
        entry.0 += task.seconds;
        entry.1 += 1;
    }
    sums.into_iter()
        .map(|(value, (total, members))| ContentionGroup {
            value: value.to_string(),
            average: total / members as f64,
            members,
        })
        .collect()
}

pub fn analyze_parameters(batch: &[BatchTask]) -> Vec<ParameterAnalysis> {
    varying_keys(batch)
        .into_iter()
        .map(|key| {
            let groups = group_by(batch, &key);
            let max = groups.iter().map(|g| g.average).fold(f64::MIN, f64::max);
            let min = groups.iter().map(|g| g.average).fold(f64::MAX, f64::min);
            ParameterAnalysis {
                key,
                groups,
                range: max - min,
            }
        })
        .collect()
}

/// Pick the contention driver.
///
/// A single varying key wins outright. Otherwise the key with the largest
/// range wins only if that range is at least `ratio` times the runner-up's;
/// anything closer is ambiguous and yields `None`.
pub fn select_driver(analyses: &[ParameterAnalysis], ratio: f64) -> Option<&ParameterAnalysis> {
    if analyses.len() == 1 {
        return analyses.first();
    }
    let mut ranked: Vec<&ParameterAnalysis> = analyses.iter().collect();
    ranked.sort_by(|a, b| b.range.total_cmp(&a.range));
    let (best, runner_up) = (ranked.first()?, ranked.get(1)?);
    if best.range <= 0.0 {
        return None;
    }
    if best.range >= ratio * runner_up.range {
        Some(best)
    } else {
        None
    }
}

/// Quantile of sorted data with linear interpolation between ranks.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    let fraction = pos - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
}

/// Minimum number of groups for outlier detection.
pub const MIN_GROUPS_FOR_OUTLIERS: usize = 4;

/// Groups whose average lies above `Q3 + sensitivity * IQR`, heaviest first.
///
/// Fewer than four groups never yield outliers.
pub fn detect_heavy(groups: &[ContentionGroup], sensitivity: f64) -> Vec<ContentionGroup> {
    if groups.len() < MIN_GROUPS_FOR_OUTLIERS {
        return Vec::new();
    }
    let mut averages: Vec<f64> = groups.iter().map(|g| g.average).collect();
    averages.sort_by(f64::total_cmp);
    let q1 = quantile(&averages, 0.25);
    let q3 = quantile(&averages, 0.75);
    let upper_fence = q3 + sensitivity * (q3 - q1);

    let mut heavy: Vec<ContentionGroup> = groups
        .iter()
        .filter(|g| g.average > upper_fence)
        .cloned()
        .collect();
    heavy.sort_by(|a, b| b.average.total_cmp(&a.average));
    heavy
}
