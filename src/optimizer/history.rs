//! Historical run durations, keyed by task signature.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::core::task::Task;
use crate::error::{Error, Result};

const HISTORY_VERSION: u32 = 1;
const DEFAULT_MAX_SAMPLES: usize = 100;

/// Source of past successful durations.
pub trait DurationHistory: Send + Sync {
    /// Up to `limit` most recent durations for `signature`, newest first.
    fn get_recent_durations(&self, signature: &str, limit: usize) -> Vec<Duration>;

    fn get_sample_count(&self, signature: &str) -> usize;
}

/// Stable signature of what a task does: target, operation and parameters.
///
/// Parameter order does not matter.
pub fn task_signature(task: &Task) -> String {
    let mut params: Vec<(&String, &String)> = task.parameters.iter().collect();
    params.sort();

    let mut hasher = Sha256::new();
    hasher.update(task.target.as_bytes());
    hasher.update([0u8]);
    hasher.update(task.operation.as_bytes());
    for (key, value) in params {
        hasher.update([0u8]);
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HistoryFile {
    version: u32,
    /// Seconds per signature, oldest first.
    samples: BTreeMap<String, Vec<f64>>,
}

/// Duration history kept in memory, optionally persisted as JSON.
#[derive(Debug)]
pub struct InMemoryDurationHistory {
    samples: RwLock<HashMap<String, Vec<f64>>>,
    max_samples: usize,
}

impl Default for InMemoryDurationHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDurationHistory {
    pub fn new() -> Self {
        Self {
            samples: RwLock::new(HashMap::new()),
            max_samples: DEFAULT_MAX_SAMPLES,
        }
    }

    /// Load from `path`; a missing file gives an empty history.
    pub fn load(path: &Path) -> Result<Self> {
        let history = Self::new();
        if !path.exists() {
            return Ok(history);
        }
        let contents = fs::read_to_string(path)?;
        let file: HistoryFile = serde_json::from_str(&contents)
            .map_err(|e| Error::History(format!("{}: {}", path.display(), e)))?;
        if file.version != HISTORY_VERSION {
            return Err(Error::History(format!(
                "{}: unsupported history version {}",
                path.display(),
                file.version
            )));
        }
        {
            let mut samples = history.write();
            for (signature, durations) in file.samples {
                samples.insert(signature, durations);
            }
        }
        debug!(path = %path.display(), signatures = history.len(), "loaded duration history");
        Ok(history)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let file = HistoryFile {
            version: HISTORY_VERSION,
            samples: self
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, serde_json::to_string_pretty(&file)?)?;
        fs::rename(&temp_path, path)?;
        Ok(())
    }

    pub fn record(&self, signature: &str, duration: Duration) {
        let mut samples = self.write();
        let entry = samples.entry(signature.to_string()).or_default();
        entry.push(duration.as_secs_f64());
        if entry.len() > self.max_samples {
            let excess = entry.len() - self.max_samples;
            entry.drain(..excess);
        }
    }

    pub fn record_task(&self, task: &Task, duration: Duration) {
        self.record(&task_signature(task), duration);
    }

    /// Number of distinct signatures.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Vec<f64>>> {
        self.samples.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Vec<f64>>> {
        self.samples.write().unwrap_or_else(|p| p.into_inner())
    }
}

impl DurationHistory for InMemoryDurationHistory {
    fn get_recent_durations(&self, signature: &str, limit: usize) -> Vec<Duration> {
        self.read()
            .get(signature)
            .map(|samples| {
                samples
                    .iter()
                    .rev()
                    .take(limit)
                    .map(|secs| Duration::from_secs_f64(secs.max(0.0)))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn get_sample_count(&self, signature: &str) -> usize {
        self.read().get(signature).map(Vec::len).unwrap_or(0)
    }
}
