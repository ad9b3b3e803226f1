use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::optimizer::SortStrategy;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub max_workers: usize,
    pub checkpoint: CheckpointConfig,
    pub exclusivity: ExclusivityConfig,
    pub optimizer: OptimizerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_workers: 4,
            checkpoint: CheckpointConfig::default(),
            exclusivity: ExclusivityConfig::default(),
            optimizer: OptimizerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub enabled: bool,
    /// Defaults to `~/.procflow/checkpoints`.
    pub dir: Option<String>,
    /// Minimum spacing between writes caused by dispatches. Completions
    /// always write.
    pub interval_secs: u64,
    /// Refuse to resume when the taskfile changed since the checkpoint.
    pub strict: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            interval_secs: 0,
            strict: false,
        }
    }
}

impl CheckpointConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExclusivityConfig {
    pub exclusive: bool,
    pub timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub force: bool,
    pub max_label_len: usize,
    /// Sessions not refreshed for this long are ignored; 0 disables.
    pub stale_after_secs: u64,
    /// Defaults to `~/.procflow/sessions`.
    pub registry_dir: Option<String>,
}

impl Default for ExclusivityConfig {
    fn default() -> Self {
        Self {
            exclusive: false,
            timeout_secs: 3600,
            poll_interval_secs: 30,
            force: false,
            max_label_len: 64,
            stale_after_secs: 900,
            registry_dir: None,
        }
    }
}

impl ExclusivityConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn stale_after(&self) -> Option<Duration> {
        (self.stale_after_secs > 0).then(|| Duration::from_secs(self.stale_after_secs))
    }

    /// How often a running session refreshes its registry entry.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs((self.stale_after_secs / 3).clamp(1, 300))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub enabled: bool,
    pub sort: Option<SortStrategy>,
    /// EWMA weight of the newest sample.
    pub alpha: f64,
    pub history_limit: usize,
    /// Samples needed before an estimate is trusted.
    pub min_samples: usize,
    pub driver_ratio: f64,
    /// IQR multiplier for the heavy-outlier fence.
    pub sensitivity: f64,
    pub synthesize_chains: bool,
    /// Defaults to `~/.procflow/history.json`.
    pub history_path: Option<String>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sort: None,
            alpha: 0.3,
            history_limit: 10,
            min_samples: 3,
            driver_ratio: 5.0,
            sensitivity: 3.0,
            synthesize_chains: true,
            history_path: None,
        }
    }
}

impl Config {
    pub fn procflow_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".procflow"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::procflow_dir()?.join("procflow.toml"))
    }

    pub fn checkpoint_dir(&self) -> Result<PathBuf> {
        match &self.checkpoint.dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::procflow_dir()?.join("checkpoints")),
        }
    }

    pub fn registry_dir(&self) -> Result<PathBuf> {
        match &self.exclusivity.registry_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::procflow_dir()?.join("sessions")),
        }
    }

    pub fn history_path(&self) -> Result<PathBuf> {
        match &self.optimizer.history_path {
            Some(path) => Ok(expand_tilde(path)),
            None => Ok(Self::procflow_dir()?.join("history.json")),
        }
    }

    /// Load from the default location; a missing file gives defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading config");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        debug!(
            max_workers = config.max_workers,
            checkpoint = config.checkpoint.enabled,
            optimizer = config.optimizer.enabled,
            "config loaded"
        );
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(Error::Validation("max_workers must be at least 1".into()));
        }
        let alpha = self.optimizer.alpha;
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(Error::Validation(format!(
                "optimizer.alpha must be in (0, 1], got {}",
                alpha
            )));
        }
        if !(self.optimizer.driver_ratio >= 1.0) {
            return Err(Error::Validation(format!(
                "optimizer.driver_ratio must be at least 1, got {}",
                self.optimizer.driver_ratio
            )));
        }
        if !(self.optimizer.sensitivity >= 0.0) {
            return Err(Error::Validation(format!(
                "optimizer.sensitivity must not be negative, got {}",
                self.optimizer.sensitivity
            )));
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
