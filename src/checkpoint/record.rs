//! Durable per-run progress record.
//!
//! A [`Checkpoint`] stores one tagged [`TaskRecord`] per logical id, so an
//! id is in exactly one state at a time. The JSON form is versioned and
//! rejects unknown versions and unknown fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::core::task::TaskId;
use crate::error::{Error, Result};

/// Current on-disk schema version.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Outcome of one finished logical id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub success: bool,
    pub duration_secs: f64,
    pub retry_count: u32,
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn new(task_id: TaskId, success: bool, duration: Duration) -> Self {
        Self {
            task_id,
            success,
            duration_secs: duration.as_secs_f64(),
            retry_count: 0,
            error: None,
            completed_at: Utc::now(),
        }
    }

    pub fn with_retries(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_secs.max(0.0))
    }
}

/// State of one logical id inside a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case", deny_unknown_fields)]
pub enum TaskRecord {
    Pending,
    InProgress { started_at: DateTime<Utc> },
    Completed { result: TaskResult },
    Failed { result: TaskResult },
    /// `reason` is informational only; nothing decides on it.
    Skipped { reason: String },
}

impl TaskRecord {
    pub fn name(&self) -> &'static str {
        match self {
            TaskRecord::Pending => "pending",
            TaskRecord::InProgress { .. } => "in_progress",
            TaskRecord::Completed { .. } => "completed",
            TaskRecord::Failed { .. } => "failed",
            TaskRecord::Skipped { .. } => "skipped",
        }
    }
}

/// Result of comparing a checkpoint with the taskfile on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintCheck {
    Match,
    /// Content changed since the checkpoint was written (non-strict mode).
    Mismatch,
}

/// Durable progress record for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Checkpoint {
    pub version: u32,
    pub workflow_id: String,
    pub taskfile_path: PathBuf,
    /// SHA-256 hex digest of the taskfile content.
    pub taskfile_hash: String,
    pub total_tasks: usize,
    /// Ids in original definition order.
    pub task_order: Vec<TaskId>,
    pub tasks: BTreeMap<TaskId, TaskRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Compute the SHA-256 hex digest of a taskfile.
pub fn fingerprint_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path)?;
    Ok(fingerprint_bytes(&bytes))
}

pub fn fingerprint_bytes(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    format!("{digest:x}")
}

impl Checkpoint {
    /// Create a checkpoint for a fresh run: every id starts pending.
    pub fn create(taskfile: &Path, workflow_id: &str, ids: &[TaskId]) -> Result<Self> {
        let hash = fingerprint_file(taskfile)?;
        Ok(Self::with_fingerprint(taskfile, &hash, workflow_id, ids))
    }

    /// Create a checkpoint from an already computed fingerprint.
    pub fn with_fingerprint(taskfile: &Path, hash: &str, workflow_id: &str, ids: &[TaskId]) -> Self {
        let now = Utc::now();
        let mut order = Vec::with_capacity(ids.len());
        let mut tasks = BTreeMap::new();
        for id in ids {
            if tasks.insert(id.clone(), TaskRecord::Pending).is_none() {
                order.push(id.clone());
            }
        }
        Self {
            version: CHECKPOINT_VERSION,
            workflow_id: workflow_id.to_string(),
            taskfile_path: taskfile.to_path_buf(),
            taskfile_hash: hash.to_string(),
            total_tasks: order.len(),
            task_order: order,
            tasks,
            created_at: now,
            updated_at: now,
        }
    }

    fn record_mut(&mut self, id: &TaskId) -> Result<&mut TaskRecord> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    /// Record that `id` has started. Already finished ids are left alone.
    pub fn mark_running(&mut self, id: &TaskId) -> Result<()> {
        let record = self.record_mut(id)?;
        if matches!(record, TaskRecord::Pending | TaskRecord::Skipped { .. }) {
            *record = TaskRecord::InProgress {
                started_at: Utc::now(),
            };
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record the final outcome of `id`.
    pub fn mark_completed(&mut self, result: TaskResult) -> Result<()> {
        let record = self.record_mut(&result.task_id)?;
        *record = if result.success {
            TaskRecord::Completed { result }
        } else {
            TaskRecord::Failed { result }
        };
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn mark_skipped(&mut self, id: &TaskId, reason: &str) -> Result<()> {
        let record = self.record_mut(id)?;
        *record = TaskRecord::Skipped {
            reason: reason.to_string(),
        };
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Put `id` back to pending so a resumed run may execute it again.
    pub fn reset(&mut self, id: &TaskId) -> Result<()> {
        *self.record_mut(id)? = TaskRecord::Pending;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn record(&self, id: &TaskId) -> Option<&TaskRecord> {
        self.tasks.get(id)
    }

    fn ids_where(&self, pred: impl Fn(&TaskRecord) -> bool) -> BTreeSet<TaskId> {
        self.tasks
            .iter()
            .filter(|(_, r)| pred(r))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Successfully completed ids with their results.
    pub fn completed_tasks(&self) -> BTreeMap<TaskId, &TaskResult> {
        self.tasks
            .iter()
            .filter_map(|(id, r)| match r {
                TaskRecord::Completed { result } => Some((id.clone(), result)),
                _ => None,
            })
            .collect()
    }

    pub fn failed_tasks(&self) -> BTreeSet<TaskId> {
        self.ids_where(|r| matches!(r, TaskRecord::Failed { .. }))
    }

    pub fn in_progress_tasks(&self) -> BTreeSet<TaskId> {
        self.ids_where(|r| matches!(r, TaskRecord::InProgress { .. }))
    }

    pub fn pending_tasks(&self) -> BTreeSet<TaskId> {
        self.ids_where(|r| matches!(r, TaskRecord::Pending))
    }

    pub fn skipped_tasks(&self) -> BTreeSet<TaskId> {
        self.ids_where(|r| matches!(r, TaskRecord::Skipped { .. }))
    }

    pub fn completed_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|r| matches!(r, TaskRecord::Completed { .. }))
            .count()
    }

    /// Share of ids completed successfully, in percent.
    pub fn progress_percentage(&self) -> f64 {
        if self.total_tasks == 0 {
            return 0.0;
        }
        self.completed_count() as f64 / self.total_tasks as f64 * 100.0
    }

    /// Compare the stored fingerprint with the taskfile at `path`.
    ///
    /// A mismatch is always logged. With `strict` it becomes
    /// [`Error::CheckpointInvalidated`], which the caller must act on.
    pub fn validate_against_taskfile(&self, path: &Path, strict: bool) -> Result<FingerprintCheck> {
        let current = fingerprint_file(path)?;
        if current == self.taskfile_hash {
            return Ok(FingerprintCheck::Match);
        }

        warn!(
            taskfile = %path.display(),
            workflow = %self.workflow_id,
            "taskfile changed since the checkpoint was written"
        );
        if strict {
            return Err(Error::CheckpointInvalidated {
                path: path.to_path_buf(),
            });
        }
        Ok(FingerprintCheck::Mismatch)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse and validate a checkpoint document.
    ///
    /// # Errors
    /// Fails on malformed JSON, unknown fields, a different schema version,
    /// or ids that disagree with `task_order`.
    pub fn from_json(contents: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(contents)
            .map_err(|e| Error::CheckpointSchema(e.to_string()))?;
        match value.get("version").and_then(|v| v.as_u64()) {
            Some(v) if v == u64::from(CHECKPOINT_VERSION) => {}
            Some(v) => {
                return Err(Error::CheckpointSchema(format!(
                    "unsupported checkpoint version {} (expected {})",
                    v, CHECKPOINT_VERSION
                )))
            }
            None => {
                return Err(Error::CheckpointSchema(
                    "missing checkpoint version".to_string(),
                ))
            }
        }

        let checkpoint: Checkpoint =
            serde_json::from_value(value).map_err(|e| Error::CheckpointSchema(e.to_string()))?;
        checkpoint.check_consistency()?;
        Ok(checkpoint)
    }

    fn check_consistency(&self) -> Result<()> {
        if self.total_tasks != self.task_order.len() || self.tasks.len() != self.task_order.len() {
            return Err(Error::CheckpointSchema(format!(
                "task counts disagree: total={} order={} records={}",
                self.total_tasks,
                self.task_order.len(),
                self.tasks.len()
            )));
        }
        if let Some(missing) = self.task_order.iter().find(|id| !self.tasks.contains_key(*id)) {
            return Err(Error::CheckpointSchema(format!(
                "task {} listed in order but has no record",
                missing
            )));
        }
        for (id, record) in &self.tasks {
            if let TaskRecord::Completed { result } | TaskRecord::Failed { result } = record {
                let expected = matches!(record, TaskRecord::Completed { .. });
                if &result.task_id != id || result.success != expected {
                    return Err(Error::CheckpointSchema(format!(
                        "record for {} is inconsistent with its result",
                        id
                    )));
                }
            }
        }
        Ok(())
    }
}
