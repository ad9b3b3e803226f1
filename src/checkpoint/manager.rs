//! CheckpointManager - keeps the on-disk checkpoint in step with a run.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::checkpoint::record::{Checkpoint, TaskResult};
use crate::core::task::TaskId;
use crate::error::Result;
use crate::util::sanitize_file_component;

const CHECKPOINT_SUFFIX: &str = ".checkpoint.json";

/// Storage backend for checkpoint documents.
pub trait CheckpointPersistence: Send + Sync {
    /// Load a checkpoint; `Ok(None)` when nothing is stored at `path`.
    fn load(&self, path: &Path) -> Result<Option<Checkpoint>>;
    fn save(&self, path: &Path, checkpoint: &Checkpoint) -> Result<()>;
    fn delete(&self, path: &Path) -> Result<()>;
}

/// JSON files on the local filesystem.
///
/// Writes go to a temporary file that is renamed into place; the previous
/// version is kept as `<name>.bak`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileCheckpointPersistence;

impl CheckpointPersistence for FileCheckpointPersistence {
    fn load(&self, path: &Path) -> Result<Option<Checkpoint>> {
        if !path.exists() {
            debug!(path = %path.display(), "no checkpoint file");
            return Ok(None);
        }
        let contents = fs::read_to_string(path)?;
        Ok(Some(Checkpoint::from_json(&contents)?))
    }

    fn save(&self, path: &Path, checkpoint: &Checkpoint) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir)?;
            }
        }

        if path.exists() {
            let backup_path = path.with_extension("json.bak");
            fs::copy(path, &backup_path)?;
        }

        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, checkpoint.to_json()?)?;
        fs::rename(&temp_path, path)?;
        Ok(())
    }

    fn delete(&self, path: &Path) -> Result<()> {
        if path.exists() {
            fs::remove_file(path)?;
        }
        let backup_path = path.with_extension("json.bak");
        if backup_path.exists() {
            fs::remove_file(backup_path)?;
        }
        Ok(())
    }
}

/// Deterministic checkpoint location for a workflow.
pub fn checkpoint_path(dir: &Path, workflow_id: &str) -> PathBuf {
    dir.join(format!(
        "{}{}",
        sanitize_file_component(workflow_id),
        CHECKPOINT_SUFFIX
    ))
}

/// Default workflow id for a taskfile: its file stem.
pub fn workflow_id_for_taskfile(taskfile: &Path) -> String {
    taskfile
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "workflow".to_string())
}

/// Locate a checkpoint left behind by an earlier run of `taskfile`.
///
/// Tries the name derived from the taskfile's stem first, then any checkpoint
/// in `dir` whose recorded taskfile path is `taskfile`. Unreadable files are
/// ignored.
pub fn find_checkpoint_for_taskfile(dir: &Path, taskfile: &Path) -> Option<PathBuf> {
    let direct = checkpoint_path(dir, &workflow_id_for_taskfile(taskfile));
    if direct.exists() {
        return Some(direct);
    }

    let entries = fs::read_dir(dir).ok()?;
    entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .map(|n| n.to_string_lossy().ends_with(CHECKPOINT_SUFFIX))
                .unwrap_or(false)
        })
        .find(|path| {
            matches!(
                FileCheckpointPersistence.load(path),
                Ok(Some(cp)) if cp.taskfile_path == taskfile
            )
        })
}

/// Owns the checkpoint of the current run and persists every transition.
///
/// Completion marks are written immediately. Dispatch marks are written only
/// when at least `interval` has passed since the previous write.
pub struct CheckpointManager {
    path: PathBuf,
    checkpoint: Checkpoint,
    persistence: Box<dyn CheckpointPersistence>,
    interval: Duration,
    enabled: bool,
    last_saved: Option<Instant>,
}

impl CheckpointManager {
    /// Start tracking a fresh run.
    ///
    /// When `enabled`, the initial checkpoint is written right away.
    pub fn new(
        dir: &Path,
        taskfile: &Path,
        workflow_id: &str,
        ids: &[TaskId],
        interval: Duration,
        enabled: bool,
    ) -> Result<Self> {
        let checkpoint = Checkpoint::create(taskfile, workflow_id, ids)?;
        Self::with_persistence(
            dir,
            checkpoint,
            Box::new(FileCheckpointPersistence),
            interval,
            enabled,
        )
    }

    /// Track an existing checkpoint (a resumed run, or a custom backend).
    pub fn with_persistence(
        dir: &Path,
        checkpoint: Checkpoint,
        persistence: Box<dyn CheckpointPersistence>,
        interval: Duration,
        enabled: bool,
    ) -> Result<Self> {
        let path = checkpoint_path(dir, &checkpoint.workflow_id);
        let mut manager = Self {
            path,
            checkpoint,
            persistence,
            interval,
            enabled,
            last_saved: None,
        };
        if enabled {
            manager.persist()?;
            info!(path = %manager.path.display(), "checkpointing enabled");
        }
        Ok(manager)
    }

    fn persist(&mut self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        self.persistence.save(&self.path, &self.checkpoint)?;
        self.last_saved = Some(Instant::now());
        Ok(())
    }

    fn interval_elapsed(&self) -> bool {
        self.last_saved
            .map(|at| at.elapsed() >= self.interval)
            .unwrap_or(true)
    }

    pub fn mark_running(&mut self, id: &TaskId) -> Result<()> {
        self.checkpoint.mark_running(id)?;
        if self.interval_elapsed() {
            self.persist()?;
        }
        Ok(())
    }

    pub fn mark_completed(&mut self, result: TaskResult) -> Result<()> {
        self.checkpoint.mark_completed(result)?;
        self.persist()
    }

    pub fn mark_skipped(&mut self, id: &TaskId, reason: &str) -> Result<()> {
        self.checkpoint.mark_skipped(id, reason)?;
        self.persist()
    }

    /// Write the current state regardless of the interval.
    pub fn flush(&mut self) -> Result<()> {
        self.persist()
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Finish the run: delete the checkpoint after a clean success, keep it
    /// (freshly written) otherwise. Returns `true` if the file was deleted.
    pub fn cleanup(&mut self, success: bool) -> Result<bool> {
        if !self.enabled {
            return Ok(false);
        }
        if success {
            self.persistence.delete(&self.path)?;
            info!(path = %self.path.display(), "run succeeded, checkpoint removed");
            return Ok(true);
        }
        self.persist()?;
        warn!(
            path = %self.path.display(),
            progress = format!("{:.1}%", self.checkpoint.progress_percentage()),
            "run incomplete, checkpoint kept for resume"
        );
        Ok(false)
    }
}

impl std::fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager")
            .field("path", &self.path)
            .field("enabled", &self.enabled)
            .field("interval", &self.interval)
            .finish()
    }
}
