//! Session registries the exclusivity protocol reads from and announces to.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::util::sanitize_file_component;

/// One session as reported by a registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySession {
    pub session_id: String,
    pub labels: Vec<String>,
}

/// External registry of sessions connected to a target system.
///
/// Reads are not atomic with respect to other writers.
#[async_trait]
pub trait SessionRegistry: Send + Sync {
    /// Session id this process uses on `target`, if it has one.
    async fn get_own_session_id(&self, target: &str) -> Result<Option<String>>;

    async fn list_sessions(&self, target: &str) -> Result<Vec<RegistrySession>>;

    /// Publish this process's context label on `target`.
    async fn set_context_label(&self, target: &str, label: &str) -> Result<()>;

    /// Keep this process's session on `target` from going stale.
    async fn refresh(&self, _target: &str) -> Result<()> {
        Ok(())
    }

    /// Withdraw this process's session from `target`.
    async fn release(&self, _target: &str) -> Result<()> {
        Ok(())
    }

    /// Longest label the registry stores, if it has a limit.
    fn max_label_length(&self) -> Option<usize> {
        None
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionFile {
    session_id: String,
    labels: Vec<String>,
    pid: u32,
    updated_at: DateTime<Utc>,
}

/// Registry shared by cooperating local processes through a directory.
///
/// Each session is one JSON file at `<dir>/<target>/<session_id>.json`.
/// Files left by a process that has exited, or not refreshed within
/// `stale_after`, are removed when listed.
#[derive(Debug, Clone)]
pub struct DirectorySessionRegistry {
    dir: PathBuf,
    session_id: String,
    max_label_len: Option<usize>,
    stale_after: Option<Duration>,
}

impl DirectorySessionRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            session_id: Uuid::new_v4().to_string(),
            max_label_len: None,
            stale_after: None,
        }
    }

    pub fn with_session_id(mut self, session_id: &str) -> Self {
        self.session_id = session_id.to_string();
        self
    }

    pub fn with_max_label_len(mut self, max: usize) -> Self {
        self.max_label_len = Some(max);
        self
    }

    pub fn with_stale_after(mut self, stale_after: Option<Duration>) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn target_dir(&self, target: &str) -> PathBuf {
        self.dir.join(sanitize_file_component(target))
    }

    fn session_path(&self, target: &str) -> PathBuf {
        self.target_dir(target)
            .join(format!("{}.json", sanitize_file_component(&self.session_id)))
    }

    /// Why a session file no longer counts, if it doesn't.
    fn stale_reason(&self, file: &SessionFile) -> Option<&'static str> {
        if file.session_id != self.session_id && !process_alive(file.pid) {
            return Some("owner process exited");
        }
        let limit = self.stale_after?;
        let age = Utc::now().signed_duration_since(file.updated_at).to_std().ok()?;
        (age > limit).then_some("not refreshed")
    }

    async fn write_session_file(&self, target: &str, labels: Vec<String>) -> Result<PathBuf> {
        let dir = self.target_dir(target);
        tokio::fs::create_dir_all(&dir).await?;
        let file = SessionFile {
            session_id: self.session_id.clone(),
            labels,
            pid: std::process::id(),
            updated_at: Utc::now(),
        };
        let path = self.session_path(target);
        let temp_path = path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, serde_json::to_string_pretty(&file)?).await?;
        tokio::fs::rename(&temp_path, &path).await?;
        Ok(path)
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs the permission and existence checks only.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

async fn read_session_file(path: &Path) -> Option<SessionFile> {
    let contents = tokio::fs::read_to_string(path).await.ok()?;
    match serde_json::from_str(&contents) {
        Ok(file) => Some(file),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable session file");
            None
        }
    }
}

#[async_trait]
impl SessionRegistry for DirectorySessionRegistry {
    async fn get_own_session_id(&self, target: &str) -> Result<Option<String>> {
        if tokio::fs::try_exists(self.session_path(target)).await? {
            Ok(Some(self.session_id.clone()))
        } else {
            Ok(None)
        }
    }

    async fn list_sessions(&self, target: &str) -> Result<Vec<RegistrySession>> {
        let dir = self.target_dir(target);
        if !tokio::fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }

        let mut sessions = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(file) = read_session_file(&path).await {
                if let Some(reason) = self.stale_reason(&file) {
                    warn!(
                        system = target,
                        session = %file.session_id,
                        pid = file.pid,
                        reason,
                        "removing stale session"
                    );
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        debug!(path = %path.display(), error = %e, "stale session already gone");
                    }
                    continue;
                }
                sessions.push(RegistrySession {
                    session_id: file.session_id,
                    labels: file.labels,
                });
            }
        }
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(sessions)
    }

    async fn set_context_label(&self, target: &str, label: &str) -> Result<()> {
        if let Some(max) = self.max_label_len {
            if label.chars().count() > max {
                return Err(Error::Registry(format!(
                    "label '{}' exceeds the {} character limit",
                    label, max
                )));
            }
        }

        let path = self.write_session_file(target, vec![label.to_string()]).await?;
        debug!(system = target, label, path = %path.display(), "announced session");
        Ok(())
    }

    async fn refresh(&self, target: &str) -> Result<()> {
        let path = self.session_path(target);
        let Some(file) = read_session_file(&path).await else {
            return Ok(());
        };
        self.write_session_file(target, file.labels).await?;
        Ok(())
    }

    async fn release(&self, target: &str) -> Result<()> {
        let path = self.session_path(target);
        if tokio::fs::try_exists(&path).await? {
            tokio::fs::remove_file(&path).await?;
            debug!(system = target, "released session");
        }
        Ok(())
    }

    fn max_label_length(&self) -> Option<usize> {
        self.max_label_len
    }
}

/// Registry held in memory, for embedding and tests.
#[derive(Debug, Default)]
pub struct InMemorySessionRegistry {
    own_session_id: String,
    max_label_len: Option<usize>,
    sessions: Mutex<BTreeMap<String, Vec<RegistrySession>>>,
}

impl InMemorySessionRegistry {
    pub fn new(own_session_id: &str) -> Self {
        Self {
            own_session_id: own_session_id.to_string(),
            ..Default::default()
        }
    }

    pub fn with_max_label_len(mut self, max: usize) -> Self {
        self.max_label_len = Some(max);
        self
    }

    /// Register a session owned by someone else.
    pub fn insert(&self, target: &str, session_id: &str, labels: &[&str]) {
        let mut sessions = self.lock();
        let entry = sessions.entry(target.to_string()).or_default();
        entry.retain(|s| s.session_id != session_id);
        entry.push(RegistrySession {
            session_id: session_id.to_string(),
            labels: labels.iter().map(|l| l.to_string()).collect(),
        });
    }

    pub fn remove(&self, target: &str, session_id: &str) {
        if let Some(entry) = self.lock().get_mut(target) {
            entry.retain(|s| s.session_id != session_id);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<RegistrySession>>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SessionRegistry for InMemorySessionRegistry {
    async fn get_own_session_id(&self, target: &str) -> Result<Option<String>> {
        let own = self
            .lock()
            .get(target)
            .and_then(|entry| entry.iter().find(|s| s.session_id == self.own_session_id))
            .map(|s| s.session_id.clone());
        Ok(own)
    }

    async fn list_sessions(&self, target: &str) -> Result<Vec<RegistrySession>> {
        Ok(self.lock().get(target).cloned().unwrap_or_default())
    }

    async fn set_context_label(&self, target: &str, label: &str) -> Result<()> {
        if let Some(max) = self.max_label_len {
            if label.chars().count() > max {
                return Err(Error::Registry(format!(
                    "label '{}' exceeds the {} character limit",
                    label, max
                )));
            }
        }
        let own = self.own_session_id.clone();
        self.insert(target, &own, &[label]);
        Ok(())
    }

    async fn release(&self, target: &str) -> Result<()> {
        let own = self.own_session_id.clone();
        self.remove(target, &own);
        Ok(())
    }

    fn max_label_length(&self) -> Option<usize> {
        self.max_label_len
    }
}
