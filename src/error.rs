use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Dependency cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("Taskfile error: {0}")]
    Taskfile(String),

    #[error("Cannot resume: {message}")]
    ResumeConflict { tasks: Vec<String>, message: String },

    #[error("Checkpoint {} no longer matches its taskfile", path.display())]
    CheckpointInvalidated { path: PathBuf },

    #[error("Checkpoint schema error: {0}")]
    CheckpointSchema(String),

    #[error(
        "Timed out after {waited:?} waiting for exclusive access; still blocked by: {}",
        blocking.join(", ")
    )]
    ExclusiveModeTimeout {
        waited: Duration,
        blocking: Vec<String>,
    },

    #[error("Session registry error: {0}")]
    Registry(String),

    #[error("Duration history error: {0}")]
    History(String),

    #[error("Executor error: {0}")]
    Executor(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Worker pool is full (max {max})")]
    PoolFull { max: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
