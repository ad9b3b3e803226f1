//! Taskfile loading.
//!
//! A taskfile is TOML:
//!
//! ```toml
//! workflow = "nightly"
//! mode = "explicit"              # or "sequence"
//! stages = ["extract", "load"]   # optional
//!
//! [[task]]
//! id = "load_gl"
//! target = "erp"
//! operation = "run-load gl"
//! params = { year = "2024" }
//! matrix = { region = ["eu", "us"] }
//! after = ["extract_gl"]
//! stage = "load"
//! timeout_secs = 600
//! retries = 2
//!
//! [[task]]
//! barrier = true                 # sequence mode only
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use serde::Deserialize;
use tracing::debug;

use crate::core::{
    build_explicit_graph, build_sequence_graph, IdAllocator, SequenceItem, TaskDefinition,
    TaskGraph, TaskId, TaskPolicy,
};
use crate::error::{Error, Result};

/// How dependencies are declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GraphMode {
    /// Every task lists its own predecessors.
    #[default]
    Explicit,
    /// Barrier markers split the task list into waves.
    Sequence,
}

/// One `[[task]]` entry as written.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TaskEntry {
    pub barrier: bool,
    pub id: Option<String>,
    pub target: Option<String>,
    pub operation: Option<String>,
    pub params: IndexMap<String, String>,
    pub matrix: IndexMap<String, Vec<String>>,
    pub after: Vec<String>,
    pub stage: Option<String>,
    pub require_predecessor_success: Option<bool>,
    pub safe_retry: bool,
    pub succeed_on_minor_errors: bool,
    pub cancel_at_timeout: bool,
    pub timeout_secs: Option<u64>,
    pub retries: u32,
}

impl TaskEntry {
    fn is_empty_marker(&self) -> bool {
        self.id.is_none() && self.target.is_none() && self.operation.is_none()
    }

    fn into_definition(self, position: usize) -> Result<TaskDefinition> {
        let target = self
            .target
            .ok_or_else(|| Error::Taskfile(format!("task #{} has no target", position)))?;
        let operation = self
            .operation
            .ok_or_else(|| Error::Taskfile(format!("task #{} has no operation", position)))?;

        let defaults = TaskPolicy::default();
        Ok(TaskDefinition {
            id: self.id.map(TaskId::new),
            target,
            operation,
            parameters: self.params,
            matrix: self.matrix,
            predecessors: self.after.into_iter().map(TaskId::new).collect(),
            policy: TaskPolicy {
                require_predecessor_success: self
                    .require_predecessor_success
                    .unwrap_or(defaults.require_predecessor_success),
                safe_retry: self.safe_retry,
                succeed_on_minor_errors: self.succeed_on_minor_errors,
                timeout: self.timeout_secs.map(Duration::from_secs),
                cancel_at_timeout: self.cancel_at_timeout,
                retries: self.retries,
            },
            stage: self.stage,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TaskfileDocument {
    workflow: Option<String>,
    #[serde(default)]
    mode: GraphMode,
    #[serde(default)]
    stages: Vec<String>,
    #[serde(default, rename = "task")]
    tasks: Vec<TaskEntry>,
}

/// A parsed taskfile.
#[derive(Debug, Clone)]
pub struct Taskfile {
    pub path: PathBuf,
    pub workflow: String,
    pub mode: GraphMode,
    pub stages: Vec<String>,
    pub entries: Vec<TaskEntry>,
}

impl Taskfile {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| Error::Taskfile(format!("{}: {}", path.display(), e)))?;
        Self::parse(&contents, path)
    }

    /// Parse taskfile text; `path` is recorded and supplies the default
    /// workflow name.
    pub fn parse(contents: &str, path: &Path) -> Result<Self> {
        let doc: TaskfileDocument = toml::from_str(contents)
            .map_err(|e| Error::Taskfile(format!("{}: {}", path.display(), e)))?;
        let workflow = doc
            .workflow
            .unwrap_or_else(|| crate::checkpoint::workflow_id_for_taskfile(path));
        if workflow.trim().is_empty() {
            return Err(Error::Taskfile("workflow name is empty".into()));
        }

        let taskfile = Self {
            path: path.to_path_buf(),
            workflow,
            mode: doc.mode,
            stages: doc.stages,
            entries: doc.tasks,
        };
        taskfile.check_entries()?;
        debug!(
            path = %path.display(),
            workflow = %taskfile.workflow,
            entries = taskfile.entries.len(),
            "parsed taskfile"
        );
        Ok(taskfile)
    }

    fn check_entries(&self) -> Result<()> {
        let mut seen: HashSet<&str> = HashSet::new();
        for (i, entry) in self.entries.iter().enumerate() {
            let position = i + 1;
            if entry.barrier {
                if self.mode == GraphMode::Explicit {
                    return Err(Error::Taskfile(format!(
                        "task #{} is a barrier, which only sequence mode allows",
                        position
                    )));
                }
                if !entry.is_empty_marker() {
                    return Err(Error::Taskfile(format!(
                        "task #{} is a barrier and must not define a task",
                        position
                    )));
                }
                continue;
            }
            if let Some(id) = entry.id.as_deref() {
                if !seen.insert(id) {
                    return Err(Error::Taskfile(format!("duplicate task id '{}'", id)));
                }
            }
        }
        Ok(())
    }

    /// Build the task graph. Every call numbers generated ids from 1.
    pub fn build_graph(&self) -> Result<TaskGraph> {
        let mut ids = IdAllocator::new();
        let mut graph = match self.mode {
            GraphMode::Sequence => {
                let mut items = Vec::with_capacity(self.entries.len());
                for (i, entry) in self.entries.iter().enumerate() {
                    if entry.barrier {
                        items.push(SequenceItem::Barrier);
                    } else {
                        items.push(SequenceItem::Task(entry.clone().into_definition(i + 1)?));
                    }
                }
                build_sequence_graph(items, &mut ids)?
            }
            GraphMode::Explicit => {
                let definitions = self
                    .entries
                    .iter()
                    .enumerate()
                    .map(|(i, entry)| entry.clone().into_definition(i + 1))
                    .collect::<Result<Vec<_>>>()?;
                build_explicit_graph(definitions, &mut ids)?
            }
        };
        if !self.stages.is_empty() {
            graph.apply_stage_ordering(&self.stages);
        }
        Ok(graph)
    }
}
