//! Task data model for the execution graph.
//!
//! A task is one remote process execution: an operation with parameters run
//! against a named target system. Several task instances may share a logical
//! [`TaskId`] (parameter fan-out); the graph schedules by logical id and
//! tracks each instance through its own [`InstanceId`].

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Logical identifier of a task in the dependency graph.
///
/// Sibling instances produced by parameter expansion share one `TaskId`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Handle of one concrete task instance inside a [`TaskGraph`](super::dag::TaskGraph).
///
/// Handles are only meaningful for the graph that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub(crate) usize);

impl InstanceId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Run-scoped allocator for generated task ids.
///
/// Taskfile entries without an explicit id get `<prefix>_<n>` ids. One
/// allocator belongs to one run, so numbering restarts with every new run.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: usize,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self, prefix: &str) -> TaskId {
        self.next += 1;
        TaskId(format!("{}_{}", prefix, self.next))
    }

    /// Number of ids handed out so far.
    pub fn allocated(&self) -> usize {
        self.next
    }
}

/// Execution policy flags attached to a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPolicy {
    /// Only run when every predecessor recorded success in this run.
    pub require_predecessor_success: bool,
    /// Re-running after an interruption is harmless.
    pub safe_retry: bool,
    /// Treat "finished with minor errors" as success.
    pub succeed_on_minor_errors: bool,
    /// Hard limit for one execution attempt.
    pub timeout: Option<Duration>,
    /// Ask the remote side to abort when `timeout` is hit.
    pub cancel_at_timeout: bool,
    /// Extra attempts after a recoverable failure.
    pub retries: u32,
}

impl Default for TaskPolicy {
    fn default() -> Self {
        Self {
            require_predecessor_success: true,
            safe_retry: false,
            succeed_on_minor_errors: false,
            timeout: None,
            cancel_at_timeout: false,
            retries: 0,
        }
    }
}

/// Status of a logical id.
///
/// Transitions are monotonic: `Pending -> Running -> Completed | Failed`, or
/// `Pending -> Skipped`. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// A single task instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Logical id, shared by sibling instances.
    pub id: TaskId,
    /// Name of the remote system the operation runs against.
    pub target: String,
    /// Operation (process) name.
    pub operation: String,
    /// Parameters in declaration order.
    pub parameters: IndexMap<String, String>,
    /// Logical ids that must be terminal before this task may run.
    pub predecessors: BTreeSet<TaskId>,
    pub policy: TaskPolicy,
    /// Optional coarse stage label used for stage barriers.
    pub stage: Option<String>,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, target: &str, operation: &str) -> Self {
        Self {
            id: id.into(),
            target: target.to_string(),
            operation: operation.to_string(),
            parameters: IndexMap::new(),
            predecessors: BTreeSet::new(),
            policy: TaskPolicy::default(),
            stage: None,
        }
    }

    pub fn with_param(mut self, key: &str, value: &str) -> Self {
        self.parameters.insert(key.to_string(), value.to_string());
        self
    }

    pub fn after(mut self, predecessor: impl Into<TaskId>) -> Self {
        self.predecessors.insert(predecessor.into());
        self
    }

    pub fn with_policy(mut self, policy: TaskPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn in_stage(mut self, stage: &str) -> Self {
        self.stage = Some(stage.to_string());
        self
    }

    /// Short human-readable description, e.g. `load@erp(region=eu)`.
    pub fn label(&self) -> String {
        if self.parameters.is_empty() {
            return format!("{}@{}", self.operation, self.target);
        }
        let params: Vec<String> = self
            .parameters
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        format!("{}@{}({})", self.operation, self.target, params.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_display_and_from() {
        let id: TaskId = "load".into();
        assert_eq!(id.as_str(), "load");
        assert_eq!(format!("{}", id), "load");
        assert_eq!(TaskId::from("load".to_string()), id);
    }

    #[test]
    fn test_task_id_serialization_is_transparent() {
        let id = TaskId::new("extract");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"extract\"");
        let parsed: TaskId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_id_allocator_is_run_scoped() {
        let mut first = IdAllocator::new();
        assert_eq!(first.next_id("task"), TaskId::new("task_1"));
        assert_eq!(first.next_id("task"), TaskId::new("task_2"));
        assert_eq!(first.allocated(), 2);

        let mut second = IdAllocator::new();
        assert_eq!(second.next_id("task"), TaskId::new("task_1"));
    }

    #[test]
    fn test_task_status_terminal() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Skipped.is_terminal());
    }

    #[test]
    fn test_task_status_display() {
        assert_eq!(TaskStatus::Skipped.to_string(), "skipped");
        assert_eq!(TaskStatus::Running.to_string(), "running");
    }

    #[test]
    fn test_default_policy() {
        let policy = TaskPolicy::default();
        assert!(policy.require_predecessor_success);
        assert!(!policy.safe_retry);
        assert_eq!(policy.retries, 0);
        assert!(policy.timeout.is_none());
    }

    #[test]
    fn test_task_builder_preserves_parameter_order() {
        let task = Task::new("load", "erp", "LOAD_SALES")
            .with_param("year", "2024")
            .with_param("region", "eu")
            .after("extract")
            .in_stage("load");

        let keys: Vec<&String> = task.parameters.keys().collect();
        assert_eq!(keys, vec!["year", "region"]);
        assert!(task.predecessors.contains(&TaskId::new("extract")));
        assert_eq!(task.stage.as_deref(), Some("load"));
        assert_eq!(task.label(), "LOAD_SALES@erp(year=2024,region=eu)");
    }
}
