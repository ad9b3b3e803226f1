//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A scripted executor that records dispatch order and concurrency
//! - Building graphs from inline taskfiles
//! - Writing taskfiles into temporary directories

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use procflow::core::TaskGraph;
use procflow::orchestration::{AttemptStatus, ExecutionReport, ExecutionRequest, TaskExecutor};
use procflow::Taskfile;

/// One entry of the executor's trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trace {
    Start(String),
    End(String),
}

/// Executor driven by a script keyed on the request's operation.
///
/// Every operation sleeps for its configured duration (default 10ms) and
/// succeeds unless listed as failing. Start and end of every execution are
/// appended to a shared trace, and the peak number of concurrent executions
/// is tracked.
#[derive(Default)]
pub struct ScriptedExecutor {
    durations: HashMap<String, Duration>,
    failing: HashSet<String>,
    timing_out: HashSet<String>,
    trace: Mutex<Vec<Trace>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_duration(mut self, operation: &str, duration: Duration) -> Self {
        self.durations.insert(operation.to_string(), duration);
        self
    }

    pub fn failing(mut self, operation: &str) -> Self {
        self.failing.insert(operation.to_string());
        self
    }

    pub fn timing_out(mut self, operation: &str) -> Self {
        self.timing_out.insert(operation.to_string());
        self
    }

    pub fn trace(&self) -> Vec<Trace> {
        self.trace.lock().unwrap().clone()
    }

    /// Operations in the order they started.
    pub fn started(&self) -> Vec<String> {
        self.trace()
            .into_iter()
            .filter_map(|t| match t {
                Trace::Start(op) => Some(op),
                Trace::End(_) => None,
            })
            .collect()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn position(&self, entry: &Trace) -> usize {
        self.trace()
            .iter()
            .position(|t| t == entry)
            .unwrap_or_else(|| panic!("{:?} not in trace", entry))
    }

    /// Assert that `later` started only after `earlier` ended.
    pub fn assert_ordered(&self, earlier: &str, later: &str) {
        let end = self.position(&Trace::End(earlier.to_string()));
        let start = self.position(&Trace::Start(later.to_string()));
        assert!(
            end < start,
            "{} started before {} ended: {:?}",
            later,
            earlier,
            self.trace()
        );
    }

    /// Assert that `a` and `b` were in flight at the same time.
    pub fn assert_overlapped(&self, a: &str, b: &str) {
        let a_start = self.position(&Trace::Start(a.to_string()));
        let a_end = self.position(&Trace::End(a.to_string()));
        let b_start = self.position(&Trace::Start(b.to_string()));
        let b_end = self.position(&Trace::End(b.to_string()));
        assert!(
            a_start < b_end && b_start < a_end,
            "{} and {} did not overlap: {:?}",
            a,
            b,
            self.trace()
        );
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(&self, request: &ExecutionRequest) -> ExecutionReport {
        let op = request.operation.clone();
        self.trace.lock().unwrap().push(Trace::Start(op.clone()));
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let duration = self
            .durations
            .get(&op)
            .copied()
            .unwrap_or(Duration::from_millis(10));
        tokio::time::sleep(duration).await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        self.trace.lock().unwrap().push(Trace::End(op.clone()));

        let status = if self.timing_out.contains(&op) {
            AttemptStatus::TimedOut
        } else if self.failing.contains(&op) {
            AttemptStatus::Failed { recoverable: false }
        } else {
            AttemptStatus::Success
        };
        ExecutionReport {
            success: status == AttemptStatus::Success,
            status_code: if status == AttemptStatus::Success { Some(0) } else { Some(1) },
            diagnostic: None,
            attempts: 1,
            status,
        }
    }
}

/// Build a graph from inline taskfile text.
pub fn graph_from_toml(contents: &str) -> TaskGraph {
    Taskfile::parse(contents, Path::new("inline.toml"))
        .expect("taskfile should parse")
        .build_graph()
        .expect("graph should build")
}

/// The A, B → C → D graph: each task's operation is its lowercase id.
pub const DIAMOND_CHAIN: &str = r#"
workflow = "diamond"

[[task]]
id = "A"
target = "erp"
operation = "a"

[[task]]
id = "B"
target = "erp"
operation = "b"

[[task]]
id = "C"
target = "erp"
operation = "c"
after = ["A", "B"]

[[task]]
id = "D"
target = "erp"
operation = "d"
after = ["C"]
"#;

/// A temporary workspace holding a taskfile and a checkpoint directory.
pub struct Workspace {
    pub temp_dir: TempDir,
    pub taskfile: PathBuf,
    pub checkpoint_dir: PathBuf,
}

impl Workspace {
    pub fn with_taskfile(contents: &str) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let taskfile = temp_dir.path().join("diamond.toml");
        std::fs::write(&taskfile, contents).expect("Failed to write taskfile");
        let checkpoint_dir = temp_dir.path().join("checkpoints");
        Self {
            temp_dir,
            taskfile,
            checkpoint_dir,
        }
    }

    pub fn load(&self) -> Taskfile {
        Taskfile::load(&self.taskfile).expect("taskfile should load")
    }
}

/// Shared handle type used by the scheduler.
pub fn shared(executor: ScriptedExecutor) -> Arc<ScriptedExecutor> {
    Arc::new(executor)
}
