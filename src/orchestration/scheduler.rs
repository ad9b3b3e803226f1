//! Scheduler for parallel task execution.
//!
//! The Scheduler drives a [`TaskGraph`] to completion: it dispatches ready
//! instances to a bounded worker pool, records each outcome in the graph and
//! the checkpoint, and keeps going until nothing is in flight and nothing
//! new becomes ready. It is the only writer of the graph and checkpoint
//! while a run is active.

use crate::checkpoint::{restore_graph, Checkpoint, CheckpointManager, RestoreSummary, TaskResult};
use crate::core::dag::TaskGraph;
use crate::core::task::{InstanceId, TaskId};
use crate::error::Result;
use crate::optimizer::ContentionOptimizer;
use crate::orchestration::executor::{ExecutionReport, ExecutionRequest, TaskExecutor};
use crate::orchestration::pool::WorkerPool;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Events emitted by the scheduler for task lifecycle changes.
///
/// These events allow external components to follow a run without
/// polling the graph.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    /// An instance has been handed to the worker pool.
    TaskStarted {
        task_id: TaskId,
        instance: InstanceId,
    },
    /// An instance finished successfully.
    TaskCompleted {
        task_id: TaskId,
        instance: InstanceId,
        duration: Duration,
    },
    /// An instance failed or was blocked by its predecessors.
    TaskFailed {
        task_id: TaskId,
        instance: InstanceId,
        reason: FailureKind,
    },
    /// Every id in the graph is terminal.
    AllTasksComplete,
}

/// Why an instance failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// A predecessor finished unsuccessfully in this run.
    PredecessorFailed(Vec<TaskId>),
    /// A predecessor has no recorded outcome in this run.
    PredecessorUnknown(Vec<TaskId>),
    /// The executor gave up after its retries.
    Execution {
        status_code: Option<i32>,
        diagnostic: Option<String>,
    },
    /// The executor hit the task's timeout.
    Timeout,
}

fn join_ids(ids: &[TaskId]) -> String {
    ids.iter().map(TaskId::as_str).collect::<Vec<_>>().join(", ")
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::PredecessorFailed(ids) => {
                write!(f, "predecessor failed: {}", join_ids(ids))
            }
            FailureKind::PredecessorUnknown(ids) => {
                write!(f, "predecessor outcome unknown: {}", join_ids(ids))
            }
            FailureKind::Execution {
                status_code,
                diagnostic,
            } => {
                write!(f, "execution failed")?;
                if let Some(code) = status_code {
                    write!(f, " (status {})", code)?;
                }
                if let Some(diagnostic) = diagnostic {
                    write!(f, ": {}", diagnostic)?;
                }
                Ok(())
            }
            FailureKind::Timeout => write!(f, "timed out"),
        }
    }
}

/// Outcome of one dispatched instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceOutcome {
    pub instance: InstanceId,
    pub task_id: TaskId,
    pub success: bool,
    pub duration: Duration,
    /// Executor attempts; 0 when the instance was blocked.
    pub attempts: u32,
    pub failure: Option<FailureKind>,
}

/// Everything a finished run produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    /// One entry per dispatched instance, in completion order.
    pub outcomes: Vec<InstanceOutcome>,
    /// Aggregated result of every terminal id, restored ids included.
    pub results: BTreeMap<TaskId, bool>,
    /// Whether every id reached a terminal state.
    pub complete: bool,
    /// Whether the run stopped early on request.
    pub cancelled: bool,
}

impl RunSummary {
    /// The ordered outcome vector: one boolean per dispatched instance.
    pub fn outcome_vector(&self) -> Vec<bool> {
        self.outcomes.iter().map(|o| o.success).collect()
    }

    pub fn executed(&self) -> usize {
        self.outcomes.len()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.success).count()
    }

    /// True when nothing failed and every id finished.
    pub fn is_success(&self) -> bool {
        self.failed() == 0 && self.complete
    }
}

/// What a worker hands back to the coordinator.
struct Completion {
    instance: InstanceId,
    report: ExecutionReport,
    elapsed: Duration,
}

/// Scheduler for parallel task execution.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use procflow::orchestration::{RetryingExecutor, Scheduler, ShellRunner};
///
/// let executor = Arc::new(RetryingExecutor::new(ShellRunner::new()));
/// let mut scheduler = Scheduler::new(graph, executor, 4);
/// let summary = scheduler.run().await?;
/// assert!(summary.is_success());
/// ```
pub struct Scheduler {
    /// The task dependency graph.
    graph: TaskGraph,
    /// Runs individual instances.
    executor: Arc<dyn TaskExecutor>,
    /// Maximum number of instances in flight.
    max_workers: usize,
    /// Durable progress record, when enabled.
    checkpoint: Option<CheckpointManager>,
    /// Ready-queue ordering, when configured.
    optimizer: Option<Arc<ContentionOptimizer>>,
    /// Channel for emitting scheduler events.
    event_tx: Option<mpsc::Sender<SchedulerEvent>>,
    /// Stops new dispatches when triggered.
    cancel: CancellationToken,
    /// This run's id → outcome table.
    results: HashMap<TaskId, bool>,
    /// When each id had its first instance dispatched.
    started: HashMap<TaskId, Instant>,
}

impl Scheduler {
    /// Create a new scheduler.
    ///
    /// # Arguments
    ///
    /// * `graph` - The task dependency graph to execute
    /// * `executor` - Runs each dispatched instance
    /// * `max_workers` - Maximum number of instances in flight
    pub fn new(graph: TaskGraph, executor: Arc<dyn TaskExecutor>, max_workers: usize) -> Self {
        Self {
            graph,
            executor,
            max_workers: max_workers.max(1),
            checkpoint: None,
            optimizer: None,
            event_tx: None,
            cancel: CancellationToken::new(),
            results: HashMap::new(),
            started: HashMap::new(),
        }
    }

    pub fn with_checkpoint(mut self, checkpoint: CheckpointManager) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    pub fn with_optimizer(mut self, optimizer: Arc<ContentionOptimizer>) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    pub fn with_events(mut self, event_tx: mpsc::Sender<SchedulerEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn into_graph(self) -> TaskGraph {
        self.graph
    }

    pub fn checkpoint(&self) -> Option<&CheckpointManager> {
        self.checkpoint.as_ref()
    }

    /// This run's id → outcome table.
    pub fn results(&self) -> &HashMap<TaskId, bool> {
        &self.results
    }

    /// Seed the graph and result table from an earlier run.
    ///
    /// Ids in `to_run` stay pending. Ids the checkpoint records as completed
    /// count as succeeded; every other id is skipped and has no outcome in
    /// this run, so dependents that require predecessor success are blocked
    /// as [`FailureKind::PredecessorUnknown`].
    pub fn resume_from_checkpoint(
        &mut self,
        checkpoint: &Checkpoint,
        to_run: &BTreeSet<TaskId>,
    ) -> Result<RestoreSummary> {
        let summary = restore_graph(&mut self.graph, checkpoint, to_run)?;
        for id in &summary.restored {
            self.results.insert(id.clone(), true);
        }
        Ok(summary)
    }

    async fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event).await;
        }
    }

    /// Check the predecessors of `id` against this run's result table.
    fn blocked_by(&self, id: &TaskId) -> Option<FailureKind> {
        let mut failed = Vec::new();
        let mut unknown = Vec::new();
        for pred in self.graph.predecessors(id) {
            match self.results.get(&pred) {
                Some(true) => {}
                Some(false) => failed.push(pred),
                None => unknown.push(pred),
            }
        }
        if !failed.is_empty() {
            Some(FailureKind::PredecessorFailed(failed))
        } else if !unknown.is_empty() {
            Some(FailureKind::PredecessorUnknown(unknown))
        } else {
            None
        }
    }

    fn checkpoint_running(&mut self, id: &TaskId) {
        if let Some(manager) = self.checkpoint.as_mut() {
            if let Err(e) = manager.mark_running(id) {
                warn!(task = %id, error = %e, "failed to checkpoint task start");
            }
        }
    }

    fn checkpoint_completed(&mut self, result: TaskResult) {
        if let Some(manager) = self.checkpoint.as_mut() {
            let id = result.task_id.clone();
            if let Err(e) = manager.mark_completed(result) {
                warn!(task = %id, error = %e, "failed to checkpoint task result");
            }
        }
    }

    /// Fold one instance outcome into the graph, checkpoint and summary.
    async fn record_outcome(
        &mut self,
        instance: InstanceId,
        report: Option<&ExecutionReport>,
        failure: Option<FailureKind>,
        elapsed: Duration,
        outcomes: &mut Vec<InstanceOutcome>,
    ) -> Result<()> {
        let Some(task_id) = self.graph.task(instance).map(|t| t.id.clone()) else {
            return Ok(());
        };
        let success = failure.is_none() && report.map(|r| r.success).unwrap_or(false);
        let attempts = report.map(|r| r.attempts).unwrap_or(0);

        let became_terminal = self.graph.mark_complete(instance, success)?;
        outcomes.push(InstanceOutcome {
            instance,
            task_id: task_id.clone(),
            success,
            duration: elapsed,
            attempts,
            failure: failure.clone(),
        });

        match &failure {
            None => {
                debug!(task = %task_id, %instance, ?elapsed, attempts, "instance succeeded");
                self.emit(SchedulerEvent::TaskCompleted {
                    task_id: task_id.clone(),
                    instance,
                    duration: elapsed,
                })
                .await;
            }
            Some(reason) => {
                warn!(task = %task_id, %instance, reason = %reason, "instance failed");
                self.emit(SchedulerEvent::TaskFailed {
                    task_id: task_id.clone(),
                    instance,
                    reason: reason.clone(),
                })
                .await;
            }
        }

        if became_terminal {
            let id_success = self.graph.result(&task_id).unwrap_or(success);
            self.results.insert(task_id.clone(), id_success);
            let duration = self
                .started
                .get(&task_id)
                .map(Instant::elapsed)
                .unwrap_or(elapsed);
            let mut result = TaskResult::new(task_id.clone(), id_success, duration)
                .with_retries(attempts.saturating_sub(1));
            if let Some(reason) = &failure {
                result = result.with_error(reason.to_string());
            }
            info!(
                task = %task_id,
                success = id_success,
                duration_secs = duration.as_secs_f64(),
                "task finished"
            );
            self.checkpoint_completed(result);
        }
        Ok(())
    }

    /// Dispatch ready instances until the pool is full or nothing is ready.
    ///
    /// Instances blocked by their predecessors are completed as failed on
    /// the spot, which can expose further ready work, so the ready set is
    /// queried again after any blocked completion.
    async fn dispatch_ready(
        &mut self,
        pool: &mut WorkerPool<Completion>,
        in_flight: &mut HashMap<tokio::task::Id, InstanceId>,
        outcomes: &mut Vec<InstanceOutcome>,
    ) -> Result<usize> {
        let mut dispatched = 0;
        loop {
            if !pool.has_capacity() {
                break;
            }
            let mut ready = self.graph.get_ready_tasks();
            if ready.is_empty() {
                break;
            }
            if let Some(optimizer) = &self.optimizer {
                optimizer.sort_ready(&self.graph, &mut ready);
            }

            let mut blocked_any = false;
            for instance in ready {
                if !pool.has_capacity() {
                    break;
                }
                let Some(task) = self.graph.task(instance) else {
                    continue;
                };
                let task_id = task.id.clone();
                let require_success = task.policy.require_predecessor_success;
                let request = ExecutionRequest::from_task(task);

                if require_success {
                    if let Some(reason) = self.blocked_by(&task_id) {
                        self.graph.mark_running(instance)?;
                        self.record_outcome(instance, None, Some(reason), Duration::ZERO, outcomes)
                            .await?;
                        blocked_any = true;
                        continue;
                    }
                }

                self.graph.mark_running(instance)?;
                if !self.started.contains_key(&task_id) {
                    self.started.insert(task_id.clone(), Instant::now());
                    self.checkpoint_running(&task_id);
                }

                let executor = Arc::clone(&self.executor);
                let handle = pool.spawn(async move {
                    let started = Instant::now();
                    let report = executor.execute(&request).await;
                    Completion {
                        instance,
                        report,
                        elapsed: started.elapsed(),
                    }
                })?;
                in_flight.insert(handle, instance);
                dispatched += 1;

                debug!(task = %task_id, %instance, active = pool.active_count(), "dispatched");
                self.emit(SchedulerEvent::TaskStarted { task_id, instance })
                    .await;
            }
            if !blocked_any {
                break;
            }
        }
        Ok(dispatched)
    }

    async fn handle_completion(
        &mut self,
        completion: Completion,
        outcomes: &mut Vec<InstanceOutcome>,
    ) -> Result<()> {
        let report = completion.report;
        let failure = if report.success {
            None
        } else if report.timed_out() {
            Some(FailureKind::Timeout)
        } else {
            Some(FailureKind::Execution {
                status_code: report.status_code,
                diagnostic: report.diagnostic.clone(),
            })
        };
        self.record_outcome(
            completion.instance,
            Some(&report),
            failure,
            completion.elapsed,
            outcomes,
        )
        .await
    }

    /// Run the scheduling loop until nothing is in flight and nothing is ready.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cycle`](crate::Error::Cycle) before dispatching
    /// anything if the graph is cyclic. Task failures are not errors; they
    /// are reported in the [`RunSummary`].
    pub async fn run(&mut self) -> Result<RunSummary> {
        self.graph.validate()?;
        info!(
            tasks = self.graph.len(),
            instances = self.graph.instance_count(),
            max_workers = self.max_workers,
            "starting run"
        );

        let mut pool: WorkerPool<Completion> = WorkerPool::new(self.max_workers);
        let mut in_flight: HashMap<tokio::task::Id, InstanceId> = HashMap::new();
        let mut outcomes: Vec<InstanceOutcome> = Vec::new();
        let mut cancel_logged = false;

        loop {
            if !self.cancel.is_cancelled() {
                self.dispatch_ready(&mut pool, &mut in_flight, &mut outcomes)
                    .await?;
            } else if !cancel_logged {
                warn!(in_flight = pool.active_count(), "cancelled, waiting for running tasks");
                cancel_logged = true;
            }

            if pool.is_empty() {
                break;
            }

            let joined = if self.cancel.is_cancelled() {
                pool.join_next().await
            } else {
                tokio::select! {
                    joined = pool.join_next() => joined,
                    _ = self.cancel.cancelled() => continue,
                }
            };
            let Some((handle, result)) = joined else {
                continue;
            };
            let Some(instance) = in_flight.remove(&handle) else {
                continue;
            };
            match result {
                Ok(completion) => self.handle_completion(completion, &mut outcomes).await?,
                Err(e) => {
                    error!(%instance, error = %e, "worker crashed");
                    let failure = FailureKind::Execution {
                        status_code: None,
                        diagnostic: Some(e.to_string()),
                    };
                    self.record_outcome(instance, None, Some(failure), Duration::ZERO, &mut outcomes)
                        .await?;
                }
            }
        }

        let complete = self.graph.is_complete();
        let cancelled = self.cancel.is_cancelled();
        if complete {
            self.emit(SchedulerEvent::AllTasksComplete).await;
        } else if !cancelled {
            let stuck: Vec<String> = self
                .graph
                .task_ids()
                .into_iter()
                .filter(|id| !self.graph.status(id).is_terminal())
                .map(|id| id.0)
                .collect();
            error!(
                tasks = ?stuck,
                "run ended with tasks that can never become ready (unsatisfiable dependency)"
            );
        }

        let summary = RunSummary {
            outcomes,
            results: self.graph.results(),
            complete,
            cancelled,
        };

        if let Some(manager) = self.checkpoint.as_mut() {
            if let Err(e) = manager.cleanup(summary.is_success()) {
                warn!(error = %e, "failed to finalise checkpoint");
            }
        }

        info!(
            executed = summary.executed(),
            failed = summary.failed(),
            success = summary.is_success(),
            "run finished"
        );
        Ok(summary)
    }
}
