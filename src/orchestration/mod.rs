//! Orchestration layer: running a task graph against target systems.
//!
//! This module provides the executor capability that runs single task
//! instances, the bounded worker pool, and the scheduler that drives a
//! graph to completion.

mod executor;
mod pool;
mod scheduler;

pub use executor::{
    param_env_name, AttemptOutcome, AttemptStatus, ExecutionReport, ExecutionRequest,
    ProcessRunner, RetryingExecutor, ShellRunner, TaskExecutor, EXIT_MINOR_ERRORS,
    EXIT_RECOVERABLE,
};
pub use pool::WorkerPool;
pub use scheduler::{FailureKind, InstanceOutcome, RunSummary, Scheduler, SchedulerEvent};
