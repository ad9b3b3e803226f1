//! Task execution against target systems.
//!
//! A [`ProcessRunner`] makes one attempt at running an operation. The
//! [`RetryingExecutor`] wraps a runner with the retry rules: recoverable
//! failures are retried, timeouts never are, and "completed with minor
//! errors" may count as success.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::core::task::Task;

/// Exit code a process uses to report success with minor errors.
pub const EXIT_MINOR_ERRORS: i32 = 2;
/// Exit code a process uses to report a transient failure (EX_TEMPFAIL).
pub const EXIT_RECOVERABLE: i32 = 75;

const DIAGNOSTIC_LIMIT: usize = 512;

/// Everything needed to run one task instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub target: String,
    pub operation: String,
    pub parameters: IndexMap<String, String>,
    pub timeout: Option<Duration>,
    /// Abort the remote operation on timeout instead of leaving it running.
    pub cancel_at_timeout: bool,
    /// Extra attempts after a recoverable failure.
    pub retries: u32,
    pub succeed_on_minor_errors: bool,
}

impl ExecutionRequest {
    pub fn from_task(task: &Task) -> Self {
        Self {
            target: task.target.clone(),
            operation: task.operation.clone(),
            parameters: task.parameters.clone(),
            timeout: task.policy.timeout,
            cancel_at_timeout: task.policy.cancel_at_timeout,
            retries: task.policy.retries,
            succeed_on_minor_errors: task.policy.succeed_on_minor_errors,
        }
    }
}

/// How a single attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStatus {
    Success,
    /// The operation finished but reported minor errors.
    MinorErrors,
    Failed { recoverable: bool },
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptOutcome {
    pub status: AttemptStatus,
    pub status_code: Option<i32>,
    /// Pointer to what went wrong, e.g. the tail of stderr.
    pub diagnostic: Option<String>,
}

impl AttemptOutcome {
    pub fn new(status: AttemptStatus) -> Self {
        Self {
            status,
            status_code: None,
            diagnostic: None,
        }
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.status_code = Some(code);
        self
    }

    pub fn with_diagnostic(mut self, diagnostic: impl Into<String>) -> Self {
        self.diagnostic = Some(diagnostic.into());
        self
    }
}

/// Final result of executing a request, retries included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub success: bool,
    pub status_code: Option<i32>,
    pub diagnostic: Option<String>,
    pub attempts: u32,
    /// Status of the last attempt.
    pub status: AttemptStatus,
}

impl ExecutionReport {
    pub fn timed_out(&self) -> bool {
        self.status == AttemptStatus::TimedOut
    }
}

/// Runs task instances to completion.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, request: &ExecutionRequest) -> ExecutionReport;
}

/// Makes a single attempt at an operation.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run_once(&self, request: &ExecutionRequest) -> AttemptOutcome;
}

/// [`TaskExecutor`] that applies the retry rules on top of a runner.
#[derive(Debug, Clone)]
pub struct RetryingExecutor<R> {
    runner: R,
    retry_delay: Duration,
}

impl<R: ProcessRunner> RetryingExecutor<R> {
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            retry_delay: Duration::from_secs(1),
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }
}

#[async_trait]
impl<R: ProcessRunner> TaskExecutor for RetryingExecutor<R> {
    async fn execute(&self, request: &ExecutionRequest) -> ExecutionReport {
        let max_attempts = request.retries.saturating_add(1);
        let mut attempts = 0;
        loop {
            attempts += 1;
            let outcome = self.runner.run_once(request).await;
            let success = match outcome.status {
                AttemptStatus::Success => true,
                AttemptStatus::MinorErrors => request.succeed_on_minor_errors,
                AttemptStatus::TimedOut | AttemptStatus::Failed { recoverable: false } => false,
                AttemptStatus::Failed { recoverable: true } => {
                    if attempts < max_attempts {
                        warn!(
                            target_system = %request.target,
                            operation = %request.operation,
                            attempt = attempts,
                            max_attempts,
                            "recoverable failure, retrying"
                        );
                        tokio::time::sleep(self.retry_delay).await;
                        continue;
                    }
                    false
                }
            };
            return ExecutionReport {
                success,
                status_code: outcome.status_code,
                diagnostic: outcome.diagnostic,
                attempts,
                status: outcome.status,
            };
        }
    }
}

/// Runs operations as shell commands on the local host.
///
/// The operation string goes to `sh -c`. The target is exported as
/// `PROCFLOW_TARGET` and each parameter as `PROCFLOW_PARAM_<KEY>`.
/// Exit code 0 is success, 2 is minor errors, 75 is a recoverable failure,
/// anything else is a hard failure.
#[derive(Debug, Clone, Default)]
pub struct ShellRunner {
    working_dir: Option<PathBuf>,
}

impl ShellRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Environment variable name for a parameter key.
pub fn param_env_name(key: &str) -> String {
    let key: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("PROCFLOW_PARAM_{}", key)
}

fn status_for_exit(code: Option<i32>) -> AttemptStatus {
    match code {
        Some(0) => AttemptStatus::Success,
        Some(EXIT_MINOR_ERRORS) => AttemptStatus::MinorErrors,
        Some(EXIT_RECOVERABLE) => AttemptStatus::Failed { recoverable: true },
        _ => AttemptStatus::Failed { recoverable: false },
    }
}

fn tail(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    let start = trimmed
        .char_indices()
        .rev()
        .nth(DIAGNOSTIC_LIMIT - 1)
        .map(|(i, _)| i)
        .unwrap_or(0);
    Some(trimmed[start..].to_string())
}

#[async_trait]
impl ProcessRunner for ShellRunner {
    async fn run_once(&self, request: &ExecutionRequest) -> AttemptOutcome {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&request.operation);
        cmd.env("PROCFLOW_TARGET", &request.target);
        for (key, value) in &request.parameters {
            cmd.env(param_env_name(key), value);
        }
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // Dropping the wait future on timeout kills the child only when asked to.
        cmd.kill_on_drop(request.cancel_at_timeout);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return AttemptOutcome::new(AttemptStatus::Failed { recoverable: false })
                    .with_diagnostic(format!("failed to spawn: {}", e));
            }
        };

        let waited = match request.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(result) => result,
                Err(_) => {
                    let action = if request.cancel_at_timeout {
                        "killed"
                    } else {
                        "left running"
                    };
                    warn!(
                        operation = %request.operation,
                        timeout = ?limit,
                        action,
                        "operation timed out"
                    );
                    return AttemptOutcome::new(AttemptStatus::TimedOut)
                        .with_diagnostic(format!("timed out after {:?}, {}", limit, action));
                }
            },
            None => child.wait_with_output().await,
        };

        match waited {
            Ok(output) => {
                let code = output.status.code();
                debug!(operation = %request.operation, ?code, "process exited");
                let mut outcome = AttemptOutcome::new(status_for_exit(code));
                outcome.status_code = code;
                outcome.diagnostic = tail(&String::from_utf8_lossy(&output.stderr));
                outcome
            }
            Err(e) => AttemptOutcome::new(AttemptStatus::Failed { recoverable: false })
                .with_diagnostic(format!("failed to wait for process: {}", e)),
        }
    }
}
