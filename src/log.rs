//! Structured logging for procflow.
//!
//! Log levels:
//! - ERROR: the run cannot proceed, or ended with unsatisfiable tasks
//! - WARN: recoverable surprises (retries, label truncation, checkpoint writes that failed)
//! - INFO: run milestones (start, task finished, waiting for exclusive access)
//! - DEBUG: per-instance dispatch and completion traces
//! - TRACE: unused by procflow itself; useful for dependencies
//!
//! Level priority: `--debug` flag, then the `PROCFLOW_LOG` env filter
//! (e.g. `procflow=debug`), then `info`. Logs go to stderr so stdout stays
//! free for command output.

use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable holding an `EnvFilter` directive.
pub const LOG_ENV: &str = "PROCFLOW_LOG";

/// Build the filter for the given debug setting and environment value.
pub fn filter_for(debug: bool, env_value: Option<&str>) -> EnvFilter {
    if debug {
        return EnvFilter::new("debug");
    }
    env_value
        .and_then(|directive| EnvFilter::try_new(directive).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Install the global subscriber.
///
/// Calling it again is harmless; only the first call takes effect.
pub fn init(debug: bool) {
    let env_value = std::env::var(LOG_ENV).ok();
    let _ = fmt()
        .with_env_filter(filter_for(debug, env_value.as_deref()))
        .with_target(true)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .try_init();
}
