//! Small helpers shared across modules.

use std::time::Duration;

use tokio::task::spawn_blocking;
use tokio::time::timeout;

use crate::{Error, Result};

/// Run synchronous file work off the async executor.
pub async fn blocking<F, T>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match spawn_blocking(work).await {
        Ok(result) => result,
        Err(join_err) => Err(Error::TaskJoin(join_err.to_string())),
    }
}

/// [`blocking`] with an upper bound on how long the caller waits.
///
/// On timeout the work is not interrupted; its result is discarded.
pub async fn blocking_with_timeout<F, T>(limit: Duration, work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    timeout(limit, blocking(work))
        .await
        .unwrap_or(Err(Error::Timeout(limit)))
}

/// Replace every character outside `[A-Za-z0-9_-]` with `_`.
///
/// Used to derive file names from workflow ids and target names.
pub fn sanitize_file_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}
