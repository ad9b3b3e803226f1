//! Worker pool for concurrent task instances.
//!
//! The `WorkerPool` bounds how many futures run at once and hands back
//! their results as they finish. It is owned by the scheduler's single
//! coordinating task.

use crate::error::{Error, Result};
use std::future::Future;
use tokio::task::{Id, JoinSet};

/// A bounded set of in-flight futures.
///
/// # Example
///
/// ```ignore
/// use procflow::orchestration::WorkerPool;
///
/// let mut pool: WorkerPool<u32> = WorkerPool::new(3);
/// assert!(pool.has_capacity());
/// let id = pool.spawn(async { 7 })?;
/// let (finished, result) = pool.join_next().await.unwrap();
/// assert_eq!(finished, id);
/// assert_eq!(result?, 7);
/// ```
pub struct WorkerPool<T> {
    /// Futures currently running.
    tasks: JoinSet<T>,
    /// Maximum number of futures allowed to run simultaneously.
    max_concurrent: usize,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Create a new pool with the given capacity (at least 1).
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            tasks: JoinSet::new(),
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Start a future on the runtime.
    ///
    /// # Returns
    ///
    /// The runtime id of the spawned future, reported again by
    /// [`join_next`](Self::join_next) when it finishes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolFull`] if the pool is at capacity.
    pub fn spawn<F>(&mut self, future: F) -> Result<Id>
    where
        F: Future<Output = T> + Send + 'static,
    {
        if !self.has_capacity() {
            return Err(Error::PoolFull {
                max: self.max_concurrent,
            });
        }
        Ok(self.tasks.spawn(future).id())
    }

    /// Wait for the next future to finish.
    ///
    /// Returns `None` when the pool is empty. A panicked or aborted future
    /// surfaces as [`Error::TaskJoin`] next to its id.
    pub async fn join_next(&mut self) -> Option<(Id, Result<T>)> {
        let joined = self.tasks.join_next_with_id().await?;
        Some(match joined {
            Ok((id, value)) => (id, Ok(value)),
            Err(e) => (e.id(), Err(Error::TaskJoin(e.to_string()))),
        })
    }

    /// Abort every running future.
    pub fn abort_all(&mut self) {
        self.tasks.abort_all();
    }

    /// Get the number of running futures.
    pub fn active_count(&self) -> usize {
        self.tasks.len()
    }

    /// Get how many more futures may be started now.
    pub fn available(&self) -> usize {
        self.max_concurrent.saturating_sub(self.active_count())
    }

    /// Check if the pool has capacity for more work.
    pub fn has_capacity(&self) -> bool {
        self.active_count() < self.max_concurrent
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Get the maximum concurrent futures allowed.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}
