//! ExclusivityCoordinator - advisory mutual exclusion between runs that
//! share target systems.
//!
//! Each run announces a [`ContextLabel`] on every target it touches, then
//! polls the registry until no conflicting session remains. There is no
//! compare-and-swap: two exclusive runs starting at the same moment can both
//! see an empty registry and proceed.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::exclusivity::label::ContextLabel;
use crate::exclusivity::registry::SessionRegistry;

/// Another run's session, as seen through its context label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExclusivitySession {
    pub target: String,
    pub session_id: String,
    pub workflow: String,
    pub is_exclusive: bool,
}

impl std::fmt::Display for ExclusivitySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = if self.is_exclusive { "exclusive" } else { "normal" };
        write!(
            f,
            "{}@{} ({}, session {})",
            self.workflow, self.target, mode, self.session_id
        )
    }
}

/// Decide whether a run must wait given the other sessions it can see.
///
/// An exclusive run is blocked by any session. A normal run is blocked only
/// by exclusive sessions. Returns the blocking subset.
pub fn should_wait(
    sessions: &[ExclusivitySession],
    current_exclusive: bool,
) -> (bool, Vec<ExclusivitySession>) {
    let blocking: Vec<ExclusivitySession> = if current_exclusive {
        sessions.to_vec()
    } else {
        sessions.iter().filter(|s| s.is_exclusive).cloned().collect()
    };
    (!blocking.is_empty(), blocking)
}

pub struct ExclusivityCoordinator {
    registry: Arc<dyn SessionRegistry>,
    targets: Vec<String>,
    workflow: String,
}

impl ExclusivityCoordinator {
    pub fn new(registry: Arc<dyn SessionRegistry>, targets: Vec<String>, workflow: &str) -> Self {
        let mut targets = targets;
        targets.sort();
        targets.dedup();
        Self {
            registry,
            targets,
            workflow: workflow.to_string(),
        }
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    /// Publish this run's label on every target.
    pub async fn announce(&self, is_exclusive: bool) -> Result<()> {
        let label = ContextLabel::new(is_exclusive, &self.workflow)
            .to_label(self.registry.max_label_length());
        for target in &self.targets {
            self.registry.set_context_label(target, &label).await?;
        }
        info!(label = %label, targets = self.targets.len(), "announced run");
        Ok(())
    }

    /// Mark this run's sessions as still alive.
    pub async fn refresh(&self) -> Result<()> {
        for target in &self.targets {
            self.registry.refresh(target).await?;
        }
        Ok(())
    }

    /// Withdraw this run's sessions.
    pub async fn release(&self) -> Result<()> {
        for target in &self.targets {
            self.registry.release(target).await?;
        }
        Ok(())
    }

    /// Sessions on any target that carry a parseable context label.
    ///
    /// Sessions with foreign labels are dropped, as is this run's own
    /// session when `exclude_own` is set.
    pub async fn check_active_sessions(&self, exclude_own: bool) -> Result<Vec<ExclusivitySession>> {
        let mut active = Vec::new();
        for target in &self.targets {
            let own = if exclude_own {
                self.registry.get_own_session_id(target).await?
            } else {
                None
            };
            for session in self.registry.list_sessions(target).await? {
                if own.as_deref() == Some(session.session_id.as_str()) {
                    continue;
                }
                if let Some(label) = session.labels.iter().find_map(|l| ContextLabel::parse(l)) {
                    active.push(ExclusivitySession {
                        target: target.clone(),
                        session_id: session.session_id.clone(),
                        is_exclusive: label.is_exclusive(),
                        workflow: label.workflow,
                    });
                }
            }
        }
        debug!(count = active.len(), "active sessions");
        Ok(active)
    }

    /// Block until no conflicting session remains.
    ///
    /// With `force`, a blocked run logs the conflict and proceeds at once.
    /// Call [`announce`](Self::announce) first so runs arriving during the
    /// wait can see this one.
    ///
    /// # Errors
    /// Returns [`Error::ExclusiveModeTimeout`] naming the blocking sessions
    /// once `timeout` has elapsed.
    pub async fn wait_for_access(
        &self,
        is_exclusive: bool,
        timeout: Duration,
        interval: Duration,
        force: bool,
    ) -> Result<()> {
        let started = Instant::now();
        loop {
            let sessions = self.check_active_sessions(true).await?;
            let (blocked, blocking) = should_wait(&sessions, is_exclusive);
            if !blocked {
                return Ok(());
            }

            let names: Vec<String> = blocking.iter().map(|s| s.to_string()).collect();
            if force {
                warn!(blocking = ?names, "exclusivity conflict ignored, proceeding by force");
                return Ok(());
            }

            let waited = started.elapsed();
            if waited >= timeout {
                return Err(Error::ExclusiveModeTimeout {
                    waited,
                    blocking: names,
                });
            }

            info!(
                blocking = ?names,
                waited_secs = waited.as_secs(),
                "waiting for conflicting sessions to finish"
            );
            let remaining = timeout.saturating_sub(waited);
            tokio::time::sleep(interval.min(remaining)).await;
        }
    }
}

impl std::fmt::Debug for ExclusivityCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExclusivityCoordinator")
            .field("targets", &self.targets)
            .field("workflow", &self.workflow)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exclusivity::registry::InMemorySessionRegistry;

    fn session(id: &str, exclusive: bool) -> ExclusivitySession {
        ExclusivitySession {
            target: "erp".to_string(),
            session_id: id.to_string(),
            workflow: format!("wf_{}", id),
            is_exclusive: exclusive,
        }
    }

    fn coordinator(registry: Arc<InMemorySessionRegistry>) -> ExclusivityCoordinator {
        ExclusivityCoordinator::new(registry, vec!["erp".to_string()], "nightly")
    }

    #[test]
    fn test_should_wait_truth_table() {
        assert_eq!(should_wait(&[], true), (false, vec![]));
        assert_eq!(should_wait(&[], false), (false, vec![]));

        let all = vec![session("a", false), session("b", true)];
        assert_eq!(should_wait(&all, true), (true, all.clone()));

        let normal_only = vec![session("a", false), session("c", false)];
        assert_eq!(should_wait(&normal_only, false), (false, vec![]));

        assert_eq!(should_wait(&all, false), (true, vec![session("b", true)]));
    }

    #[tokio::test]
    async fn test_check_active_sessions_filters_labels_and_self() {
        let registry = Arc::new(InMemorySessionRegistry::new("me"));
        registry.insert("erp", "other", &["EXCLUSIVE_month_end"]);
        registry.insert("erp", "human", &["interactive"]);
        let coordinator = coordinator(Arc::clone(&registry));
        coordinator.announce(false).await.unwrap();

        let sessions = coordinator.check_active_sessions(true).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].workflow, "month_end");
        assert!(sessions[0].is_exclusive);

        let with_own = coordinator.check_active_sessions(false).await.unwrap();
        assert_eq!(with_own.len(), 2);
    }

    #[tokio::test]
    async fn test_announce_truncates_to_registry_limit() {
        let registry = Arc::new(InMemorySessionRegistry::new("me").with_max_label_len(10));
        let coordinator = ExclusivityCoordinator::new(
            Arc::clone(&registry) as Arc<dyn SessionRegistry>,
            vec!["erp".to_string()],
            "very_long_workflow",
        );
        coordinator.announce(false).await.unwrap();

        let sessions = registry.list_sessions("erp").await.unwrap();
        assert_eq!(sessions[0].labels, vec!["NORMAL_ver".to_string()]);
    }

    #[tokio::test]
    async fn test_wait_for_access_proceeds_when_clear() {
        let registry = Arc::new(InMemorySessionRegistry::new("me"));
        registry.insert("erp", "other", &["NORMAL_daily"]);
        let coordinator = coordinator(registry);

        coordinator
            .wait_for_access(false, Duration::from_secs(5), Duration::from_secs(1), false)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_access_times_out_naming_blockers() {
        let registry = Arc::new(InMemorySessionRegistry::new("me"));
        registry.insert("erp", "other", &["EXCLUSIVE_month_end"]);
        let coordinator = coordinator(registry);

        let err = coordinator
            .wait_for_access(false, Duration::from_secs(60), Duration::from_secs(10), false)
            .await
            .unwrap_err();
        match err {
            Error::ExclusiveModeTimeout { waited, blocking } => {
                assert!(waited >= Duration::from_secs(60));
                assert_eq!(blocking.len(), 1);
                assert!(blocking[0].contains("month_end"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_access_unblocks_when_session_leaves() {
        let registry = Arc::new(InMemorySessionRegistry::new("me"));
        registry.insert("erp", "other", &["NORMAL_daily"]);
        let coordinator = coordinator(Arc::clone(&registry));

        let leaver = Arc::clone(&registry);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(25)).await;
            leaver.remove("erp", "other");
        });

        let started = Instant::now();
        coordinator
            .wait_for_access(true, Duration::from_secs(300), Duration::from_secs(10), false)
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(25));
    }

    #[tokio::test]
    async fn test_force_bypasses_conflict() {
        let registry = Arc::new(InMemorySessionRegistry::new("me"));
        registry.insert("erp", "other", &["EXCLUSIVE_month_end"]);
        let coordinator = coordinator(registry);

        coordinator
            .wait_for_access(true, Duration::ZERO, Duration::from_secs(1), true)
            .await
            .unwrap();
    }
}
