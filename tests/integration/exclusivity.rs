//! Exclusive-mode coordination between runs sharing a session directory.
//!
//! Each coordinator stands for a separate procflow process; they only see
//! each other through the files in the registry directory.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use procflow::exclusivity::{DirectorySessionRegistry, ExclusivityCoordinator};
use procflow::Error;

fn coordinator(dir: &TempDir, session: &str, workflow: &str) -> ExclusivityCoordinator {
    let registry = DirectorySessionRegistry::new(dir.path())
        .with_session_id(session)
        .with_max_label_len(64);
    ExclusivityCoordinator::new(
        Arc::new(registry),
        vec!["erp".to_string(), "crm".to_string()],
        workflow,
    )
}

const SHORT: Duration = Duration::from_millis(100);
const POLL: Duration = Duration::from_millis(10);

#[tokio::test]
async fn test_normal_runs_share_targets() {
    let dir = TempDir::new().unwrap();
    let first = coordinator(&dir, "s1", "nightly");
    let second = coordinator(&dir, "s2", "reports");

    first.announce(false).await.unwrap();
    second.announce(false).await.unwrap();
    second.wait_for_access(false, SHORT, POLL, false).await.unwrap();

    let seen = first.check_active_sessions(true).await.unwrap();
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().all(|s| s.workflow == "reports" && !s.is_exclusive));
}

#[tokio::test]
async fn test_exclusive_run_blocks_normal_run_until_timeout() {
    let dir = TempDir::new().unwrap();
    let holder = coordinator(&dir, "s1", "month_end");
    let waiter = coordinator(&dir, "s2", "nightly");

    holder.announce(true).await.unwrap();
    let err = waiter
        .wait_for_access(false, SHORT, POLL, false)
        .await
        .unwrap_err();

    match err {
        Error::ExclusiveModeTimeout { waited, blocking } => {
            assert!(waited >= SHORT);
            assert!(!blocking.is_empty());
            assert!(blocking.iter().all(|b| b.contains("month_end")));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_exclusive_run_waits_for_normal_run() {
    let dir = TempDir::new().unwrap();
    let normal = coordinator(&dir, "s1", "nightly");
    let exclusive = coordinator(&dir, "s2", "month_end");

    normal.announce(false).await.unwrap();
    assert!(exclusive
        .wait_for_access(true, SHORT, POLL, false)
        .await
        .is_err());
}

#[tokio::test]
async fn test_release_unblocks_waiter() {
    let dir = TempDir::new().unwrap();
    let holder = coordinator(&dir, "s1", "month_end");
    let waiter = coordinator(&dir, "s2", "nightly");

    holder.announce(true).await.unwrap();
    let release = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        holder.release().await.unwrap();
    });

    waiter
        .wait_for_access(true, Duration::from_secs(5), POLL, false)
        .await
        .unwrap();
    release.await.unwrap();
}

#[tokio::test]
async fn test_force_proceeds_despite_conflict() {
    let dir = TempDir::new().unwrap();
    let holder = coordinator(&dir, "s1", "month_end");
    let forced = coordinator(&dir, "s2", "hotfix");

    holder.announce(true).await.unwrap();
    forced
        .wait_for_access(true, Duration::from_secs(3600), POLL, true)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_own_session_never_blocks() {
    let dir = TempDir::new().unwrap();
    let run = coordinator(&dir, "s1", "month_end");

    run.announce(true).await.unwrap();
    run.wait_for_access(true, SHORT, POLL, false).await.unwrap();
}

#[tokio::test]
async fn test_waiting_exclusive_run_holds_off_later_runs() {
    let dir = TempDir::new().unwrap();
    let running = coordinator(&dir, "s1", "nightly");
    let exclusive = coordinator(&dir, "s2", "month_end");
    let latecomer = coordinator(&dir, "s3", "reports");

    running.announce(false).await.unwrap();
    exclusive.announce(true).await.unwrap();
    assert!(exclusive
        .wait_for_access(true, SHORT, POLL, false)
        .await
        .is_err());

    // A normal run arriving while the exclusive one waits must queue behind it.
    latecomer.announce(false).await.unwrap();
    let err = latecomer
        .wait_for_access(false, SHORT, POLL, false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ExclusiveModeTimeout { ref blocking, .. }
        if blocking.iter().all(|b| b.contains("month_end"))));
}
