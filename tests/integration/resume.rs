//! Checkpoint and resume across runs.
//!
//! A first run fails part-way and leaves its checkpoint on disk; a second
//! run resumes from it and must only execute what was not done.

use std::collections::BTreeSet;
use std::time::Duration;

use procflow::checkpoint::{
    checkpoint_path, find_checkpoint_for_taskfile, CheckpointManager, CheckpointPersistence,
    FileCheckpointPersistence, TaskRecord,
};
use procflow::orchestration::{FailureKind, Scheduler};
use procflow::{Error, TaskId};

use crate::fixtures::{shared, ScriptedExecutor, Workspace, DIAMOND_CHAIN};

fn tid(s: &str) -> TaskId {
    TaskId::new(s)
}

/// Run the diamond taskfile once with `b` failing; returns the workspace.
async fn failed_first_run() -> Workspace {
    let ws = Workspace::with_taskfile(DIAMOND_CHAIN);
    let taskfile = ws.load();
    let graph = taskfile.build_graph().unwrap();
    let manager = CheckpointManager::new(
        &ws.checkpoint_dir,
        &taskfile.path,
        &taskfile.workflow,
        &graph.defined_ids(),
        Duration::ZERO,
        true,
    )
    .unwrap();

    let executor = shared(ScriptedExecutor::new().failing("b"));
    let mut scheduler = Scheduler::new(graph, executor, 4).with_checkpoint(manager);
    let summary = scheduler.run().await.unwrap();
    assert!(!summary.is_success());
    ws
}

#[tokio::test(start_paused = true)]
async fn test_failed_run_keeps_checkpoint() {
    let ws = failed_first_run().await;

    let path = checkpoint_path(&ws.checkpoint_dir, "diamond");
    assert!(path.exists());
    assert_eq!(
        find_checkpoint_for_taskfile(&ws.checkpoint_dir, &ws.taskfile),
        Some(path.clone())
    );

    let checkpoint = FileCheckpointPersistence.load(&path).unwrap().unwrap();
    assert!(matches!(
        checkpoint.record(&tid("A")),
        Some(TaskRecord::Completed { .. })
    ));
    assert_eq!(
        checkpoint.failed_tasks(),
        ["B", "C", "D"].iter().map(|s| tid(s)).collect::<BTreeSet<_>>()
    );
    assert_eq!(checkpoint.progress_percentage(), 25.0);
}

#[tokio::test(start_paused = true)]
async fn test_resume_reruns_only_unfinished_work() {
    let ws = failed_first_run().await;
    let path = checkpoint_path(&ws.checkpoint_dir, "diamond");
    let mut checkpoint = FileCheckpointPersistence.load(&path).unwrap().unwrap();

    let taskfile = ws.load();
    let graph = taskfile.build_graph().unwrap();
    checkpoint
        .validate_against_taskfile(&taskfile.path, true)
        .unwrap();

    let plan = checkpoint.get_tasks_for_resume(&graph.safe_retry_by_id());
    let to_run = plan.into_runnable(false).unwrap();
    checkpoint.prepare_resume(&to_run, &[]).unwrap();

    let manager = CheckpointManager::with_persistence(
        &ws.checkpoint_dir,
        checkpoint.clone(),
        Box::new(FileCheckpointPersistence),
        Duration::ZERO,
        true,
    )
    .unwrap();

    let executor = shared(ScriptedExecutor::new());
    let mut scheduler = Scheduler::new(graph, executor.clone(), 4);
    let restored = scheduler
        .resume_from_checkpoint(&checkpoint, &to_run)
        .unwrap();
    assert_eq!(restored.restored, vec![tid("A")]);

    let mut scheduler = scheduler.with_checkpoint(manager);
    let summary = scheduler.run().await.unwrap();

    assert!(summary.is_success());
    assert_eq!(executor.started(), vec!["b", "c", "d"]);
    assert_eq!(summary.results.len(), 4);
    // A clean finish removes the checkpoint.
    assert!(!path.exists());
}

#[tokio::test(start_paused = true)]
async fn test_resume_from_point_skips_earlier_failures() {
    let ws = failed_first_run().await;
    let path = checkpoint_path(&ws.checkpoint_dir, "diamond");
    let mut checkpoint = FileCheckpointPersistence.load(&path).unwrap().unwrap();

    let taskfile = ws.load();
    let graph = taskfile.build_graph().unwrap();
    let plan = checkpoint
        .get_resume_from_task(&tid("D"), &graph.defined_ids())
        .unwrap();
    assert_eq!(plan.to_run, vec![tid("D")]);
    assert_eq!(plan.to_skip, vec![tid("B"), tid("C")]);

    let to_run: BTreeSet<TaskId> = plan.to_run.into_iter().collect();
    checkpoint.prepare_resume(&to_run, &plan.to_skip).unwrap();
    assert_eq!(checkpoint.skipped_tasks().len(), 2);

    let executor = shared(ScriptedExecutor::new());
    let mut scheduler = Scheduler::new(graph, executor.clone(), 4);
    scheduler
        .resume_from_checkpoint(&checkpoint, &to_run)
        .unwrap();
    let summary = scheduler.run().await.unwrap();

    // C was skipped, so D has no known predecessor outcome and is blocked.
    assert!(executor.started().is_empty());
    assert_eq!(
        summary.outcomes[0].failure,
        Some(FailureKind::PredecessorUnknown(vec![tid("C")]))
    );
}

#[tokio::test(start_paused = true)]
async fn test_interrupted_unsafe_task_needs_decision() {
    let ws = Workspace::with_taskfile(DIAMOND_CHAIN);
    let taskfile = ws.load();
    let graph = taskfile.build_graph().unwrap();
    let mut manager = CheckpointManager::new(
        &ws.checkpoint_dir,
        &taskfile.path,
        &taskfile.workflow,
        &graph.defined_ids(),
        Duration::ZERO,
        true,
    )
    .unwrap();
    // Simulate a crash while A was running.
    manager.mark_running(&tid("A")).unwrap();
    drop(manager);

    let path = checkpoint_path(&ws.checkpoint_dir, "diamond");
    let checkpoint = FileCheckpointPersistence.load(&path).unwrap().unwrap();
    let plan = checkpoint.get_tasks_for_resume(&graph.safe_retry_by_id());

    match plan.clone().into_runnable(false) {
        Err(Error::ResumeConflict { tasks, .. }) => assert_eq!(tasks, vec!["A".to_string()]),
        other => panic!("expected a resume conflict, got {:?}", other),
    }
    assert!(plan.into_runnable(true).unwrap().contains(&tid("A")));
}

#[tokio::test]
async fn test_strict_resume_rejects_changed_taskfile() {
    let ws = failed_first_run().await;
    let path = checkpoint_path(&ws.checkpoint_dir, "diamond");
    let checkpoint = FileCheckpointPersistence.load(&path).unwrap().unwrap();

    std::fs::write(&ws.taskfile, format!("{}\n# edited\n", DIAMOND_CHAIN)).unwrap();

    assert!(matches!(
        checkpoint.validate_against_taskfile(&ws.taskfile, true),
        Err(Error::CheckpointInvalidated { .. })
    ));
    assert!(checkpoint
        .validate_against_taskfile(&ws.taskfile, false)
        .is_ok());
}
