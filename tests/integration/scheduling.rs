//! End-to-end scheduling behaviour.
//!
//! These tests drive the scheduler over graphs built from inline taskfiles
//! with a scripted executor, and check dispatch order, concurrency limits
//! and failure propagation.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use procflow::config::OptimizerConfig;
use procflow::core::{TaskGraph, TaskStatus};
use procflow::optimizer::{task_signature, ContentionOptimizer, InMemoryDurationHistory};
use procflow::orchestration::{FailureKind, Scheduler, SchedulerEvent};
use procflow::{Error, Task, TaskId};

use crate::fixtures::{graph_from_toml, shared, ScriptedExecutor, Trace, DIAMOND_CHAIN};

fn tid(s: &str) -> TaskId {
    TaskId::new(s)
}

/// A and B run together, C waits for both, D waits for C.
#[tokio::test(start_paused = true)]
async fn test_diamond_chain_runs_in_dependency_order() {
    let executor = shared(ScriptedExecutor::new());
    let mut scheduler = Scheduler::new(graph_from_toml(DIAMOND_CHAIN), executor.clone(), 4);

    let summary = scheduler.run().await.unwrap();

    assert!(summary.is_success());
    assert_eq!(summary.outcome_vector(), vec![true, true, true, true]);
    let mut first_wave = executor.started()[..2].to_vec();
    first_wave.sort();
    assert_eq!(first_wave, vec!["a".to_string(), "b".to_string()]);
    executor.assert_overlapped("a", "b");
    executor.assert_ordered("a", "c");
    executor.assert_ordered("b", "c");
    executor.assert_ordered("c", "d");
    assert_eq!(executor.started()[2..], ["c".to_string(), "d".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_worker_limit_is_respected() {
    let mut contents = String::new();
    for i in 0..8 {
        contents.push_str(&format!(
            "[[task]]\nid = \"t{i}\"\ntarget = \"erp\"\noperation = \"op{i}\"\n\n"
        ));
    }
    let executor = shared(ScriptedExecutor::new());
    let mut scheduler = Scheduler::new(graph_from_toml(&contents), executor.clone(), 3);

    let summary = scheduler.run().await.unwrap();

    assert_eq!(summary.executed(), 8);
    assert_eq!(executor.peak_concurrency(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_failure_blocks_dependents_transitively() {
    let executor = shared(ScriptedExecutor::new().failing("b"));
    let mut scheduler = Scheduler::new(graph_from_toml(DIAMOND_CHAIN), executor.clone(), 4);

    let summary = scheduler.run().await.unwrap();

    assert!(!summary.is_success());
    assert!(summary.complete);
    assert_eq!(summary.results[&tid("A")], true);
    assert_eq!(summary.results[&tid("B")], false);
    assert_eq!(summary.results[&tid("C")], false);
    assert_eq!(summary.results[&tid("D")], false);

    // Blocked tasks never reach the executor.
    assert!(!executor.started().contains(&"c".to_string()));
    assert!(!executor.started().contains(&"d".to_string()));

    let c = summary
        .outcomes
        .iter()
        .find(|o| o.task_id == tid("C"))
        .unwrap();
    assert_eq!(c.attempts, 0);
    assert_eq!(c.failure, Some(FailureKind::PredecessorFailed(vec![tid("B")])));
}

#[tokio::test(start_paused = true)]
async fn test_tolerant_task_runs_after_failed_predecessor() {
    let graph = graph_from_toml(
        r#"
        [[task]]
        id = "extract"
        target = "erp"
        operation = "extract"

        [[task]]
        id = "notify"
        target = "mail"
        operation = "notify"
        after = ["extract"]
        require_predecessor_success = false
        "#,
    );
    let executor = shared(ScriptedExecutor::new().failing("extract"));
    let mut scheduler = Scheduler::new(graph, executor.clone(), 2);

    let summary = scheduler.run().await.unwrap();

    assert_eq!(summary.outcome_vector(), vec![false, true]);
    executor.assert_ordered("extract", "notify");
}

#[tokio::test(start_paused = true)]
async fn test_siblings_form_a_barrier() {
    let graph = graph_from_toml(
        r#"
        mode = "sequence"

        [[task]]
        id = "extract"
        target = "erp"
        operation = "extract"
        matrix = { region = ["eu", "us", "apac"] }

        [[task]]
        barrier = true

        [[task]]
        id = "report"
        target = "erp"
        operation = "report"
        "#,
    );
    assert_eq!(graph.instances_of(&tid("extract")).len(), 3);

    let executor = shared(ScriptedExecutor::new());
    let mut scheduler = Scheduler::new(graph, executor.clone(), 4);
    let summary = scheduler.run().await.unwrap();

    assert!(summary.is_success());
    assert_eq!(summary.executed(), 4);
    // The three siblings share an operation; report starts after the last one ends.
    let trace = executor.trace();
    let last_extract_end = trace
        .iter()
        .rposition(|t| *t == Trace::End("extract".to_string()))
        .unwrap();
    let report_start = trace
        .iter()
        .position(|t| *t == Trace::Start("report".to_string()))
        .unwrap();
    assert!(last_extract_end < report_start);
    assert_eq!(executor.peak_concurrency(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_one_failed_sibling_fails_the_id() {
    let mut graph = TaskGraph::new();
    graph.add_task(Task::new("load", "erp", "load_eu"));
    graph.add_task(Task::new("load", "erp", "load_us"));
    graph.add_task(Task::new("post", "erp", "post").after("load"));

    let executor = shared(ScriptedExecutor::new().failing("load_us"));
    let mut scheduler = Scheduler::new(graph, executor.clone(), 4);
    let summary = scheduler.run().await.unwrap();

    assert_eq!(summary.results[&tid("load")], false);
    assert_eq!(summary.results[&tid("post")], false);
    assert_eq!(summary.executed(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_is_reported_as_timeout() {
    let executor = shared(ScriptedExecutor::new().timing_out("a"));
    let mut scheduler = Scheduler::new(graph_from_toml(DIAMOND_CHAIN), executor, 4);

    let summary = scheduler.run().await.unwrap();

    let a = summary
        .outcomes
        .iter()
        .find(|o| o.task_id == tid("A"))
        .unwrap();
    assert_eq!(a.failure, Some(FailureKind::Timeout));
}

#[tokio::test]
async fn test_cycle_is_rejected_before_dispatch() {
    let mut graph = TaskGraph::new();
    graph.add_task(Task::new("a", "erp", "a").after("c"));
    graph.add_task(Task::new("b", "erp", "b").after("a"));
    graph.add_task(Task::new("c", "erp", "c").after("b"));

    let executor = shared(ScriptedExecutor::new());
    let mut scheduler = Scheduler::new(graph, executor.clone(), 4);

    match scheduler.run().await {
        Err(Error::Cycle { path }) => {
            assert!(path.len() >= 2);
            assert_eq!(path.first(), path.last());
        }
        other => panic!("expected a cycle error, got {:?}", other.map(|s| s.outcomes)),
    }
    assert!(executor.trace().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_undefined_predecessor_leaves_run_incomplete() {
    let graph = graph_from_toml(
        r#"
        [[task]]
        id = "a"
        target = "erp"
        operation = "a"

        [[task]]
        id = "b"
        target = "erp"
        operation = "b"
        after = ["missing"]
        "#,
    );
    let executor = shared(ScriptedExecutor::new());
    let mut scheduler = Scheduler::new(graph, executor.clone(), 4);

    let summary = scheduler.run().await.unwrap();

    assert!(!summary.complete);
    assert!(!summary.is_success());
    assert_eq!(executor.started(), vec!["a".to_string()]);
    assert_eq!(scheduler.graph().status(&tid("b")), TaskStatus::Pending);
}

#[tokio::test(start_paused = true)]
async fn test_events_cover_the_run() {
    let (tx, mut rx) = mpsc::channel(64);
    let executor = shared(ScriptedExecutor::new().failing("d"));
    let mut scheduler =
        Scheduler::new(graph_from_toml(DIAMOND_CHAIN), executor, 4).with_events(tx);

    scheduler.run().await.unwrap();
    drop(scheduler);

    let mut started = 0;
    let mut completed = 0;
    let mut failed = Vec::new();
    let mut all_done = false;
    while let Some(event) = rx.recv().await {
        match event {
            SchedulerEvent::TaskStarted { .. } => started += 1,
            SchedulerEvent::TaskCompleted { .. } => completed += 1,
            SchedulerEvent::TaskFailed { task_id, .. } => failed.push(task_id),
            SchedulerEvent::AllTasksComplete => all_done = true,
        }
    }
    assert_eq!(started, 4);
    assert_eq!(completed, 3);
    assert_eq!(failed, vec![tid("D")]);
    assert!(all_done);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_stops_new_dispatches() {
    let executor = shared(
        ScriptedExecutor::new()
            .with_duration("a", Duration::from_secs(10))
            .with_duration("b", Duration::from_secs(10)),
    );
    let token = CancellationToken::new();
    let mut scheduler = Scheduler::new(graph_from_toml(DIAMOND_CHAIN), executor.clone(), 4)
        .with_cancellation(token.clone());

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();
    });
    let summary = scheduler.run().await.unwrap();
    canceller.await.unwrap();

    assert!(summary.cancelled);
    assert!(!summary.complete);
    // In-flight work finished; nothing new was started.
    assert_eq!(summary.executed(), 2);
    assert_eq!(executor.started().len(), 2);
}

/// Entity x region loads where `gl` and `ap` dominate the recorded history.
fn contended_graph(history: &InMemoryDurationHistory) -> TaskGraph {
    let mut graph = TaskGraph::new();
    let entities = [
        ("gl", 900.0),
        ("ap", 600.0),
        ("ar", 10.0),
        ("fa", 11.0),
        ("hr", 12.0),
        ("po", 10.0),
        ("so", 11.0),
        ("wm", 12.0),
        ("cm", 10.0),
        ("pm", 11.0),
        ("qm", 12.0),
        ("tx", 10.0),
    ];
    for (entity, secs) in entities {
        for region in ["eu", "us"] {
            let id = format!("{}_{}", entity, region);
            let task = Task::new(id.as_str(), "erp", &id)
                .with_param("entity", entity)
                .with_param("region", region);
            history.record(&task_signature(&task), Duration::from_secs_f64(secs));
            graph.add_task(task);
        }
    }
    graph
}

#[tokio::test(start_paused = true)]
async fn test_failed_chain_head_does_not_block_chain_successor() {
    let history = Arc::new(InMemoryDurationHistory::new());
    let mut graph = contended_graph(&history);
    let optimizer = ContentionOptimizer::new(
        OptimizerConfig {
            enabled: true,
            min_samples: 1,
            ..Default::default()
        },
        history,
    );
    let plan = optimizer.apply(&mut graph);
    assert!(plan
        .edges_added
        .contains(&(tid("gl_eu"), tid("ap_eu"))));

    let executor = shared(ScriptedExecutor::new().failing("gl_eu"));
    let mut scheduler = Scheduler::new(graph, executor.clone(), 32);
    let summary = scheduler.run().await.unwrap();

    // The chain still serialises the two heavy loads.
    executor.assert_ordered("gl_eu", "ap_eu");
    let ap_eu = summary
        .outcomes
        .iter()
        .find(|o| o.task_id == tid("ap_eu"))
        .unwrap();
    assert!(ap_eu.success);
    assert_eq!(ap_eu.failure, None);
    assert_eq!(summary.failed(), 1);
    assert!(summary.complete);
}
