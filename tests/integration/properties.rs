//! Property tests for the dependency graph.

use proptest::prelude::*;

use procflow::core::{TaskGraph, TaskStatus};
use procflow::{Error, Task, TaskId};

fn name(i: usize) -> String {
    format!("t{}", i)
}

/// A graph over `n` ids whose edges only point from lower to higher index.
fn forward_graph(n: usize, edges: &[(usize, usize)]) -> TaskGraph {
    let mut graph = TaskGraph::new();
    for i in 0..n {
        graph.add_task(Task::new(name(i), "erp", "RUN"));
    }
    for &(a, b) in edges {
        let (from, to) = (a.min(b) % n, a.max(b) % n);
        if from != to {
            graph.add_dependency(&TaskId::new(name(from)), &TaskId::new(name(to)));
        }
    }
    graph
}

proptest! {
    #[test]
    fn forward_edges_never_form_a_cycle(
        n in 2usize..12,
        edges in proptest::collection::vec((0usize..12, 0usize..12), 0..30),
    ) {
        prop_assert!(forward_graph(n, &edges).validate().is_ok());
    }

    #[test]
    fn back_edge_on_a_path_is_reported_as_a_closed_cycle(
        n in 2usize..12,
        edges in proptest::collection::vec((0usize..12, 0usize..12), 0..30),
    ) {
        let mut graph = forward_graph(n, &edges);
        // Chain every id so the back edge always closes a loop.
        for i in 1..n {
            graph.add_dependency(&TaskId::new(name(i - 1)), &TaskId::new(name(i)));
        }
        graph.add_dependency(&TaskId::new(name(n - 1)), &TaskId::new(name(0)));

        match graph.validate() {
            Err(Error::Cycle { path }) => {
                prop_assert!(path.len() >= 3);
                prop_assert_eq!(path.first(), path.last());
            }
            other => prop_assert!(false, "expected a cycle, got {:?}", other),
        }
    }

    #[test]
    fn id_result_is_the_and_of_its_siblings(
        outcomes in proptest::collection::vec(any::<bool>(), 1..8),
    ) {
        let mut graph = TaskGraph::new();
        let handles: Vec<_> = (0..outcomes.len())
            .map(|_| graph.add_task(Task::new("batch", "erp", "RUN")))
            .collect();
        graph.add_task(Task::new("next", "erp", "RUN").after("batch"));
        let batch = TaskId::new("batch");
        let next = TaskId::new("next");

        for &h in &handles {
            graph.mark_running(h).unwrap();
        }
        for (i, (&h, &ok)) in handles.iter().zip(&outcomes).enumerate() {
            let last = i + 1 == handles.len();
            // The successor stays hidden until the last sibling completes.
            let next_ready = graph
                .get_ready_tasks()
                .iter()
                .any(|r| graph.task(*r).map(|t| t.id == next).unwrap_or(false));
            prop_assert!(!next_ready);

            let terminal = graph.mark_complete(h, ok).unwrap();
            prop_assert_eq!(terminal, last);
        }

        let expected = outcomes.iter().all(|&ok| ok);
        prop_assert_eq!(graph.result(&batch), Some(expected));
        let expected_status = if expected { TaskStatus::Completed } else { TaskStatus::Failed };
        prop_assert_eq!(graph.status(&batch), expected_status);
        prop_assert_eq!(graph.get_ready_tasks().len(), 1);
    }
}
