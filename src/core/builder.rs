//! Graph builders.
//!
//! Two ways to turn parsed task definitions into a [`TaskGraph`]:
//!
//! - **sequence mode**: definitions interleaved with barrier markers; every
//!   task in wave N depends on every task in wave N-1.
//! - **explicit mode**: definitions already carry predecessor ids.
//!
//! Both expand a definition's parameter matrix into sibling instances that
//! share one logical id.

use crate::core::dag::TaskGraph;
use crate::core::task::{IdAllocator, Task, TaskId, TaskPolicy};
use crate::error::{Error, Result};
use indexmap::IndexMap;
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, warn};

const GENERATED_ID_PREFIX: &str = "task";

/// A parsed task definition before expansion.
#[derive(Debug, Clone, Default)]
pub struct TaskDefinition {
    /// Explicit id; generated when absent.
    pub id: Option<TaskId>,
    pub target: String,
    pub operation: String,
    /// Parameters shared by every expanded instance.
    pub parameters: IndexMap<String, String>,
    /// Parameter axes expanded as a cartesian product into sibling instances.
    pub matrix: IndexMap<String, Vec<String>>,
    pub predecessors: BTreeSet<TaskId>,
    pub policy: TaskPolicy,
    pub stage: Option<String>,
}

impl TaskDefinition {
    pub fn new(target: &str, operation: &str) -> Self {
        Self {
            target: target.to_string(),
            operation: operation.to_string(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(TaskId::new(id));
        self
    }

    pub fn with_param(mut self, key: &str, value: &str) -> Self {
        self.parameters.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_axis(mut self, key: &str, values: &[&str]) -> Self {
        self.matrix.insert(
            key.to_string(),
            values.iter().map(|v| v.to_string()).collect(),
        );
        self
    }

    pub fn after(mut self, id: &str) -> Self {
        self.predecessors.insert(TaskId::new(id));
        self
    }

    /// Expand into concrete task instances carrying `id`.
    ///
    /// # Errors
    /// Returns an error if a matrix axis has no values.
    pub fn instantiate(&self, id: &TaskId) -> Result<Vec<Task>> {
        if let Some((key, _)) = self.matrix.iter().find(|(_, values)| values.is_empty()) {
            return Err(Error::Validation(format!(
                "Task {} has an empty matrix axis '{}'",
                id, key
            )));
        }

        let mut combinations: Vec<IndexMap<String, String>> = vec![self.parameters.clone()];
        for (key, values) in &self.matrix {
            combinations = combinations
                .into_iter()
                .flat_map(|base| {
                    values.iter().map(move |value| {
                        let mut params = base.clone();
                        params.insert(key.clone(), value.clone());
                        params
                    })
                })
                .collect();
        }

        Ok(combinations
            .into_iter()
            .map(|parameters| Task {
                id: id.clone(),
                target: self.target.clone(),
                operation: self.operation.clone(),
                parameters,
                predecessors: self.predecessors.clone(),
                policy: self.policy.clone(),
                stage: self.stage.clone(),
            })
            .collect())
    }
}

/// One entry of a sequence-mode definition list.
#[derive(Debug, Clone)]
pub enum SequenceItem {
    Task(TaskDefinition),
    Barrier,
}

fn resolve_id(def: &TaskDefinition, ids: &mut IdAllocator) -> TaskId {
    def.id
        .clone()
        .unwrap_or_else(|| ids.next_id(GENERATED_ID_PREFIX))
}

/// Build a graph from barrier-separated waves.
///
/// Adjacent non-empty waves are fully joined; tasks inside a wave get no
/// edges between them. Predecessors declared on a definition are kept.
pub fn build_sequence_graph(items: Vec<SequenceItem>, ids: &mut IdAllocator) -> Result<TaskGraph> {
    let mut graph = TaskGraph::new();
    let mut previous_wave: Vec<TaskId> = Vec::new();
    let mut current_wave: Vec<TaskId> = Vec::new();
    let mut waves = 0usize;

    let mut close_wave = |current: &mut Vec<TaskId>, previous: &mut Vec<TaskId>| {
        if !current.is_empty() {
            *previous = std::mem::take(current);
            waves += 1;
        }
    };

    for item in items {
        match item {
            SequenceItem::Barrier => close_wave(&mut current_wave, &mut previous_wave),
            SequenceItem::Task(def) => {
                let id = resolve_id(&def, ids);
                for task in def.instantiate(&id)? {
                    graph.add_task(task);
                }
                for pred in &previous_wave {
                    graph.add_dependency(pred, &id);
                }
                if !current_wave.contains(&id) {
                    current_wave.push(id);
                }
            }
        }
    }
    close_wave(&mut current_wave, &mut previous_wave);

    debug!(
        ids = graph.len(),
        instances = graph.instance_count(),
        waves,
        "built sequence-mode graph"
    );
    Ok(graph)
}

/// Build a graph from definitions that carry their own predecessors.
pub fn build_explicit_graph(
    definitions: Vec<TaskDefinition>,
    ids: &mut IdAllocator,
) -> Result<TaskGraph> {
    let mut graph = TaskGraph::new();
    let mut defined: HashSet<TaskId> = HashSet::new();
    let mut referenced: BTreeSet<TaskId> = BTreeSet::new();

    for def in definitions {
        let id = resolve_id(&def, ids);
        referenced.extend(def.predecessors.iter().cloned());
        for task in def.instantiate(&id)? {
            graph.add_task(task);
        }
        defined.insert(id);
    }

    for missing in referenced.iter().filter(|id| !defined.contains(*id)) {
        warn!(
            task = %missing,
            "predecessor is referenced but never defined; its dependents can never run"
        );
    }

    debug!(
        ids = graph.len(),
        instances = graph.instance_count(),
        "built explicit-mode graph"
    );
    Ok(graph)
}
