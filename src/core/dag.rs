//! Task dependency graph and its scheduling state machine.
//!
//! The graph is keyed by logical [`TaskId`]. Every id owns one or more task
//! instances stored in an arena and addressed by [`InstanceId`], so sibling
//! instances sharing an id are tracked individually while dependencies and
//! statuses stay per id.

use crate::core::task::{InstanceId, Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// Per-id scheduling state.
#[derive(Debug, Clone)]
struct NodeState {
    status: TaskStatus,
    /// Logical AND of every completed instance's success.
    result: bool,
    instances: Vec<InstanceId>,
}

impl NodeState {
    fn new() -> Self {
        Self {
            status: TaskStatus::Pending,
            result: true,
            instances: Vec::new(),
        }
    }
}

/// Arena slot for one task instance.
#[derive(Debug, Clone)]
struct InstanceSlot {
    task: Task,
    dispatched: bool,
    completed: bool,
    success: Option<bool>,
}

/// Why an edge exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeKind {
    /// Declared in the taskfile or added by stage ordering. A failed
    /// predecessor can block its successor.
    Declared,
    /// Added by the contention optimizer. Only delays the successor.
    Ordering,
}

/// DFS colouring used to reconstruct a cycle.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// The task dependency graph.
///
/// Edges point from predecessor to successor. Nodes are created on first
/// mention, either by [`add_task`](Self::add_task) or
/// [`add_dependency`](Self::add_dependency).
pub struct TaskGraph {
    graph: DiGraph<TaskId, EdgeKind>,
    index: HashMap<TaskId, NodeIndex>,
    nodes: HashMap<TaskId, NodeState>,
    instances: Vec<InstanceSlot>,
}

impl TaskGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index: HashMap::new(),
            nodes: HashMap::new(),
            instances: Vec::new(),
        }
    }

    fn ensure_node(&mut self, id: &TaskId) -> NodeIndex {
        if let Some(&idx) = self.index.get(id) {
            return idx;
        }
        let idx = self.graph.add_node(id.clone());
        self.index.insert(id.clone(), idx);
        self.nodes.insert(id.clone(), NodeState::new());
        idx
    }

    /// Register a task instance.
    ///
    /// The instance joins any siblings already registered under the same id,
    /// and its declared predecessors become edges.
    pub fn add_task(&mut self, task: Task) -> InstanceId {
        let id = task.id.clone();
        self.ensure_node(&id);
        for pred in task.predecessors.clone() {
            self.add_dependency(&pred, &id);
        }

        let handle = InstanceId(self.instances.len());
        self.instances.push(InstanceSlot {
            task,
            dispatched: false,
            completed: false,
            success: None,
        });
        if let Some(node) = self.nodes.get_mut(&id) {
            node.instances.push(handle);
        }
        handle
    }

    /// Declare that `successor` may only start once `predecessor` is terminal.
    ///
    /// Registering the same edge twice is a no-op; declaring an existing
    /// ordering edge upgrades it. Cycles are reported by
    /// [`validate`](Self::validate), not here.
    pub fn add_dependency(&mut self, predecessor: &TaskId, successor: &TaskId) {
        let from = self.ensure_node(predecessor);
        let to = self.ensure_node(successor);
        match self.graph.find_edge(from, to) {
            Some(edge) => self.graph[edge] = EdgeKind::Declared,
            None => {
                self.graph.add_edge(from, to, EdgeKind::Declared);
            }
        }
    }

    /// Add an ordering-only edge if it keeps the graph acyclic.
    ///
    /// `successor` waits for `predecessor` to be terminal but is never
    /// blocked by its failure; see [`predecessors`](Self::predecessors).
    /// Returns `false` (and leaves the graph untouched) when `successor`
    /// already reaches `predecessor`, or when either id is unknown.
    pub fn add_ordering_if_acyclic(&mut self, predecessor: &TaskId, successor: &TaskId) -> bool {
        let (Some(&from), Some(&to)) = (self.index.get(predecessor), self.index.get(successor))
        else {
            return false;
        };
        if from == to || has_path_connecting(&self.graph, to, from, None) {
            return false;
        }
        if self.graph.find_edge(from, to).is_none() {
            self.graph.add_edge(from, to, EdgeKind::Ordering);
        }
        true
    }

    /// Check the graph is acyclic.
    ///
    /// Counts nodes with Kahn's algorithm; on a mismatch, reconstructs one
    /// concrete cycle with a white/gray/black DFS so the error carries a path
    /// that returns to its start.
    pub fn validate(&self) -> Result<()> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|n| (n, self.graph.neighbors_directed(n, Direction::Incoming).count()))
            .collect();

        let mut queue: VecDeque<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|n| in_degree.get(n).copied().unwrap_or(0) == 0)
            .collect();

        let mut visited = 0usize;
        while let Some(node) = queue.pop_front() {
            visited += 1;
            for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                if let Some(deg) = in_degree.get_mut(&next) {
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push_back(next);
                    }
                }
            }
        }

        if visited == self.graph.node_count() {
            return Ok(());
        }

        let path = self.find_cycle().unwrap_or_default();
        Err(Error::Cycle {
            path: path.into_iter().map(|id| id.0).collect(),
        })
    }

    fn find_cycle(&self) -> Option<Vec<TaskId>> {
        let mut colors: HashMap<NodeIndex, Color> = self
            .graph
            .node_indices()
            .map(|n| (n, Color::White))
            .collect();

        for start in self.graph.node_indices() {
            if colors.get(&start) != Some(&Color::White) {
                continue;
            }
            let mut path = Vec::new();
            if let Some(cycle) = self.dfs_cycle(start, &mut colors, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    fn dfs_cycle(
        &self,
        node: NodeIndex,
        colors: &mut HashMap<NodeIndex, Color>,
        path: &mut Vec<NodeIndex>,
    ) -> Option<Vec<TaskId>> {
        colors.insert(node, Color::Gray);
        path.push(node);

        for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
            match colors.get(&next).copied().unwrap_or(Color::White) {
                Color::Gray => {
                    let start = path.iter().position(|&n| n == next)?;
                    let mut cycle: Vec<TaskId> = path[start..]
                        .iter()
                        .map(|&n| self.graph[n].clone())
                        .collect();
                    cycle.push(self.graph[next].clone());
                    return Some(cycle);
                }
                Color::White => {
                    if let Some(cycle) = self.dfs_cycle(next, colors, path) {
                        return Some(cycle);
                    }
                }
                Color::Black => {}
            }
        }

        path.pop();
        colors.insert(node, Color::Black);
        None
    }

    // ========== Scheduling Operations ==========

    /// Get every instance that may be dispatched now.
    ///
    /// A pending id contributes its undispatched instances once all of its
    /// predecessors are terminal. A running id contributes any sibling that
    /// has not been dispatched yet. Terminal ids contribute nothing.
    pub fn get_ready_tasks(&self) -> Vec<InstanceId> {
        let mut ready = Vec::new();
        for idx in self.graph.node_indices() {
            let id = &self.graph[idx];
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            let eligible = match node.status {
                TaskStatus::Pending => self
                    .graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .all(|pred| self.status(&self.graph[pred]).is_terminal()),
                TaskStatus::Running => true,
                _ => false,
            };
            if !eligible {
                continue;
            }
            ready.extend(
                node.instances
                    .iter()
                    .copied()
                    .filter(|h| !self.instances[h.0].dispatched),
            );
        }
        ready
    }

    /// Record that an instance has been handed to a worker.
    ///
    /// # Errors
    /// Returns an error for an unknown handle or when the id is already terminal.
    pub fn mark_running(&mut self, instance: InstanceId) -> Result<()> {
        let id = self.slot(instance)?.task.id.clone();
        let node = self
            .nodes
            .get_mut(&id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
        if node.status.is_terminal() {
            return Err(Error::Validation(format!(
                "Task {} is already {} and cannot run",
                id, node.status
            )));
        }
        node.status = TaskStatus::Running;
        self.instances[instance.0].dispatched = true;
        Ok(())
    }

    /// Record the outcome of one instance.
    ///
    /// The outcome is folded into the id's AND-aggregate. Returns `true` when
    /// this completion made the id terminal. Completing an instance twice is
    /// a no-op.
    pub fn mark_complete(&mut self, instance: InstanceId, success: bool) -> Result<bool> {
        let slot = self
            .instances
            .get_mut(instance.0)
            .ok_or_else(|| Error::TaskNotFound(instance.to_string()))?;
        if slot.completed {
            return Ok(false);
        }
        slot.dispatched = true;
        slot.completed = true;
        slot.success = Some(success);
        let id = slot.task.id.clone();

        let node = self
            .nodes
            .get_mut(&id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
        if node.status.is_terminal() {
            return Ok(false);
        }
        node.result &= success;
        if node.status == TaskStatus::Pending {
            node.status = TaskStatus::Running;
        }

        let all_done = node
            .instances
            .iter()
            .all(|h| self.instances[h.0].completed);
        if all_done {
            node.status = if node.result {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            };
        }
        Ok(all_done)
    }

    /// Mark every instance of `id` dispatched and complete at once.
    ///
    /// Used when restoring progress from a checkpoint.
    pub fn mark_complete_id(&mut self, id: &TaskId, success: bool) -> Result<()> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
        if node.status.is_terminal() {
            return Ok(());
        }
        node.result &= success;
        node.status = if node.result {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        for h in node.instances.clone() {
            let slot = &mut self.instances[h.0];
            slot.dispatched = true;
            slot.completed = true;
            slot.success.get_or_insert(success);
        }
        Ok(())
    }

    /// Force `id` to `Skipped` with a `false` result.
    ///
    /// An id that is already terminal keeps its status and result.
    pub fn mark_skipped(&mut self, id: &TaskId) -> Result<()> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
        if node.status.is_terminal() {
            return Ok(());
        }
        node.status = TaskStatus::Skipped;
        node.result = false;
        for h in node.instances.clone() {
            let slot = &mut self.instances[h.0];
            slot.dispatched = true;
            slot.completed = true;
        }
        Ok(())
    }

    /// Add a barrier between consecutive stages.
    ///
    /// Every id whose tasks carry stage `stages[i - 1]` becomes a predecessor
    /// of every id carrying `stages[i]`. Stages with no tasks are passed
    /// over, so the barrier joins the nearest non-empty stages. Explicit edges
    /// are kept.
    pub fn apply_stage_ordering(&mut self, stages: &[String]) {
        let mut by_stage: HashMap<&str, Vec<TaskId>> = HashMap::new();
        for idx in self.graph.node_indices() {
            let id = &self.graph[idx];
            let stage = self
                .nodes
                .get(id)
                .and_then(|n| n.instances.first())
                .and_then(|h| self.instances[h.0].task.stage.as_deref());
            if let Some(stage) = stage {
                by_stage.entry(stage).or_default().push(id.clone());
            }
        }

        let waves: Vec<Vec<TaskId>> = stages
            .iter()
            .filter_map(|s| by_stage.get(s.as_str()).cloned())
            .filter(|ids| !ids.is_empty())
            .collect();

        for pair in waves.windows(2) {
            for pred in &pair[0] {
                for succ in &pair[1] {
                    self.add_dependency(pred, succ);
                }
            }
        }
    }

    /// True when every id is terminal.
    pub fn is_complete(&self) -> bool {
        self.nodes.values().all(|n| n.status.is_terminal())
    }

    // ========== Queries ==========

    fn slot(&self, instance: InstanceId) -> Result<&InstanceSlot> {
        self.instances
            .get(instance.0)
            .ok_or_else(|| Error::TaskNotFound(instance.to_string()))
    }

    /// Get the task behind an instance handle.
    pub fn task(&self, instance: InstanceId) -> Option<&Task> {
        self.instances.get(instance.0).map(|s| &s.task)
    }

    /// Status of a logical id. Unknown ids report `Pending`.
    pub fn status(&self, id: &TaskId) -> TaskStatus {
        self.nodes
            .get(id)
            .map(|n| n.status)
            .unwrap_or(TaskStatus::Pending)
    }

    /// Aggregated result of a terminal id; `None` while it is still open.
    pub fn result(&self, id: &TaskId) -> Option<bool> {
        self.nodes
            .get(id)
            .filter(|n| n.status.is_terminal())
            .map(|n| n.result)
    }

    /// id → result for every terminal id.
    pub fn results(&self) -> BTreeMap<TaskId, bool> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.status.is_terminal())
            .map(|(id, n)| (id.clone(), n.result))
            .collect()
    }

    /// Instance handles registered under `id`.
    pub fn instances_of(&self, id: &TaskId) -> &[InstanceId] {
        self.nodes
            .get(id)
            .map(|n| n.instances.as_slice())
            .unwrap_or(&[])
    }

    /// All tasks registered under `id`, in registration order.
    pub fn tasks_of(&self, id: &TaskId) -> Vec<&Task> {
        self.instances_of(id)
            .iter()
            .filter_map(|h| self.task(*h))
            .collect()
    }

    /// Ids in first-registration order.
    pub fn task_ids(&self) -> Vec<TaskId> {
        self.graph
            .node_indices()
            .map(|idx| self.graph[idx].clone())
            .collect()
    }

    /// Ids that have at least one instance, in the order their first
    /// instance was registered. Ids only referenced as predecessors are
    /// left out.
    pub fn defined_ids(&self) -> Vec<TaskId> {
        let mut seen = HashSet::new();
        self.instances
            .iter()
            .filter(|slot| seen.insert(&slot.task.id))
            .map(|slot| slot.task.id.clone())
            .collect()
    }

    /// Every instance handle, in registration order.
    pub fn all_instances(&self) -> Vec<InstanceId> {
        (0..self.instances.len()).map(InstanceId).collect()
    }

    /// Declared and stage predecessors of `id`. Ordering edges from the
    /// optimizer are left out.
    pub fn predecessors(&self, id: &TaskId) -> Vec<TaskId> {
        match self.index.get(id) {
            Some(&idx) => self
                .graph
                .edges_directed(idx, Direction::Incoming)
                .filter(|e| *e.weight() == EdgeKind::Declared)
                .map(|e| self.graph[e.source()].clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Every successor of `id`, ordering edges included.
    pub fn successors(&self, id: &TaskId) -> Vec<TaskId> {
        match self.index.get(id) {
            Some(&idx) => self
                .graph
                .neighbors_directed(idx, Direction::Outgoing)
                .map(|n| self.graph[n].clone())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn has_dependency(&self, predecessor: &TaskId, successor: &TaskId) -> bool {
        match (self.index.get(predecessor), self.index.get(successor)) {
            (Some(&from), Some(&to)) => self.graph.find_edge(from, to).is_some(),
            _ => false,
        }
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    /// Number of logical ids.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Whether each id may be rerun blindly: true only if every instance
    /// is marked `safe_retry`. Ids without instances are left out.
    pub fn safe_retry_by_id(&self) -> HashMap<TaskId, bool> {
        self.nodes
            .iter()
            .filter(|(_, node)| !node.instances.is_empty())
            .map(|(id, node)| {
                let safe = node
                    .instances
                    .iter()
                    .all(|h| self.instances[h.0].task.policy.safe_retry);
                (id.clone(), safe)
            })
            .collect()
    }

    /// Distinct target systems, sorted.
    pub fn targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = self.instances.iter().map(|s| s.task.target.clone()).collect();
        targets.sort();
        targets.dedup();
        targets
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("ids", &self.len())
            .field("instances", &self.instance_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
