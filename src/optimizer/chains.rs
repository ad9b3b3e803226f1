//! Predecessor-chain synthesis and the optimizer entry point.
//!
//! Heavy driver values contend for the same shared resource. Within one
//! fan-out combination they are chained so only one runs at a time, while
//! separate combinations still run side by side.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, info};

use crate::config::OptimizerConfig;
use crate::core::dag::TaskGraph;
use crate::core::task::{InstanceId, Task, TaskId};
use crate::optimizer::analysis::{
    analyze_parameters, detect_heavy, select_driver, BatchTask, ContentionGroup,
};
use crate::optimizer::estimate::{DurationEstimate, DurationEstimator};
use crate::optimizer::history::DurationHistory;
use crate::optimizer::sort::{sort_by_estimate, SortStrategy};

/// Result of analysing a graph for contention.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptimizationPlan {
    pub driver: Option<String>,
    pub fan_out_keys: Vec<String>,
    /// Distinct combinations of fan-out values; at least 1.
    pub fan_out_size: usize,
    pub heavy: Vec<ContentionGroup>,
    pub light: Vec<ContentionGroup>,
    /// One chain per fan-out combination, heaviest first.
    pub chains: Vec<Vec<TaskId>>,
    /// Edges actually added to the graph.
    pub edges_added: Vec<(TaskId, TaskId)>,
    pub critical_path_secs: f64,
    pub light_total_secs: f64,
    pub recommended_workers: usize,
}

fn combination(task: &BatchTask, keys: &[String]) -> Vec<String> {
    keys.iter().map(|k| task.value(k).to_string()).collect()
}

/// Number of distinct fan-out combinations in the batch, at least 1.
pub fn fan_out_size(batch: &[BatchTask], fan_out_keys: &[String]) -> usize {
    let mut seen: Vec<Vec<String>> = Vec::new();
    for task in batch {
        let combo = combination(task, fan_out_keys);
        if !seen.contains(&combo) {
            seen.push(combo);
        }
    }
    seen.len().max(1)
}

/// Order each fan-out combination's heavy tasks into a chain.
///
/// `heavy` must be sorted heaviest first. Tasks are ordered by the rank of
/// their driver value in `heavy`; a chain never repeats an id.
pub fn synthesize_chains(
    batch: &[BatchTask],
    driver: &str,
    heavy: &[ContentionGroup],
    fan_out_keys: &[String],
) -> Vec<Vec<TaskId>> {
    let mut by_combination: IndexMap<Vec<String>, Vec<(usize, TaskId)>> = IndexMap::new();
    for task in batch {
        let Some(rank) = heavy.iter().position(|g| g.value == task.value(driver)) else {
            continue;
        };
        by_combination
            .entry(combination(task, fan_out_keys))
            .or_default()
            .push((rank, task.id.clone()));
    }

    by_combination
        .into_values()
        .map(|mut members| {
            members.sort_by_key(|(rank, _)| *rank);
            let mut chain: Vec<TaskId> = Vec::new();
            for (_, id) in members {
                if chain.contains(&id) {
                    debug!(task = %id, "heavy instances share an id, chained once");
                } else {
                    chain.push(id);
                }
            }
            chain
        })
        .collect()
}

/// Worker count that keeps every chain busy and absorbs the light work
/// alongside the critical path.
pub fn recommend_workers(
    fan_out_size: usize,
    heavy: &[ContentionGroup],
    light: &[ContentionGroup],
) -> (usize, f64, f64) {
    let chain_slots = fan_out_size;
    let critical_path: f64 = heavy.iter().map(|g| g.average).sum();
    let light_total: f64 = light.iter().map(|g| g.average * g.members as f64).sum();
    let light_slots = if critical_path > 0.0 {
        (light_total / critical_path).ceil() as usize
    } else {
        0
    };
    let recommended = chain_slots.max(chain_slots + light_slots);
    (recommended, critical_path, light_total)
}

/// Analyses a graph against duration history and reorders or reshapes it
/// to reduce contention.
pub struct ContentionOptimizer {
    settings: OptimizerConfig,
    history: Arc<dyn DurationHistory>,
}

impl ContentionOptimizer {
    pub fn new(settings: OptimizerConfig, history: Arc<dyn DurationHistory>) -> Self {
        Self { settings, history }
    }

    pub fn sort_strategy(&self) -> Option<SortStrategy> {
        self.settings.sort
    }

    fn estimator(&self) -> DurationEstimator<'_> {
        DurationEstimator::new(
            self.history.as_ref(),
            self.settings.alpha,
            self.settings.history_limit,
            self.settings.min_samples,
        )
    }

    pub fn estimate(&self, task: &Task) -> Option<DurationEstimate> {
        self.estimator().estimate(task)
    }

    /// Every instance with a reliable estimate.
    fn batch(&self, graph: &TaskGraph) -> Vec<BatchTask> {
        let estimator = self.estimator();
        graph
            .all_instances()
            .into_iter()
            .filter_map(|handle| graph.task(handle))
            .filter_map(|task| {
                let estimate = estimator.estimate(task).filter(|e| e.reliable)?;
                Some(BatchTask {
                    id: task.id.clone(),
                    parameters: task.parameters.clone(),
                    seconds: estimate.seconds,
                })
            })
            .collect()
    }

    /// Analyse without touching the graph.
    pub fn analyze(&self, graph: &TaskGraph) -> OptimizationPlan {
        let batch = self.batch(graph);
        let analyses = analyze_parameters(&batch);
        let driver = select_driver(&analyses, self.settings.driver_ratio);

        let mut plan = OptimizationPlan {
            driver: driver.map(|d| d.key.clone()),
            ..Default::default()
        };
        plan.fan_out_keys = analyses
            .iter()
            .map(|a| a.key.clone())
            .filter(|k| Some(k) != plan.driver.as_ref())
            .collect();
        plan.fan_out_size = fan_out_size(&batch, &plan.fan_out_keys);

        if let Some(driver) = driver {
            plan.heavy = detect_heavy(&driver.groups, self.settings.sensitivity);
            plan.light = driver
                .groups
                .iter()
                .filter(|g| !plan.heavy.iter().any(|h| h.value == g.value))
                .cloned()
                .collect();
            plan.chains = synthesize_chains(&batch, &driver.key, &plan.heavy, &plan.fan_out_keys);
        }

        let (recommended, critical, light_total) =
            recommend_workers(plan.fan_out_size, &plan.heavy, &plan.light);
        plan.recommended_workers = recommended;
        plan.critical_path_secs = critical;
        plan.light_total_secs = light_total;

        debug!(
            estimated = batch.len(),
            driver = ?plan.driver,
            heavy = plan.heavy.len(),
            "contention analysis"
        );
        plan
    }

    /// Analyse and, when chain synthesis is enabled, add the chain edges.
    ///
    /// Chain edges are ordering-only: a chain member waits for the one before
    /// it but still runs when that one fails. An edge that would close a
    /// cycle is left out. Chains link logical ids, so heavy matrix siblings
    /// sharing one id are not serialised against each other.
    pub fn apply(&self, graph: &mut TaskGraph) -> OptimizationPlan {
        let mut plan = self.analyze(graph);
        if !self.settings.synthesize_chains {
            return plan;
        }
        for chain in &plan.chains {
            for pair in chain.windows(2) {
                if graph.has_dependency(&pair[0], &pair[1]) {
                    continue;
                }
                if graph.add_ordering_if_acyclic(&pair[0], &pair[1]) {
                    plan.edges_added.push((pair[0].clone(), pair[1].clone()));
                } else {
                    debug!(from = %pair[0], to = %pair[1], "chain edge would form a cycle, skipped");
                }
            }
        }
        info!(
            driver = ?plan.driver,
            heavy = plan.heavy.len(),
            chain_edges = plan.edges_added.len(),
            recommended_workers = plan.recommended_workers,
            "contention optimizer applied"
        );
        plan
    }

    /// Order ready instances per the configured strategy; no-op without one.
    pub fn sort_ready(&self, graph: &TaskGraph, ready: &mut [InstanceId]) {
        let Some(strategy) = self.settings.sort else {
            return;
        };
        let estimator = self.estimator();
        let mut cache: HashMap<InstanceId, Option<f64>> = HashMap::new();
        for handle in ready.iter() {
            let estimate = graph
                .task(*handle)
                .and_then(|task| estimator.estimate(task))
                .filter(|e| e.reliable)
                .map(|e| e.seconds);
            cache.insert(*handle, estimate);
        }
        sort_by_estimate(ready, strategy, |h| cache.get(h).copied().flatten());
    }
}

impl std::fmt::Debug for ContentionOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentionOptimizer")
            .field("settings", &self.settings)
            .finish()
    }
}
