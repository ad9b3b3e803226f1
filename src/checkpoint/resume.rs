//! Deciding what a resumed run executes.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, info};

use crate::checkpoint::record::{Checkpoint, TaskRecord};
use crate::core::dag::TaskGraph;
use crate::core::task::TaskId;
use crate::error::{Error, Result};

/// Skip reason recorded for ids left behind by an explicit resume point.
pub const SKIPPED_BEFORE_RESUME_POINT: &str = "before resume point";

/// Outcome of [`Checkpoint::get_tasks_for_resume`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResumePlan {
    /// Ids the resumed run executes.
    pub to_run: BTreeSet<TaskId>,
    /// Ids that were in progress without `safe_retry`. They are neither
    /// rerun nor skipped until an operator decides.
    pub needs_decision: Vec<TaskId>,
}

impl ResumePlan {
    pub fn requires_decision(&self) -> bool {
        !self.needs_decision.is_empty()
    }

    /// Operator-facing explanation of why resume cannot proceed on its own.
    pub fn decision_message(&self) -> Option<String> {
        if self.needs_decision.is_empty() {
            return None;
        }
        let ids: Vec<&str> = self.needs_decision.iter().map(|id| id.as_str()).collect();
        Some(format!(
            "task(s) {} were running when the previous run stopped and are not marked \
             safe_retry, so their remote effect is unknown; pick a resume point with \
             --resume-from <id> or re-run them with --force-resume",
            ids.join(", ")
        ))
    }

    /// Resolve the plan into the set of ids to execute.
    ///
    /// With `force`, ids needing a decision are rerun. Otherwise they turn
    /// the plan into [`Error::ResumeConflict`].
    pub fn into_runnable(self, force: bool) -> Result<BTreeSet<TaskId>> {
        if let Some(message) = self.decision_message() {
            if !force {
                return Err(Error::ResumeConflict {
                    tasks: self.needs_decision.iter().map(|id| id.0.clone()).collect(),
                    message,
                });
            }
            info!(tasks = ?self.needs_decision, "forcing re-run of interrupted tasks");
        }
        let mut to_run = self.to_run;
        to_run.extend(self.needs_decision);
        Ok(to_run)
    }
}

/// Outcome of [`Checkpoint::get_resume_from_task`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResumeFromTask {
    /// Ids at or after the resume point, plus still-pending ids, in original order.
    pub to_run: Vec<TaskId>,
    /// Ids before the resume point that are neither completed nor rerun.
    /// The caller marks them skipped.
    pub to_skip: Vec<TaskId>,
}

impl Checkpoint {
    /// Decide what an automatic resume runs.
    ///
    /// Completed ids are never rerun. Pending, failed and skipped ids are.
    /// An in-progress id is rerun only if `safe_retry_by_id` says so; an
    /// unknown id counts as not safe.
    pub fn get_tasks_for_resume(&self, safe_retry_by_id: &HashMap<TaskId, bool>) -> ResumePlan {
        let mut plan = ResumePlan::default();
        for id in &self.task_order {
            match self.tasks.get(id) {
                Some(TaskRecord::Completed { .. }) => {}
                Some(TaskRecord::InProgress { .. }) => {
                    if safe_retry_by_id.get(id).copied().unwrap_or(false) {
                        plan.to_run.insert(id.clone());
                    } else {
                        plan.needs_decision.push(id.clone());
                    }
                }
                Some(_) | None => {
                    plan.to_run.insert(id.clone());
                }
            }
        }
        debug!(
            run = plan.to_run.len(),
            needs_decision = plan.needs_decision.len(),
            "computed resume plan"
        );
        plan
    }

    /// Resume from an explicit id.
    ///
    /// `all_ids` is the original definition order. Everything from
    /// `explicit_id` onwards is rerun, along with any id still pending
    /// before it.
    ///
    /// # Errors
    /// Returns [`Error::TaskNotFound`] if `explicit_id` is not in `all_ids`.
    pub fn get_resume_from_task(&self, explicit_id: &TaskId, all_ids: &[TaskId]) -> Result<ResumeFromTask> {
        let point = all_ids
            .iter()
            .position(|id| id == explicit_id)
            .ok_or_else(|| Error::TaskNotFound(explicit_id.to_string()))?;

        let mut result = ResumeFromTask::default();
        for (pos, id) in all_ids.iter().enumerate() {
            let record = self.tasks.get(id);
            let pending = matches!(record, Some(TaskRecord::Pending) | None);
            if pos >= point || pending {
                result.to_run.push(id.clone());
            } else if !matches!(record, Some(TaskRecord::Completed { .. })) {
                result.to_skip.push(id.clone());
            }
        }
        Ok(result)
    }

    /// Align the checkpoint with a resumed run: rerun ids go back to pending,
    /// `to_skip` ids are marked skipped.
    pub fn prepare_resume(&mut self, to_run: &BTreeSet<TaskId>, to_skip: &[TaskId]) -> Result<()> {
        for id in to_run {
            if self.tasks.contains_key(id) {
                self.reset(id)?;
            }
        }
        for id in to_skip {
            self.mark_skipped(id, SKIPPED_BEFORE_RESUME_POINT)?;
        }
        Ok(())
    }
}

/// What [`restore_graph`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub restored: Vec<TaskId>,
    pub skipped: Vec<TaskId>,
}

/// Seed a freshly built graph with checkpointed progress.
///
/// Ids in `to_run` stay pending. Ids the checkpoint records as completed
/// are marked complete as a whole; every other defined id is skipped.
pub fn restore_graph(
    graph: &mut TaskGraph,
    checkpoint: &Checkpoint,
    to_run: &BTreeSet<TaskId>,
) -> Result<RestoreSummary> {
    let mut summary = RestoreSummary::default();
    for id in graph.defined_ids() {
        if to_run.contains(&id) {
            continue;
        }
        if matches!(checkpoint.record(&id), Some(TaskRecord::Completed { .. })) {
            graph.mark_complete_id(&id, true)?;
            summary.restored.push(id);
        } else {
            graph.mark_skipped(&id)?;
            summary.skipped.push(id);
        }
    }
    info!(
        restored = summary.restored.len(),
        skipped = summary.skipped.len(),
        to_run = to_run.len(),
        "restored graph from checkpoint"
    );
    Ok(summary)
}
