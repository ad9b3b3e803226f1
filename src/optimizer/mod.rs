//! Contention-aware optimisation from historical durations.
//!
//! Everything here is advisory: estimates only reorder the ready queue or
//! add ordering edges between otherwise independent tasks.

mod analysis;
mod chains;
mod estimate;
mod history;
mod sort;

pub use analysis::{
    analyze_parameters, detect_heavy, group_by, select_driver, varying_keys, BatchTask,
    ContentionGroup, ParameterAnalysis, MIN_GROUPS_FOR_OUTLIERS,
};
pub use chains::{
    fan_out_size, recommend_workers, synthesize_chains, ContentionOptimizer, OptimizationPlan,
};
pub use estimate::{ewma, DurationEstimate, DurationEstimator};
pub use history::{task_signature, DurationHistory, InMemoryDurationHistory};
pub use sort::{sort_by_estimate, SortStrategy};
