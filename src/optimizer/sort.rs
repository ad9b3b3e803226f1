//! Ready-queue ordering by estimated duration.

use serde::{Deserialize, Serialize};

/// How the ready queue is ordered before dispatch.
///
/// Ordering is advisory; it never changes which tasks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortStrategy {
    /// Start long tasks early so no long tail runs alone at the end.
    LongestFirst,
    /// Drain short tasks quickly on contended systems.
    ShortestFirst,
}

impl std::fmt::Display for SortStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SortStrategy::LongestFirst => write!(f, "longest_first"),
            SortStrategy::ShortestFirst => write!(f, "shortest_first"),
        }
    }
}

/// Sort `items` by the estimate `estimate` returns for each.
///
/// Items without a reliable estimate (`None`) keep their relative order and
/// go after every estimated item.
pub fn sort_by_estimate<T>(items: &mut [T], strategy: SortStrategy, estimate: impl Fn(&T) -> Option<f64>) {
    items.sort_by(|a, b| match (estimate(a), estimate(b)) {
        (Some(x), Some(y)) => match strategy {
            SortStrategy::LongestFirst => y.total_cmp(&x),
            SortStrategy::ShortestFirst => x.total_cmp(&y),
        },
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
}
