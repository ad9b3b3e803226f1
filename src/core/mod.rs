//! Core domain models: tasks, the dependency graph and graph builders.

pub mod builder;
pub mod dag;
pub mod task;

pub use builder::{build_explicit_graph, build_sequence_graph, SequenceItem, TaskDefinition};
pub use dag::TaskGraph;
pub use task::{IdAllocator, InstanceId, Task, TaskId, TaskPolicy, TaskStatus};
