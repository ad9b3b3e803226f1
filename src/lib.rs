pub mod checkpoint;
pub mod config;
pub mod core;
pub mod error;
pub mod exclusivity;
pub mod log;
pub mod optimizer;
pub mod orchestration;
pub mod taskfile;
pub mod util;

pub use crate::core::{Task, TaskGraph, TaskId};
pub use error::{Error, Result};
pub use taskfile::Taskfile;
