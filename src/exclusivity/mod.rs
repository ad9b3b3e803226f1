//! Exclusive-mode coordination across runs sharing target systems.

mod coordinator;
mod label;
mod registry;

pub use coordinator::{should_wait, ExclusivityCoordinator, ExclusivitySession};
pub use label::{ContextLabel, SessionMode};
pub use registry::{
    DirectorySessionRegistry, InMemorySessionRegistry, RegistrySession, SessionRegistry,
};
