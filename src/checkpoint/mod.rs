//! Checkpoint/resume durability layer.
//!
//! Progress of a run is recorded per logical id and written to disk after
//! every transition, so an interrupted run can pick up where it stopped.

mod manager;
mod record;
mod resume;

pub use manager::{
    checkpoint_path, find_checkpoint_for_taskfile, workflow_id_for_taskfile, CheckpointManager,
    CheckpointPersistence, FileCheckpointPersistence,
};
pub use record::{
    fingerprint_bytes, fingerprint_file, Checkpoint, FingerprintCheck, TaskRecord, TaskResult,
    CHECKPOINT_VERSION,
};
pub use resume::{
    restore_graph, ResumeFromTask, ResumePlan, RestoreSummary, SKIPPED_BEFORE_RESUME_POINT,
};
