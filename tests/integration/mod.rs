//! Integration test suite for procflow.
//!
//! These tests run whole graphs through the scheduler and exercise the
//! checkpoint and exclusivity layers against real temporary directories.
//!
//! # Test Categories
//!
//! - `scheduling`: dispatch order, concurrency limits, failure propagation
//! - `resume`: checkpoint written by one run, resumed by the next
//! - `exclusivity`: exclusive/normal runs sharing a session directory
//! - `properties`: property tests for cycle detection and sibling aggregation
//!
//! # CI Compatibility
//!
//! Task execution is scripted; no external processes or systems are needed.

mod fixtures;

mod exclusivity;
mod properties;
mod resume;
mod scheduling;
