//! Deterministic, pure lending logic.
//!
//! Core modules must be free of I/O side effects. They operate on entity
//! snapshots and return deterministic outputs suitable for tests.

pub mod invariants;
pub mod report;
pub mod transition;
pub mod types;
