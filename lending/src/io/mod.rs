//! Side-effecting collaborators: configuration, the entity store, snapshots.

pub mod atomic;
pub mod config;
pub mod snapshot;
pub mod store;
