//! Lending inventory: authors, books and borrowers, and the rules that move
//! book copies between the shelf and borrowers.
//!
//! The crate keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (invariants, transition
//!   planning, drift reports). No I/O, fully testable in isolation.
//! - **[`io`]**: The versioned entity store, configuration and snapshots.
//!
//! [`engine::LendingEngine`] coordinates the two and is the only path that
//! mutates copy counts and loan sets. [`context::LendingContext`] owns the
//! engine for the lifetime of a process.

pub mod context;
pub mod core;
pub mod engine;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
