//! Stable exit codes for lending CLI commands.

/// Command succeeded and the inventory is consistent.
pub const OK: i32 = 0;
/// Command failed due to invalid config/snapshot or other errors.
pub const INVALID: i32 = 1;
/// `lending validate` found invariant violations in the stored inventory.
pub const DRIFT: i32 = 2;
