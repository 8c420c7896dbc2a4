//! Tracing setup for the lending CLI.
//!
//! Engine transitions, conflict retries and compensations are emitted as
//! structured `tracing` events; this module only decides which of them reach
//! stderr.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Default directive when `RUST_LOG` is unset.
pub const QUIET: &str = "warn";

/// Default directive for `--verbose` runs.
pub const VERBOSE: &str = "warn,lending=debug";

/// `RUST_LOG` if set and parseable, else `default_directive`.
pub fn filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Install the global subscriber: compact format on stderr, so stdout stays
/// reserved for command output.
///
/// ```bash
/// RUST_LOG=lending::engine=trace lending validate
/// ```
pub fn init(default_directive: &str) {
    tracing_subscriber::registry()
        .with(filter(default_directive))
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
