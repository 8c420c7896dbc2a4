//! Shared application state for the gateway.

use lending::engine::LendingEngine;
use lending::error::LendingError;
use lending::io::store::MemoryStore;

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    engine: LendingEngine<MemoryStore>,
}

impl AppState {
    pub fn new(engine: LendingEngine<MemoryStore>) -> Self {
        Self { engine }
    }

    /// Run an engine call on the blocking pool.
    ///
    /// Store locks are synchronous and may wait up to the configured
    /// timeout, so handlers never call the engine on a runtime worker.
    pub async fn run<T, F>(&self, op: F) -> Result<T, LendingError>
    where
        T: Send + 'static,
        F: FnOnce(&LendingEngine<MemoryStore>) -> Result<T, LendingError> + Send + 'static,
    {
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || op(&engine))
            .await
            .unwrap_or_else(|err| {
                Err(LendingError::Unavailable(format!(
                    "engine task failed: {}",
                    err
                )))
            })
    }
}
