//! Explicit runtime context: the store, the engine and where state is saved.
//!
//! Built once at startup and shut down explicitly; nothing in the crate
//! reaches for global state.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::engine::LendingEngine;
use crate::io::config::LendingConfig;
use crate::io::snapshot::{load_snapshot, write_snapshot};
use crate::io::store::{EntityStore, MemoryStore};

pub struct LendingContext {
    config: LendingConfig,
    engine: LendingEngine<MemoryStore>,
}

impl LendingContext {
    /// Build the store, restoring the configured snapshot if there is one.
    pub fn open(config: LendingConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(MemoryStore::new(config.lock_timeout()));
        if let Some(path) = &config.snapshot_path {
            let snapshot = load_snapshot(path)?;
            store
                .restore(snapshot)
                .with_context(|| format!("restore snapshot {}", path.display()))?;
        }
        let engine = LendingEngine::new(store, &config);
        info!(snapshot = ?config.snapshot_path, "lending context opened");
        Ok(Self { config, engine })
    }

    pub fn config(&self) -> &LendingConfig {
        &self.config
    }

    pub fn engine(&self) -> &LendingEngine<MemoryStore> {
        &self.engine
    }

    /// Write the current inventory to the snapshot path, if configured.
    pub fn persist(&self) -> Result<()> {
        let Some(path) = &self.config.snapshot_path else {
            return Ok(());
        };
        let snapshot = self.engine.store().snapshot().context("snapshot store")?;
        write_snapshot(path, &snapshot)
    }

    /// Persist and release the context.
    pub fn shutdown(self) -> Result<()> {
        self.persist()?;
        info!("lending context shut down");
        Ok(())
    }
}
