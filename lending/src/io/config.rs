//! Lending configuration stored as TOML (default `lending.toml`).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::atomic::write_atomic;

/// Lending configuration (TOML).
///
/// Intended to be edited by humans. Missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LendingConfig {
    /// How many times a borrow/return is retried after a version conflict
    /// before the caller sees `Unavailable`.
    pub max_conflict_retries: u32,

    /// Upper bound on waiting for the store lock, in milliseconds.
    pub lock_timeout_ms: u64,

    /// Where the inventory snapshot is read at startup and written at shutdown.
    /// Unset means a purely in-memory inventory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_path: Option<PathBuf>,

    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address the HTTP gateway binds to.
    pub bind: String,
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

impl Default for LendingConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: 5,
            lock_timeout_ms: 2_000,
            snapshot_path: None,
            gateway: GatewayConfig::default(),
        }
    }
}

impl LendingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_conflict_retries == 0 {
            return Err(anyhow!("max_conflict_retries must be > 0"));
        }
        if self.lock_timeout_ms == 0 {
            return Err(anyhow!("lock_timeout_ms must be > 0"));
        }
        if self.gateway.bind.trim().is_empty() {
            return Err(anyhow!("gateway.bind must be non-empty"));
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `LendingConfig::default()`.
pub fn load_config(path: &Path) -> Result<LendingConfig> {
    if !path.exists() {
        let cfg = LendingConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: LendingConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &LendingConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf, "config")
}
