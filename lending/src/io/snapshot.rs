//! JSON snapshots of the whole store, written at shutdown and read at startup.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::{Author, Book, Borrower};
use crate::io::atomic::write_atomic;
use crate::io::store::Versioned;

/// Every record of every kind, with versions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    pub authors: Vec<Versioned<Author>>,
    pub books: Vec<Versioned<Book>>,
    pub borrowers: Vec<Versioned<Borrower>>,
}

impl Snapshot {
    pub fn authors(&self) -> Vec<Author> {
        self.authors.iter().map(|entry| entry.record.clone()).collect()
    }

    pub fn books(&self) -> Vec<Book> {
        self.books.iter().map(|entry| entry.record.clone()).collect()
    }

    pub fn borrowers(&self) -> Vec<Borrower> {
        self.borrowers
            .iter()
            .map(|entry| entry.record.clone())
            .collect()
    }
}

/// Load a snapshot. A missing file is an empty inventory.
pub fn load_snapshot(path: &Path) -> Result<Snapshot> {
    if !path.exists() {
        debug!(path = %path.display(), "no snapshot, starting empty");
        return Ok(Snapshot::default());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read snapshot {}", path.display()))?;
    let snapshot: Snapshot = serde_json::from_str(&contents)
        .with_context(|| format!("parse snapshot {}", path.display()))?;
    debug!(
        path = %path.display(),
        authors = snapshot.authors.len(),
        books = snapshot.books.len(),
        borrowers = snapshot.borrowers.len(),
        "snapshot loaded"
    );
    Ok(snapshot)
}

/// Atomically write a snapshot (temp file + rename).
pub fn write_snapshot(path: &Path, snapshot: &Snapshot) -> Result<()> {
    debug!(path = %path.display(), "writing snapshot");
    let mut buf = serde_json::to_string_pretty(snapshot).context("serialize snapshot")?;
    buf.push('\n');
    write_atomic(path, &buf, "snapshot")
}
