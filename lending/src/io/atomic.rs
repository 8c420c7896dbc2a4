//! Crash-safe file replacement shared by config and snapshot writers.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Write `contents` next to `path` as `<name>.tmp`, then rename over `path`.
///
/// Missing parent directories are created. `what` names the file in errors
/// ("config", "snapshot").
pub fn write_atomic(path: &Path, contents: &str, what: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} path missing parent {}", what, path.display()))?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = tmp_path(path);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp {} {}", what, tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("replace {} {}", what, path.display()))?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}
