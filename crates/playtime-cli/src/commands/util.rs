//! Shared utilities for CLI commands.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;

/// Returns the lock file guarding `ledger_path`.
fn lock_path(ledger_path: &Path) -> PathBuf {
    let mut name = ledger_path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

/// Takes the exclusive writer lock for a ledger.
///
/// Only one process may write a ledger at a time. The lock is released when
/// the returned file is dropped.
pub fn lock_ledger(ledger_path: &Path) -> Result<File> {
    if let Some(parent) = ledger_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).context("failed to create ledger directory")?;
    }
    let path = lock_path(ledger_path);
    let file = File::create(&path).with_context(|| format!("failed to create {}", path.display()))?;
    FileExt::try_lock_exclusive(&file).with_context(|| {
        format!(
            "another playtime process is using {}; send a reset_user event to it instead",
            ledger_path.display()
        )
    })?;
    Ok(file)
}

/// Formats seconds as `1h 5m 3s`, `9m 10s`, or `42s`.
pub fn format_duration(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m {secs}s")
    } else if minutes > 0 {
        format!("{minutes}m {secs}s")
    } else {
        format!("{secs}s")
    }
}
