// crates/snapkeep-publish/src/local.rs
// ============================================================================
// Module: Local Publisher
// Description: Atomic install of a snapshot at a fixed filesystem path.
// Purpose: Keep one always-valid local copy of the latest snapshot.
// Dependencies: snapkeep-core
// ============================================================================

//! ## Overview
//! The published path is replaced by a single rename from
//! `<dest>.tmp`, so readers of `<dest>` observe the previous file or the new
//! one in full. A stale temp left by a crashed publish is removed first.

use std::fs;
use std::fs::File;
use std::path::Path;
use std::path::PathBuf;

use serde::Serialize;
use snapkeep_core::EventLog;

use crate::error::PublishError;

/// Suffix of the staging file beside the destination.
const TEMP_SUFFIX: &str = ".tmp";

/// Result of a local publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalReceipt {
    /// Installed path.
    pub path: PathBuf,
    /// Bytes installed.
    pub bytes: u64,
}

/// Installs snapshots at one destination path.
#[derive(Clone)]
pub struct LocalPublisher {
    /// Published path.
    dest: PathBuf,
    /// Event log.
    log: EventLog,
}

impl LocalPublisher {
    /// Creates a publisher for `dest`.
    #[must_use]
    pub fn new(dest: impl Into<PathBuf>, log: &EventLog) -> Self {
        Self {
            dest: dest.into(),
            log: log.component("publish_local"),
        }
    }

    /// Returns the published path.
    #[must_use]
    pub fn dest(&self) -> &Path {
        &self.dest
    }

    /// Publishes the snapshot at `snapshot` to the destination.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Io`] when copying, syncing, or renaming fails;
    /// the destination is unchanged in that case.
    pub fn publish(&self, snapshot: &Path) -> Result<LocalReceipt, PublishError> {
        let result = publish_local(snapshot, &self.dest);
        match &result {
            Ok(receipt) => self
                .log
                .info("publish_local")
                .field("path", receipt.path.display().to_string())
                .field("bytes", receipt.bytes)
                .emit(),
            Err(err) => self
                .log
                .error("publish_local_failed")
                .field("path", self.dest.display().to_string())
                .error(err)
                .emit(),
        }
        result
    }
}

/// Atomically installs a copy of `snapshot` at `dest`.
///
/// # Errors
///
/// Returns [`PublishError::Io`] on any filesystem failure and
/// [`PublishError::Invalid`] when `snapshot` is missing.
pub fn publish_local(snapshot: &Path, dest: &Path) -> Result<LocalReceipt, PublishError> {
    if !snapshot.is_file() {
        return Err(PublishError::Invalid(format!("snapshot not found: {}", snapshot.display())));
    }
    if let Some(parent) = dest.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let temp = temp_path(dest);
    match fs::remove_file(&temp) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    match copy_and_rename(snapshot, &temp, dest) {
        Ok(bytes) => Ok(LocalReceipt {
            path: dest.to_path_buf(),
            bytes,
        }),
        Err(err) => {
            let _ = fs::remove_file(&temp);
            Err(err)
        }
    }
}

/// Returns `<dest>.tmp`.
fn temp_path(dest: &Path) -> PathBuf {
    let mut raw = dest.as_os_str().to_os_string();
    raw.push(TEMP_SUFFIX);
    PathBuf::from(raw)
}

/// Copies into `temp`, fsyncs, and renames over `dest`.
fn copy_and_rename(snapshot: &Path, temp: &Path, dest: &Path) -> Result<u64, PublishError> {
    let bytes = fs::copy(snapshot, temp)?;
    File::open(temp)?.sync_all()?;
    fs::rename(temp, dest)?;
    if let Some(parent) = dest.parent().filter(|parent| !parent.as_os_str().is_empty())
        && let Ok(dir) = File::open(parent)
    {
        let _ = dir.sync_all();
    }
    Ok(bytes)
}
