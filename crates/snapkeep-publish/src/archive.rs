// crates/snapkeep-publish/src/archive.rs
// ============================================================================
// Module: Snapshot Archive
// Description: Timestamped snapshot files in a local directory with retention.
// Purpose: Keep a bounded local history of snapshots.
// Dependencies: snapkeep-core, snapkeep-store-sqlite
// ============================================================================

//! ## Overview
//! Each archived snapshot lands in `app-snapshot-YYYYMMDD-HHMMSS.sqlite`.
//! A second snapshot in the same second gets a `-N` suffix. Names are
//! reserved with an exclusive create before any bytes are written, so two
//! callers never share a file. After every successful archive the oldest
//! files beyond `keep` are removed. Files not matching the naming scheme
//! are left alone.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use snapkeep_core::Clock;
use snapkeep_core::Deadline;
use snapkeep_core::EventLog;
use snapkeep_core::clock::compact_stamp;
use snapkeep_store_sqlite::SnapshotEngine;
use snapkeep_store_sqlite::SnapshotOutcome;

use crate::error::PublishError;
use crate::local::publish_local;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// File name prefix of archived snapshots.
const ARCHIVE_PREFIX: &str = "app-snapshot-";
/// File name suffix of archived snapshots.
const ARCHIVE_SUFFIX: &str = ".sqlite";
/// Length of a `YYYYMMDD-HHMMSS` stamp.
const STAMP_LEN: usize = 15;
/// Same-second suffixes tried before giving up.
const MAX_SAME_SECOND: u32 = 10_000;

// ============================================================================
// SECTION: Types
// ============================================================================

/// Result of one archive step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveReceipt {
    /// Archived file.
    pub path: PathBuf,
    /// Older files removed by retention.
    pub pruned: usize,
}

/// Bounded directory of timestamped snapshots.
#[derive(Clone)]
pub struct ArchiveTarget {
    /// Directory holding the archive.
    dir: PathBuf,
    /// Files retained after pruning.
    keep: usize,
    /// Time source for file names.
    clock: Arc<dyn Clock>,
    /// Event log.
    log: EventLog,
}

impl ArchiveTarget {
    /// Creates an archive in `dir` keeping the newest `keep` files.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Invalid`] when `keep` is zero.
    pub fn new(
        dir: impl Into<PathBuf>,
        keep: usize,
        clock: Arc<dyn Clock>,
        log: &EventLog,
    ) -> Result<Self, PublishError> {
        if keep == 0 {
            return Err(PublishError::Invalid("archive must keep at least one snapshot".to_string()));
        }
        Ok(Self {
            dir: dir.into(),
            keep,
            clock,
            log: log.component("publish_archive"),
        })
    }

    /// Snapshots `source` straight into a new archive file.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Snapshot`] when the snapshot fails and
    /// [`PublishError::Io`] when the name cannot be reserved or pruning fails.
    pub fn snapshot(
        &self,
        engine: &SnapshotEngine,
        deadline: &Deadline,
        source: &Path,
    ) -> Result<(SnapshotOutcome, ArchiveReceipt), PublishError> {
        let path = self.reserve()?;
        match engine.snapshot(deadline, source, &path) {
            Ok(outcome) => Ok((outcome, self.finish(path)?)),
            Err(err) => {
                let _ = fs::remove_file(&path);
                Err(err.into())
            }
        }
    }

    /// Copies an existing snapshot file into a new archive file.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] when copying or pruning fails.
    pub fn archive(&self, snapshot: &Path) -> Result<ArchiveReceipt, PublishError> {
        let path = self.reserve()?;
        if let Err(err) = publish_local(snapshot, &path) {
            let _ = fs::remove_file(&path);
            return Err(err);
        }
        self.finish(path)
    }

    /// Returns the newest archived file, if any.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Io`] when the directory cannot be listed.
    pub fn latest(&self) -> Result<Option<PathBuf>, PublishError> {
        Ok(self.archived()?.pop().map(|(_, path)| path))
    }

    /// Lists archived files oldest first.
    fn archived(&self) -> Result<Vec<((String, u32), PathBuf)>, PublishError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry?;
            if let Some(key) = entry.file_name().to_str().and_then(archive_key) {
                files.push((key, entry.path()));
            }
        }
        files.sort();
        Ok(files)
    }

    /// Claims the next free name for the current second.
    fn reserve(&self) -> Result<PathBuf, PublishError> {
        fs::create_dir_all(&self.dir)?;
        let stamp = compact_stamp(self.clock.now());
        for counter in 0 .. MAX_SAME_SECOND {
            let path = self.dir.join(archive_name(&stamp, counter));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(path),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
                Err(err) => return Err(err.into()),
            }
        }
        Err(PublishError::Invalid(format!("archive names for {stamp} exhausted")))
    }

    /// Prunes past `keep` and logs the archived file.
    fn finish(&self, path: PathBuf) -> Result<ArchiveReceipt, PublishError> {
        let files = self.archived()?;
        let excess = files.len().saturating_sub(self.keep);
        for (_, old) in files.iter().take(excess) {
            match fs::remove_file(old) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        self.log
            .info("publish_archive")
            .field("path", path.display().to_string())
            .field("pruned", excess)
            .emit();
        Ok(ArchiveReceipt {
            path,
            pruned: excess,
        })
    }
}

// ============================================================================
// SECTION: Naming
// ============================================================================

/// Builds the file name for `stamp` and a same-second counter.
fn archive_name(stamp: &str, counter: u32) -> String {
    if counter == 0 {
        format!("{ARCHIVE_PREFIX}{stamp}{ARCHIVE_SUFFIX}")
    } else {
        format!("{ARCHIVE_PREFIX}{stamp}-{counter}{ARCHIVE_SUFFIX}")
    }
}

/// Parses an archive file name into its ordering key.
fn archive_key(name: &str) -> Option<(String, u32)> {
    let rest = name.strip_prefix(ARCHIVE_PREFIX)?.strip_suffix(ARCHIVE_SUFFIX)?;
    let stamp = rest.get(.. STAMP_LEN)?;
    let digits = stamp.bytes().enumerate().all(|(at, byte)| if at == 8 { byte == b'-' } else { byte.is_ascii_digit() });
    if !digits {
        return None;
    }
    let counter = match rest.get(STAMP_LEN ..)? {
        "" => 0,
        tail => tail.strip_prefix('-')?.parse().ok()?,
    };
    Some((stamp.to_string(), counter))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "Test-only assertions.")]

    use super::*;

    #[test]
    fn keys_order_same_second_suffixes_after_the_plain_name() {
        let plain = archive_key(&archive_name("20260304-050607", 0)).unwrap();
        let second = archive_key(&archive_name("20260304-050607", 1)).unwrap();
        let tenth = archive_key(&archive_name("20260304-050607", 10)).unwrap();
        let later = archive_key(&archive_name("20260304-050608", 0)).unwrap();
        assert!(plain < second);
        assert!(second < tenth);
        assert!(tenth < later);
    }

    #[test]
    fn foreign_names_are_ignored() {
        assert_eq!(archive_key("notes.txt"), None);
        assert_eq!(archive_key("app-snapshot-latest.sqlite"), None);
        assert_eq!(archive_key("app-snapshot-20260304-050607-x.sqlite"), None);
        assert_eq!(archive_key("app-snapshot-20260304-050607.sqlite.tmp"), None);
    }
}
