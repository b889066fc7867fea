// crates/snapkeep-publish/src/target.rs
// ============================================================================
// Module: Publish Target
// Description: Startup restore, periodic backup, and shutdown snapshot.
// Purpose: Drive the backup lifecycle through one closed set of targets.
// Dependencies: snapkeep-core, snapkeep-store-sqlite, rand, serde
// ============================================================================

//! ## Overview
//! A [`PublishTarget`] is chosen once at startup:
//! - `Noop` takes and keeps nothing.
//! - `Archive` keeps a bounded set of timestamped snapshot files.
//! - `Local` installs each snapshot at one fixed path.
//! - `Remote` runs the two-phase object-store publish and restores from
//!   the current object on startup.
//!
//! [`PeriodicBackup`] runs [`BackupJob::run_once`] on a timer thread until
//! stopped. Failures are logged and the timer keeps going.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use snapkeep_core::Classify;
use snapkeep_core::Deadline;
use snapkeep_core::EventLog;
use snapkeep_core::StopSignal;
use snapkeep_store_sqlite::SnapshotEngine;
use snapkeep_store_sqlite::SnapshotOutcome;

use crate::archive::ArchiveReceipt;
use crate::archive::ArchiveTarget;
use crate::error::PublishError;
use crate::local::LocalPublisher;
use crate::local::LocalReceipt;
use crate::remote::DownloadOutcome;
use crate::remote::PublishReceipt;
use crate::remote::RemotePublisher;

// ============================================================================
// SECTION: Targets
// ============================================================================

/// Where snapshots go once taken.
#[derive(Clone)]
pub enum PublishTarget {
    /// Snapshots are neither taken nor kept by the lifecycle.
    Noop,
    /// Bounded directory of timestamped snapshot files.
    Archive(ArchiveTarget),
    /// Atomic install at a fixed local path.
    Local(LocalPublisher),
    /// Two-phase object-store publish.
    Remote(RemotePublisher),
}

/// What a publish step did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum PublishReport {
    /// Nothing was published.
    Noop,
    /// Archived locally.
    Archive(ArchiveReceipt),
    /// Installed locally.
    Local(LocalReceipt),
    /// Published remotely.
    Remote(PublishReceipt),
}

/// Result of one snapshot-then-publish backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupReport {
    /// Snapshot step summary; absent when the target takes none.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<SnapshotOutcome>,
    /// Publish step summary.
    pub publish: PublishReport,
}

impl PublishTarget {
    /// Returns the target label.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Noop => "noop",
            Self::Archive(_) => "archive",
            Self::Local(_) => "local",
            Self::Remote(_) => "remote",
        }
    }

    /// Prepares the database file before the store opens it.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] when the remote restore fails.
    pub fn on_startup(&self, db_path: &Path) -> Result<Option<DownloadOutcome>, PublishError> {
        match self {
            Self::Noop | Self::Archive(_) | Self::Local(_) => Ok(None),
            Self::Remote(remote) => remote.download_if_needed(db_path).map(Some),
        }
    }

    /// Publishes an existing snapshot file.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] from the underlying publisher.
    pub fn publish_snapshot(&self, deadline: &Deadline, snapshot: &Path) -> Result<PublishReport, PublishError> {
        deadline.check()?;
        match self {
            Self::Noop => Ok(PublishReport::Noop),
            Self::Archive(archive) => archive.archive(snapshot).map(PublishReport::Archive),
            Self::Local(local) => local.publish(snapshot).map(PublishReport::Local),
            Self::Remote(remote) => remote.publish(deadline, snapshot, None).map(PublishReport::Remote),
        }
    }

    /// Returns a local path holding what readers of the target now see.
    ///
    /// `Noop` readers see the snapshot itself. `Remote` downloads the
    /// current object into `scratch_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] when the download fails or the archive is
    /// empty.
    pub fn published_copy(&self, snapshot: &Path, scratch_dir: &Path) -> Result<PathBuf, PublishError> {
        match self {
            Self::Noop => Ok(snapshot.to_path_buf()),
            Self::Archive(archive) => archive
                .latest()?
                .ok_or_else(|| PublishError::Invalid("snapshot archive is empty".to_string())),
            Self::Local(local) => Ok(local.dest().to_path_buf()),
            Self::Remote(remote) => {
                let dest = scratch_dir.join("published-current.sqlite");
                remote.download_current(&dest)?;
                Ok(dest)
            }
        }
    }

    /// Snapshots `source` and publishes the result. `Noop` does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Snapshot`] when the snapshot fails, or the
    /// publisher's error.
    pub fn backup(
        &self,
        engine: &SnapshotEngine,
        source: &Path,
        staging_dir: &Path,
        deadline: &Deadline,
    ) -> Result<BackupReport, PublishError> {
        match self {
            Self::Noop => {
                deadline.check()?;
                Ok(BackupReport {
                    snapshot: None,
                    publish: PublishReport::Noop,
                })
            }
            Self::Archive(archive) => {
                let (snapshot, receipt) = archive.snapshot(engine, deadline, source)?;
                Ok(BackupReport {
                    snapshot: Some(snapshot),
                    publish: PublishReport::Archive(receipt),
                })
            }
            Self::Local(_) | Self::Remote(_) => {
                let nonce: u64 = rand::thread_rng().r#gen();
                let staged = staging_dir.join(format!("pending-{nonce:016x}.sqlite"));
                let result = engine
                    .snapshot(deadline, source, &staged)
                    .map_err(PublishError::from)
                    .and_then(|snapshot| {
                        self.publish_snapshot(deadline, &staged).map(|publish| BackupReport {
                            snapshot: Some(snapshot),
                            publish,
                        })
                    });
                let _ = fs::remove_file(&staged);
                result
            }
        }
    }

    /// Takes the mandatory final snapshot before the store closes.
    ///
    /// # Errors
    ///
    /// Same as [`PublishTarget::backup`].
    pub fn on_shutdown(
        &self,
        engine: &SnapshotEngine,
        source: &Path,
        staging_dir: &Path,
        deadline: &Deadline,
    ) -> Result<BackupReport, PublishError> {
        self.backup(engine, source, staging_dir, deadline)
    }
}

// ============================================================================
// SECTION: Backup Job
// ============================================================================

/// Everything one backup run needs.
#[derive(Clone)]
pub struct BackupJob {
    /// Publish target.
    pub target: PublishTarget,
    /// Snapshot engine.
    pub engine: SnapshotEngine,
    /// Live database path.
    pub source: PathBuf,
    /// Directory for staged snapshots.
    pub staging_dir: PathBuf,
    /// Per-run timeout.
    pub timeout: Duration,
    /// Event log.
    pub log: EventLog,
}

impl BackupJob {
    /// Runs one backup under the job timeout and `stop`.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] from [`PublishTarget::backup`].
    pub fn run_once(&self, stop: &StopSignal) -> Result<BackupReport, PublishError> {
        let deadline = Deadline::after(self.timeout).with_stop(stop.clone());
        self.target.backup(&self.engine, &self.source, &self.staging_dir, &deadline)
    }
}

// ============================================================================
// SECTION: Periodic Backup
// ============================================================================

/// Timer thread running a [`BackupJob`] at a fixed interval.
pub struct PeriodicBackup {
    /// Stop flag shared with the thread.
    stop: StopSignal,
    /// Thread handle; yields the number of runs attempted.
    handle: Option<JoinHandle<u64>>,
}

impl PeriodicBackup {
    /// Starts the timer; the first run happens after one interval.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Invalid`] for a zero interval and
    /// [`PublishError::Io`] when the thread cannot be spawned.
    pub fn start(job: BackupJob, interval: Duration) -> Result<Self, PublishError> {
        if interval.is_zero() {
            return Err(PublishError::Invalid("periodic backup interval must be non-zero".to_string()));
        }
        let stop = StopSignal::new();
        let thread_stop = stop.clone();
        let log = job.log.component("periodic_backup");
        let handle = thread::Builder::new()
            .name("snapkeep-periodic-backup".to_string())
            .spawn(move || {
                let mut runs = 0_u64;
                while !thread_stop.wait_timeout(interval) {
                    runs += 1;
                    match job.run_once(&thread_stop) {
                        Ok(report) => log
                            .info("periodic_backup")
                            .field("run", runs)
                            .field("target", job.target.kind())
                            .field("bytes", report.snapshot.as_ref().map_or(0, |snapshot| snapshot.bytes))
                            .emit(),
                        Err(err) => log
                            .error("periodic_backup_failed")
                            .field("run", runs)
                            .field("class", err.class().label())
                            .error(&err)
                            .emit(),
                    }
                }
                runs
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stops the timer and waits for it; returns the runs attempted.
    pub fn stop(mut self) -> u64 {
        self.shutdown()
    }

    /// Signals and joins the thread.
    fn shutdown(&mut self) -> u64 {
        self.stop.stop();
        self.handle.take().map_or(0, |handle| handle.join().unwrap_or(0))
    }
}

impl Drop for PeriodicBackup {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
