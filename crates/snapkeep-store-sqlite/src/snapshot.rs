// crates/snapkeep-store-sqlite/src/snapshot.rs
// ============================================================================
// Module: Snapshot Engine
// Description: Point-in-time copies of a live SQLite database.
// Purpose: Produce complete, consistent snapshot files without stopping writers.
// Dependencies: snapkeep-core, rand, rusqlite, serde, thiserror
// ============================================================================

//! ## Overview
//! [`SnapshotEngine::snapshot`] opens a dedicated connection to the live
//! database with its own lock-wait budget, folds the WAL back into the main
//! file (best effort), and clones the database with `VACUUM INTO` into a
//! uniquely named staging file beside the destination. The clone reflects a
//! single commit boundary. Only after it succeeds is the staging file
//! fsynced and renamed over the destination, so the destination is always
//! absent, the previous snapshot, or the new one in full.
//!
//! Contention is retried with linear backoff; anything else aborts at once.
//! The caller's [`Deadline`] interrupts an in-flight clone through the
//! connection's interrupt handle and cuts backoff sleeps short.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs::File;
use std::path::Path;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::mpsc::RecvTimeoutError;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use rand::Rng;
use rusqlite::Connection;
use rusqlite::ErrorCode;
use rusqlite::OpenFlags;
use serde::Deserialize;
use serde::Serialize;
use snapkeep_core::Cancelled;
use snapkeep_core::Classify;
use snapkeep_core::Deadline;
use snapkeep_core::ErrorClass;
use snapkeep_core::EventLog;
use snapkeep_core::RetryError;
use snapkeep_core::RetryPolicy;
use snapkeep_core::retry_with_backoff;
use thiserror::Error;

use crate::store::StoreError;
use crate::store::ensure_parent_dir;
use crate::store::is_contention;
use crate::store::validate_store_path;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// How often the deadline watchdog polls while a clone runs.
const WATCHDOG_TICK: Duration = Duration::from_millis(10);
/// Default attempt bound.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default backoff base in milliseconds.
const DEFAULT_BASE_BACKOFF_MS: u64 = 200;
/// Default lock-wait budget for the dedicated connection.
const DEFAULT_LOCK_WAIT_MS: u64 = 5_000;

// ============================================================================
// SECTION: Config
// ============================================================================

/// Snapshot engine settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotConfig {
    /// Attempts including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Backoff base; attempt `n` sleeps `base * n`.
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    /// Busy timeout of the dedicated snapshot connection.
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,
    /// Whether to checkpoint the WAL before cloning.
    #[serde(default = "default_checkpoint")]
    pub checkpoint: bool,
}

/// Returns the default attempt bound.
const fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

/// Returns the default backoff base.
const fn default_base_backoff_ms() -> u64 {
    DEFAULT_BASE_BACKOFF_MS
}

/// Returns the default lock-wait budget.
const fn default_lock_wait_ms() -> u64 {
    DEFAULT_LOCK_WAIT_MS
}

/// Checkpointing is on unless disabled.
const fn default_checkpoint() -> bool {
    true
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_backoff_ms: DEFAULT_BASE_BACKOFF_MS,
            lock_wait_ms: DEFAULT_LOCK_WAIT_MS,
            checkpoint: true,
        }
    }
}

impl SnapshotConfig {
    /// Returns the retry policy.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.base_backoff_ms))
    }

    /// Validates limits.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Invalid`] when a limit is zero.
    pub fn validate(&self) -> Result<(), SnapshotError> {
        if self.max_attempts == 0 {
            return Err(SnapshotError::Invalid("max_attempts must be greater than zero".to_string()));
        }
        if self.lock_wait_ms == 0 {
            return Err(SnapshotError::Invalid("lock_wait_ms must be greater than zero".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Snapshot failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    /// Contention persisted through every attempt.
    #[error("snapshot contention after {attempts} attempts: {message}")]
    Contention {
        /// Attempts made.
        attempts: u32,
        /// Last contention message.
        message: String,
    },
    /// Non-retryable engine failure.
    #[error("snapshot db error: {0}")]
    Db(String),
    /// Filesystem failure around the staging or destination file.
    #[error("snapshot io error: {0}")]
    Io(String),
    /// Invalid path or configuration.
    #[error("snapshot invalid: {0}")]
    Invalid(String),
    /// The deadline fired or a stop was requested.
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl Classify for SnapshotError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Contention {
                ..
            } => ErrorClass::Contention,
            Self::Db(_) | Self::Io(_) => ErrorClass::Io,
            Self::Invalid(_) => ErrorClass::Invalid,
            Self::Cancelled(_) => ErrorClass::Cancelled,
        }
    }
}

impl From<StoreError> for SnapshotError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Io(message) => Self::Io(message),
            StoreError::Invalid(message) => Self::Invalid(message),
            StoreError::Busy(message) | StoreError::PoolTimeout(message) => Self::Contention {
                attempts: 1,
                message,
            },
            StoreError::Db(message) => Self::Db(message),
        }
    }
}

/// Failure of a single clone attempt.
#[derive(Debug)]
enum AttemptError {
    /// Busy or locked.
    Contention(String),
    /// Interrupted because the deadline fired.
    Interrupted(Cancelled),
    /// Any other engine or filesystem failure.
    Fatal(SnapshotError),
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Contention(message) => write!(f, "contention: {message}"),
            Self::Interrupted(cancelled) => write!(f, "{cancelled}"),
            Self::Fatal(error) => write!(f, "{error}"),
        }
    }
}

// ============================================================================
// SECTION: Outcome
// ============================================================================

/// Successful snapshot summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotOutcome {
    /// Installed destination path.
    pub path: PathBuf,
    /// Attempts used, including the successful one.
    pub attempts: u32,
    /// Size of the installed file.
    pub bytes: u64,
    /// Wall time spent, in milliseconds.
    pub duration_ms: u64,
}

/// A finished clone waiting to be installed at its destination.
///
/// Dropping it without calling [`StagedSnapshot::install`] removes the
/// staging file.
#[derive(Debug)]
pub struct StagedSnapshot {
    /// Staging file beside the destination.
    staging: PathBuf,
    /// Final destination.
    dest: PathBuf,
    /// Attempts the clone took.
    attempts: u32,
    /// When the snapshot call started.
    started: Instant,
    /// Set once the staging file has been renamed away.
    installed: bool,
}

impl StagedSnapshot {
    /// Returns the staging file path.
    #[must_use]
    pub fn staging_path(&self) -> &Path {
        &self.staging
    }

    /// Returns the destination path.
    #[must_use]
    pub fn dest_path(&self) -> &Path {
        &self.dest
    }

    /// Fsyncs the staging file and renames it over the destination.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Io`] when the sync or rename fails; the
    /// staging file is removed in that case.
    pub fn install(mut self) -> Result<SnapshotOutcome, SnapshotError> {
        let bytes = sync_file(&self.staging)?;
        std::fs::rename(&self.staging, &self.dest)
            .map_err(|err| SnapshotError::Io(format!("rename into place failed: {err}")))?;
        self.installed = true;
        sync_parent_dir(&self.dest);
        Ok(SnapshotOutcome {
            path: self.dest.clone(),
            attempts: self.attempts,
            bytes,
            duration_ms: elapsed_ms(self.started),
        })
    }
}

impl Drop for StagedSnapshot {
    fn drop(&mut self) {
        if !self.installed {
            let _ = std::fs::remove_file(&self.staging);
        }
    }
}

// ============================================================================
// SECTION: Engine
// ============================================================================

/// Produces point-in-time snapshot files.
#[derive(Clone)]
pub struct SnapshotEngine {
    /// Engine settings.
    config: SnapshotConfig,
    /// Structured event log.
    log: EventLog,
}

impl SnapshotEngine {
    /// Creates an engine.
    #[must_use]
    pub fn new(config: SnapshotConfig, log: &EventLog) -> Self {
        Self {
            config,
            log: log.component("snapshot"),
        }
    }

    /// Returns the engine settings.
    #[must_use]
    pub const fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    /// Snapshots `source` into `dest`, replacing any previous file atomically.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Contention`] when retries are exhausted,
    /// [`SnapshotError::Cancelled`] when `deadline` fires, and
    /// [`SnapshotError::Db`]/[`SnapshotError::Io`] on other failures.
    pub fn snapshot(
        &self,
        deadline: &Deadline,
        source: &Path,
        dest: &Path,
    ) -> Result<SnapshotOutcome, SnapshotError> {
        let staged = self.stage(deadline, source, dest)?;
        match staged.install() {
            Ok(outcome) => {
                self.log
                    .info("snapshot_complete")
                    .field("path", dest.display().to_string())
                    .field("attempts", outcome.attempts)
                    .field("bytes", outcome.bytes)
                    .field("duration_ms", outcome.duration_ms)
                    .emit();
                Ok(outcome)
            }
            Err(err) => {
                self.log
                    .error("snapshot_failed")
                    .field("path", dest.display().to_string())
                    .field("class", err.class().label())
                    .error(&err)
                    .emit();
                Err(err)
            }
        }
    }

    /// Clones `source` into a staging file beside `dest` without installing it.
    ///
    /// # Errors
    ///
    /// Same as [`SnapshotEngine::snapshot`], minus install failures.
    pub fn stage(
        &self,
        deadline: &Deadline,
        source: &Path,
        dest: &Path,
    ) -> Result<StagedSnapshot, SnapshotError> {
        let started = Instant::now();
        self.config.validate()?;
        validate_store_path(dest)?;
        if !source.is_file() {
            return Err(SnapshotError::Invalid(format!(
                "source database not found: {}",
                source.display()
            )));
        }
        ensure_parent_dir(dest)?;
        deadline.check()?;
        let connection = self.open_source(source)?;
        let policy = self.config.retry_policy();
        let result = retry_with_backoff(
            &policy,
            deadline,
            |err: &AttemptError| matches!(err, AttemptError::Contention(_)),
            |attempt| {
                self.log
                    .debug("snapshot_attempt")
                    .field("attempt", attempt)
                    .field("source", source.display().to_string())
                    .emit();
                self.attempt(&connection, deadline, dest).map(|staging| (staging, attempt))
            },
            |attempt, backoff, err| {
                self.log
                    .warn("snapshot_retry")
                    .field("attempt", attempt)
                    .field("backoff_ms", u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX))
                    .error(err)
                    .emit();
            },
        );
        match result {
            Ok((staging, attempts)) => Ok(StagedSnapshot {
                staging,
                dest: dest.to_path_buf(),
                attempts,
                started,
                installed: false,
            }),
            Err(err) => {
                let err = map_retry_error(err);
                self.log
                    .error("snapshot_failed")
                    .field("path", dest.display().to_string())
                    .field("class", err.class().label())
                    .error(&err)
                    .emit();
                Err(err)
            }
        }
    }

    /// Opens the dedicated snapshot connection.
    fn open_source(&self, source: &Path) -> Result<Connection, SnapshotError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let connection = Connection::open_with_flags(source, flags)
            .map_err(|err| SnapshotError::Db(err.to_string()))?;
        connection
            .busy_timeout(Duration::from_millis(self.config.lock_wait_ms))
            .map_err(|err| SnapshotError::Db(err.to_string()))?;
        Ok(connection)
    }

    /// One checkpoint-and-clone attempt into a fresh staging file.
    fn attempt(
        &self,
        connection: &Connection,
        deadline: &Deadline,
        dest: &Path,
    ) -> Result<PathBuf, AttemptError> {
        if self.config.checkpoint {
            self.checkpoint(connection);
        }
        let staging = staging_path(dest);
        let target = staging.to_string_lossy().into_owned();
        let result = run_interruptible(connection, deadline, || {
            connection.execute("VACUUM INTO ?1", [target.as_str()]).map(|_| ())
        });
        match result {
            Ok(()) => Ok(staging),
            Err(err) => {
                let _ = std::fs::remove_file(&staging);
                if let Err(cancelled) = deadline.check() {
                    return Err(AttemptError::Interrupted(cancelled));
                }
                if is_contention(&err) {
                    Err(AttemptError::Contention(err.to_string()))
                } else if err.sqlite_error_code() == Some(ErrorCode::OperationInterrupted) {
                    Err(AttemptError::Fatal(SnapshotError::Db(format!("clone interrupted: {err}"))))
                } else {
                    Err(AttemptError::Fatal(SnapshotError::Db(err.to_string())))
                }
            }
        }
    }

    /// Folds the WAL into the main file; failures are logged and ignored.
    fn checkpoint(&self, connection: &Connection) {
        let result = connection.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
        });
        match result {
            Ok((busy, log_frames, checkpointed)) => {
                self.log
                    .debug("snapshot_checkpoint")
                    .field("busy", busy != 0)
                    .field("log_frames", log_frames)
                    .field("checkpointed_frames", checkpointed)
                    .emit();
            }
            Err(err) => {
                self.log.warn("snapshot_checkpoint_failed").error(&err).emit();
            }
        }
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Runs `operation` while a watchdog interrupts `connection` on cancellation.
fn run_interruptible<T>(
    connection: &Connection,
    deadline: &Deadline,
    operation: impl FnOnce() -> rusqlite::Result<T>,
) -> rusqlite::Result<T> {
    let handle = connection.get_interrupt_handle();
    let (done_tx, done_rx) = mpsc::channel::<()>();
    thread::scope(|scope| {
        scope.spawn(move || {
            loop {
                match done_rx.recv_timeout(WATCHDOG_TICK) {
                    Err(RecvTimeoutError::Timeout) => {
                        if deadline.check().is_err() {
                            handle.interrupt();
                            return;
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                }
            }
        });
        let result = operation();
        drop(done_tx);
        result
    })
}

/// Maps the retry loop's outcome onto [`SnapshotError`].
fn map_retry_error(error: RetryError<AttemptError>) -> SnapshotError {
    match error {
        RetryError::Cancelled(cancelled)
        | RetryError::Fatal {
            error: AttemptError::Interrupted(cancelled),
            ..
        }
        | RetryError::Exhausted {
            last: AttemptError::Interrupted(cancelled),
            ..
        } => SnapshotError::Cancelled(cancelled),
        RetryError::Exhausted {
            attempts,
            last,
        } => SnapshotError::Contention {
            attempts,
            message: last.to_string(),
        },
        RetryError::Fatal {
            error: AttemptError::Fatal(error),
            ..
        } => error,
        RetryError::Fatal {
            error: AttemptError::Contention(message),
            attempt,
        } => SnapshotError::Contention {
            attempts: attempt,
            message,
        },
    }
}

/// Returns a fresh, collision-free staging path beside `dest`.
fn staging_path(dest: &Path) -> PathBuf {
    let name = dest.file_name().map_or_else(
        || "snapshot".to_string(),
        |name| name.to_string_lossy().into_owned(),
    );
    let nonce: u64 = rand::thread_rng().r#gen();
    dest.with_file_name(format!(".{name}.staging-{}-{nonce:016x}", std::process::id()))
}

/// Fsyncs a file and returns its size.
fn sync_file(path: &Path) -> Result<u64, SnapshotError> {
    let file = File::open(path).map_err(|err| SnapshotError::Io(err.to_string()))?;
    file.sync_all().map_err(|err| SnapshotError::Io(err.to_string()))?;
    let metadata = file.metadata().map_err(|err| SnapshotError::Io(err.to_string()))?;
    Ok(metadata.len())
}

/// Best-effort fsync of the directory holding `path` so the rename is durable.
fn sync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent()
        && let Ok(dir) = File::open(parent)
    {
        let _ = dir.sync_all();
    }
}

/// Milliseconds since `started`, saturating.
fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use snapkeep_core::CancelReason;

    #[test]
    fn staging_paths_are_unique_siblings() {
        let dest = Path::new("/data/snapshots/app.sqlite");
        let first = staging_path(dest);
        let second = staging_path(dest);
        assert_ne!(first, second);
        assert_eq!(first.parent(), dest.parent());
        assert!(first.file_name().is_some_and(|name| {
            name.to_string_lossy().starts_with(".app.sqlite.staging-")
        }));
    }

    #[test]
    fn interrupted_attempt_maps_to_cancelled() {
        let cancelled = Cancelled {
            reason: CancelReason::DeadlineExceeded,
        };
        let mapped = map_retry_error(RetryError::Fatal {
            attempt: 1,
            error: AttemptError::Interrupted(cancelled),
        });
        assert_eq!(mapped, SnapshotError::Cancelled(cancelled));
        assert_eq!(mapped.class(), ErrorClass::Cancelled);
    }

    #[test]
    fn exhausted_contention_reports_attempts() {
        let mapped = map_retry_error(RetryError::Exhausted {
            attempts: 3,
            last: AttemptError::Contention("database is locked".to_string()),
        });
        assert!(matches!(mapped, SnapshotError::Contention { attempts: 3, .. }));
        assert!(mapped.class().is_transient());
    }
}
