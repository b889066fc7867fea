// crates/snapkeep-verifier/src/harness.rs
// ============================================================================
// Module: Verification Harness
// Description: Concurrent writers plus timed snapshot, publish, verify cycles.
// Purpose: Exercise the snapshot path under load and judge the run.
// Dependencies: snapkeep-core, snapkeep-publish, snapkeep-store-sqlite, serde
// ============================================================================

//! ## Overview
//! [`Harness::run`] spawns one thread per writer, then runs a cycle at every
//! `interval` until `duration` has elapsed. A cycle snapshots the primary,
//! publishes through the configured [`PublishTarget`], counts primary rows,
//! and inspects the published copy. Once the duration ends the writers are
//! told to stop, one final cycle runs, the writers are joined, and the run
//! is judged.
//!
//! The primary is counted after the publish step so a correct snapshot can
//! never hold more rows than the primary it was measured against.
//!
//! The current [`HarnessState`] is readable through a [`StateHandle`] and
//! every transition is logged as `harness_transition`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use serde::Serialize;
use snapkeep_core::Classify;
use snapkeep_core::Clock;
use snapkeep_core::Deadline;
use snapkeep_core::ErrorClass;
use snapkeep_core::EventLog;
use snapkeep_core::RetryPolicy;
use snapkeep_core::StopSignal;
use snapkeep_core::clock::rfc3339;
use snapkeep_publish::PublishError;
use snapkeep_publish::PublishTarget;
use snapkeep_store_sqlite::PrimaryStore;
use snapkeep_store_sqlite::SnapshotEngine;
use snapkeep_store_sqlite::SnapshotError;
use snapkeep_store_sqlite::StoreConfig;
use snapkeep_store_sqlite::StoreError;
use snapkeep_store_sqlite::inspect_copy;
use thiserror::Error;

use crate::record::SequenceAudit;
use crate::record::VerificationRecord;
use crate::record::Violation;
use crate::record::audit_sequences;
use crate::record::audit_violations;
use crate::record::judge;
use crate::writer::FaultPlan;
use crate::writer::Writer;
use crate::writer::WriterConfig;
use crate::writer::WriterStats;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Primary database file name inside the work directory.
const PRIMARY_FILE: &str = "primary.sqlite";
/// Snapshot file name inside the work directory.
const SNAPSHOT_FILE: &str = "snapshot.sqlite";
/// Scratch directory name for downloaded published copies.
const SCRATCH_DIR: &str = "scratch";

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Verification harness errors.
#[derive(Debug, Error)]
pub enum VerifierError {
    /// Invalid harness configuration.
    #[error("verifier invalid: {0}")]
    Invalid(String),
    /// Work directory or thread setup failed.
    #[error("verifier io error: {0}")]
    Io(String),
    /// Primary store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Snapshot failure.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    /// Publish failure.
    #[error(transparent)]
    Publish(#[from] PublishError),
    /// A writer thread panicked.
    #[error("verifier writer {0} panicked")]
    WriterPanicked(i64),
    /// Report serialization failed.
    #[error("verifier report error: {0}")]
    Report(String),
}

impl Classify for VerifierError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Invalid(_) => ErrorClass::Invalid,
            Self::Io(_) | Self::WriterPanicked(_) | Self::Report(_) => ErrorClass::Io,
            Self::Store(err) => err.class(),
            Self::Snapshot(err) => err.class(),
            Self::Publish(err) => err.class(),
        }
    }
}

impl From<io::Error> for VerifierError {
    fn from(error: io::Error) -> Self {
        Self::Io(error.to_string())
    }
}

// ============================================================================
// SECTION: State
// ============================================================================

/// Harness lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HarnessState {
    /// Writers are running; waiting for the next tick.
    Running,
    /// Taking and publishing a snapshot.
    Snapshotting,
    /// Counting and inspecting the published copy.
    Verifying,
    /// Writers told to stop; final cycle in progress.
    Draining,
    /// Joining writer threads.
    WaitingForWriters,
    /// Evaluating records and sequences.
    Judging,
    /// Report produced.
    Done,
}

impl HarnessState {
    /// Returns a stable label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Snapshotting => "snapshotting",
            Self::Verifying => "verifying",
            Self::Draining => "draining",
            Self::WaitingForWriters => "waiting_for_writers",
            Self::Judging => "judging",
            Self::Done => "done",
        }
    }
}

/// Shared view of a harness's current state.
#[derive(Debug, Clone)]
pub struct StateHandle {
    /// Current state.
    inner: Arc<Mutex<HarnessState>>,
}

impl StateHandle {
    /// Creates a handle starting in [`HarnessState::Running`].
    fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HarnessState::Running)),
        }
    }

    /// Returns the current state.
    #[must_use]
    pub fn get(&self) -> HarnessState {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `next` and returns the previous state.
    fn replace(&self, next: HarnessState) -> HarnessState {
        std::mem::replace(&mut *self.inner.lock().unwrap_or_else(PoisonError::into_inner), next)
    }
}

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// Settings for one verification run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    /// Writer threads.
    pub writers: usize,
    /// Rows per writer transaction.
    pub batch_size: usize,
    /// How long writers run before draining.
    pub duration: Duration,
    /// Time between cycle starts.
    pub interval: Duration,
    /// Deadline for each cycle's snapshot and publish.
    pub cycle_timeout: Duration,
    /// Directory for the primary, snapshot, and scratch files.
    pub work_dir: PathBuf,
    /// Writer retry bound and backoff.
    pub write_retry: RetryPolicy,
    /// Synthetic contention for the writers.
    pub faults: FaultPlan,
}

impl HarnessConfig {
    /// Checks the settings.
    ///
    /// # Errors
    ///
    /// Returns [`VerifierError::Invalid`] when a setting is unusable.
    pub fn validate(&self) -> Result<(), VerifierError> {
        if self.writers == 0 {
            return Err(VerifierError::Invalid("writers must be at least 1".to_string()));
        }
        if self.batch_size == 0 {
            return Err(VerifierError::Invalid("batch_size must be at least 1".to_string()));
        }
        if self.interval.is_zero() {
            return Err(VerifierError::Invalid("interval must be non-zero".to_string()));
        }
        if self.cycle_timeout.is_zero() {
            return Err(VerifierError::Invalid("cycle_timeout must be non-zero".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// SECTION: Report
// ============================================================================

/// End-of-run verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifierReport {
    /// True when no violation was found.
    pub passed: bool,
    /// True when the final cycle completed cleanly.
    pub final_passed: bool,
    /// Publish target label.
    pub target: String,
    /// Records in cycle order; the last is the final cycle.
    pub records: Vec<VerificationRecord>,
    /// Violations in discovery order.
    pub violations: Vec<Violation>,
    /// Per-writer counters.
    pub writers: Vec<WriterStats>,
    /// Per-writer sequence audit.
    pub audit: Vec<SequenceAudit>,
    /// Run wall time in milliseconds.
    pub duration_ms: u64,
}

impl VerifierReport {
    /// Renders the report as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns [`VerifierError::Report`] when serialization fails.
    pub fn to_json(&self) -> Result<String, VerifierError> {
        serde_json::to_string_pretty(self).map_err(|err| VerifierError::Report(err.to_string()))
    }
}

// ============================================================================
// SECTION: Harness
// ============================================================================

/// Counts gathered by a successful cycle.
struct CycleCounts {
    /// Primary rows after publishing.
    primary: u64,
    /// Rows in the published copy.
    snapshot: u64,
    /// Integrity verdict of the published copy.
    integrity: String,
}

/// One verification run.
pub struct Harness {
    /// Run settings.
    config: HarnessConfig,
    /// Primary store under load.
    store: PrimaryStore,
    /// Snapshot engine.
    engine: SnapshotEngine,
    /// Publish target.
    target: PublishTarget,
    /// Event log.
    log: EventLog,
    /// Time source.
    clock: Arc<dyn Clock>,
    /// Current state.
    state: StateHandle,
}

impl Harness {
    /// Creates a harness.
    #[must_use]
    pub fn new(
        config: HarnessConfig,
        store: PrimaryStore,
        engine: SnapshotEngine,
        target: PublishTarget,
        log: &EventLog,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            engine,
            target,
            log: log.component("verifier"),
            clock,
            state: StateHandle::new(),
        }
    }

    /// Returns a handle observing the harness state.
    #[must_use]
    pub fn state(&self) -> StateHandle {
        self.state.clone()
    }

    /// Runs the workload, the cycles, and the judgement.
    ///
    /// # Errors
    ///
    /// Returns [`VerifierError`] for invalid settings, setup failures, a
    /// panicked writer, or a failed sequence query. Cycle failures are
    /// recorded in the report instead.
    pub fn run(&self) -> Result<VerifierReport, VerifierError> {
        self.config.validate()?;
        fs::create_dir_all(self.config.work_dir.join(SCRATCH_DIR))?;
        let started = Instant::now();
        let stop = StopSignal::new();
        let handles = self.spawn_writers(&stop)?;
        self.log
            .info("harness_started")
            .field("writers", self.config.writers)
            .field("target", self.target.kind())
            .field("duration_ms", millis(self.config.duration))
            .emit();

        let mut records = Vec::new();
        let mut tick = self.config.interval;
        while tick <= self.config.duration {
            wait_until(started, tick);
            records.push(self.run_cycle(records.len(), false));
            tick = self.next_tick(tick, started.elapsed());
        }
        wait_until(started, self.config.duration);

        self.transition(HarnessState::Draining);
        stop.stop();
        records.push(self.run_cycle(records.len(), true));

        self.transition(HarnessState::WaitingForWriters);
        let writers = join_writers(handles)?;

        self.transition(HarnessState::Judging);
        let mut violations = judge(&records);
        let audit = audit_sequences(&self.store.writer_sequences()?, &writers);
        violations.extend(audit_violations(&audit));
        let final_passed = records.last().is_some_and(VerificationRecord::is_clean);

        let report = VerifierReport {
            passed: violations.is_empty() && final_passed,
            final_passed,
            target: self.target.kind().to_string(),
            records,
            violations,
            writers,
            audit,
            duration_ms: millis(started.elapsed()),
        };
        self.transition(HarnessState::Done);
        self.log
            .info("harness_finished")
            .field("passed", report.passed)
            .field("cycles", report.records.len())
            .field("violations", report.violations.len())
            .emit();
        Ok(report)
    }

    /// Starts one thread per writer; ids start at 1.
    fn spawn_writers(&self, stop: &StopSignal) -> Result<Vec<(i64, JoinHandle<WriterStats>)>, VerifierError> {
        let writer_config = WriterConfig {
            batch_size: self.config.batch_size,
            retry: self.config.write_retry,
            faults: self.config.faults,
        };
        let mut handles = Vec::with_capacity(self.config.writers);
        for index in 0 .. self.config.writers {
            let id = i64::try_from(index + 1)
                .map_err(|_| VerifierError::Invalid(format!("writer index {index} out of range")))?;
            let writer = Writer::new(
                id,
                self.store.clone(),
                writer_config,
                Arc::clone(&self.clock),
                &self.log,
                stop.clone(),
            );
            let spawned = thread::Builder::new().name(format!("snapkeep-writer-{id}")).spawn(move || writer.run());
            match spawned {
                Ok(handle) => handles.push((id, handle)),
                Err(err) => {
                    stop.stop();
                    let _ = join_writers(handles);
                    return Err(err.into());
                }
            }
        }
        Ok(handles)
    }

    /// Runs one cycle and records its outcome.
    fn run_cycle(&self, index: usize, is_final: bool) -> VerificationRecord {
        let started = Instant::now();
        let timestamp = rfc3339(self.clock.now());
        let result = self.cycle_counts(is_final);
        let duration_ms = millis(started.elapsed());
        if !is_final {
            self.transition(HarnessState::Running);
        }
        match result {
            Ok(counts) => {
                self.log
                    .debug("harness_cycle")
                    .field("index", index)
                    .field("final", is_final)
                    .field("primary_count", counts.primary)
                    .field("snapshot_count", counts.snapshot)
                    .field("duration_ms", duration_ms)
                    .emit();
                VerificationRecord {
                    index,
                    timestamp,
                    duration_ms,
                    primary_count: Some(counts.primary),
                    snapshot_count: Some(counts.snapshot),
                    integrity: Some(counts.integrity),
                    error: None,
                    error_class: None,
                    is_final,
                }
            }
            Err(err) => {
                let class = err.class();
                self.log
                    .warn("harness_cycle_failed")
                    .field("index", index)
                    .field("final", is_final)
                    .field("class", class.label())
                    .error(&err)
                    .emit();
                VerificationRecord {
                    index,
                    timestamp,
                    duration_ms,
                    primary_count: None,
                    snapshot_count: None,
                    integrity: None,
                    error: Some(err.to_string()),
                    error_class: Some(class),
                    is_final,
                }
            }
        }
    }

    /// Snapshots, publishes, and measures; the final cycle stays in `Draining`.
    fn cycle_counts(&self, is_final: bool) -> Result<CycleCounts, VerifierError> {
        let deadline = Deadline::after(self.config.cycle_timeout);
        let snapshot_path = self.config.work_dir.join(SNAPSHOT_FILE);
        if !is_final {
            self.transition(HarnessState::Snapshotting);
        }
        self.engine.snapshot(&deadline, self.store.path(), &snapshot_path)?;
        self.target.publish_snapshot(&deadline, &snapshot_path)?;
        if !is_final {
            self.transition(HarnessState::Verifying);
        }
        let primary = self.store.count_rows()?;
        let copy = self.target.published_copy(&snapshot_path, &self.config.work_dir.join(SCRATCH_DIR))?;
        let inspection = inspect_copy(&copy)?;
        Ok(CycleCounts {
            primary,
            snapshot: inspection.rows,
            integrity: inspection.integrity,
        })
    }

    /// Returns the first tick after `elapsed`, skipping ticks a slow cycle overran.
    fn next_tick(&self, tick: Duration, elapsed: Duration) -> Duration {
        let mut next = tick.saturating_add(self.config.interval);
        let mut skipped = 0_u64;
        while next < elapsed {
            next = next.saturating_add(self.config.interval);
            skipped += 1;
        }
        if skipped > 0 {
            self.log.warn("harness_ticks_skipped").field("skipped", skipped).emit();
        }
        next
    }

    /// Moves to `next` and logs the transition.
    fn transition(&self, next: HarnessState) {
        let previous = self.state.replace(next);
        self.log
            .debug("harness_transition")
            .field("from", previous.label())
            .field("to", next.label())
            .emit();
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Opens an empty primary store at `<work_dir>/primary.sqlite`.
///
/// Any previous database and its WAL files are removed first. Every other
/// setting comes from `base`.
///
/// # Errors
///
/// Returns [`VerifierError`] when old files cannot be removed or the store
/// cannot be opened.
pub fn fresh_store(work_dir: &Path, base: &StoreConfig) -> Result<PrimaryStore, VerifierError> {
    fs::create_dir_all(work_dir)?;
    let path = work_dir.join(PRIMARY_FILE);
    for suffix in ["", "-wal", "-shm"] {
        let mut name = path.clone().into_os_string();
        name.push(suffix);
        match fs::remove_file(PathBuf::from(name)) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    let config = StoreConfig {
        path,
        ..base.clone()
    };
    Ok(PrimaryStore::open(config)?)
}

/// Joins every writer, reporting the first panic after all have finished.
fn join_writers(handles: Vec<(i64, JoinHandle<WriterStats>)>) -> Result<Vec<WriterStats>, VerifierError> {
    let mut stats = Vec::with_capacity(handles.len());
    let mut panicked = None;
    for (id, handle) in handles {
        match handle.join() {
            Ok(writer) => stats.push(writer),
            Err(_) => {
                panicked.get_or_insert(id);
            }
        }
    }
    panicked.map_or(Ok(stats), |id| Err(VerifierError::WriterPanicked(id)))
}

/// Sleeps until `offset` after `started`.
fn wait_until(started: Instant, offset: Duration) {
    let remaining = offset.saturating_sub(started.elapsed());
    if !remaining.is_zero() {
        thread::sleep(remaining);
    }
}

/// Converts a duration to whole milliseconds, saturating.
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "Test-only assertions.")]

    use super::*;

    fn config(work_dir: PathBuf) -> HarnessConfig {
        HarnessConfig {
            writers: 2,
            batch_size: 10,
            duration: Duration::from_millis(50),
            interval: Duration::from_millis(20),
            cycle_timeout: Duration::from_secs(5),
            work_dir,
            write_retry: RetryPolicy::default(),
            faults: FaultPlan::default(),
        }
    }

    #[test]
    fn validate_rejects_unusable_settings() {
        let base = config(PathBuf::from("work"));
        assert!(base.validate().is_ok());
        for broken in [
            HarnessConfig {
                writers: 0,
                ..base.clone()
            },
            HarnessConfig {
                batch_size: 0,
                ..base.clone()
            },
            HarnessConfig {
                interval: Duration::ZERO,
                ..base.clone()
            },
            HarnessConfig {
                cycle_timeout: Duration::ZERO,
                ..base.clone()
            },
        ] {
            assert!(matches!(broken.validate(), Err(VerifierError::Invalid(_))));
        }
    }

    #[test]
    fn fresh_store_discards_previous_rows() {
        let temp = tempfile::TempDir::new().unwrap();
        let base = StoreConfig {
            seed_rows: 3,
            ..StoreConfig::new(temp.path().join("ignored.sqlite"))
        };
        let first = fresh_store(temp.path(), &base).unwrap();
        first.execute("DELETE FROM events WHERE seq = 1", []).unwrap();
        assert_eq!(first.count_rows().unwrap(), 2);
        first.close();
        drop(first);

        let second = fresh_store(temp.path(), &base).unwrap();
        assert_eq!(second.count_rows().unwrap(), 3);
        assert_eq!(second.path(), temp.path().join(PRIMARY_FILE));
    }

    #[test]
    fn state_handle_reports_transitions() {
        let handle = StateHandle::new();
        assert_eq!(handle.get(), HarnessState::Running);
        assert_eq!(handle.replace(HarnessState::Judging), HarnessState::Running);
        assert_eq!(handle.clone().get(), HarnessState::Judging);
        assert_eq!(HarnessState::WaitingForWriters.label(), "waiting_for_writers");
    }

    #[test]
    fn ticks_skip_overrun_intervals() {
        let temp = tempfile::TempDir::new().unwrap();
        let store = PrimaryStore::open(StoreConfig::new(temp.path().join("db.sqlite"))).unwrap();
        let harness = Harness::new(
            config(temp.path().to_path_buf()),
            store,
            SnapshotEngine::new(snapkeep_store_sqlite::SnapshotConfig::default(), &EventLog::noop()),
            PublishTarget::Noop,
            &EventLog::noop(),
            Arc::new(snapkeep_core::SystemClock),
        );
        let interval = Duration::from_millis(20);
        assert_eq!(harness.next_tick(interval, Duration::from_millis(25)), Duration::from_millis(40));
        assert_eq!(harness.next_tick(interval, Duration::from_millis(65)), Duration::from_millis(80));
    }
}
