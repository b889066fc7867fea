// crates/snapkeep-verifier/src/writer.rs
// ============================================================================
// Module: Write Workload
// Description: Batched writer threads with retry-with-rewind.
// Purpose: Load the primary store while keeping per-writer sequences gapless.
// Dependencies: snapkeep-core, snapkeep-store-sqlite, serde
// ============================================================================

//! ## Overview
//! Each writer owns a [`SequenceCursor`] and appends `batch_size` rows per
//! `BEGIN IMMEDIATE` transaction.
//!
//! - Begin contention is retried with backoff.
//! - A contended row rewinds the cursor by one and retries the same number.
//! - Too many consecutive row failures, a contended commit, or any other
//!   failure rolls the batch back, rewinds the cursor to the batch start,
//!   and retries the batch as a unit.
//!
//! Only committed numbers ever advance the cursor, so committed rows per
//! writer are exactly `1..=n`. A [`FaultPlan`] injects synthetic contention
//! at begin, insert, and commit for deterministic tests.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use snapkeep_core::Clock;
use snapkeep_core::Deadline;
use snapkeep_core::EventLog;
use snapkeep_core::RetryError;
use snapkeep_core::RetryPolicy;
use snapkeep_core::SequenceCursor;
use snapkeep_core::StopSignal;
use snapkeep_core::clock::rfc3339;
use snapkeep_core::retry_with_backoff;
use snapkeep_store_sqlite::EventRow;
use snapkeep_store_sqlite::PooledConnection;
use snapkeep_store_sqlite::PrimaryStore;
use snapkeep_store_sqlite::StoreError;
use snapkeep_store_sqlite::insert_event;

// ============================================================================
// SECTION: Fault Injection
// ============================================================================

/// Synthetic contention schedule; zero disables a fault.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultPlan {
    /// Every Nth begin fails.
    #[serde(default)]
    pub begin_every: u32,
    /// Every Nth insert attempt starts a failure burst.
    #[serde(default)]
    pub insert_every: u32,
    /// Consecutive insert failures per burst.
    #[serde(default)]
    pub insert_burst: u32,
    /// Every Nth commit fails.
    #[serde(default)]
    pub commit_every: u32,
}

impl FaultPlan {
    /// True when no fault is scheduled.
    #[must_use]
    pub const fn is_quiet(&self) -> bool {
        self.begin_every == 0 && self.insert_every == 0 && self.commit_every == 0
    }
}

/// Per-writer progress through a [`FaultPlan`].
#[derive(Debug, Default)]
struct FaultState {
    /// Schedule.
    plan: FaultPlan,
    /// Begins seen.
    begins: u64,
    /// Insert attempts seen outside bursts.
    inserts: u64,
    /// Failures left in the current insert burst.
    burst_left: u32,
    /// Commits seen.
    commits: u64,
}

impl FaultState {
    /// Creates state for `plan`.
    fn new(plan: FaultPlan) -> Self {
        Self {
            plan,
            ..Self::default()
        }
    }

    /// Returns an injected error if this begin should fail.
    fn begin(&mut self) -> Result<(), StoreError> {
        Self::tick(&mut self.begins, self.plan.begin_every, "begin")
    }

    /// Returns an injected error if this insert should fail.
    fn insert(&mut self) -> Result<(), StoreError> {
        if self.burst_left > 0 {
            self.burst_left -= 1;
            return Err(injected("insert"));
        }
        Self::tick(&mut self.inserts, self.plan.insert_every, "insert")
            .inspect_err(|_| self.burst_left = self.plan.insert_burst.saturating_sub(1))
    }

    /// Returns an injected error if this commit should fail.
    fn commit(&mut self) -> Result<(), StoreError> {
        Self::tick(&mut self.commits, self.plan.commit_every, "commit")
    }

    /// Counts one event and fails every `every`th.
    fn tick(counter: &mut u64, every: u32, step: &str) -> Result<(), StoreError> {
        if every == 0 {
            return Ok(());
        }
        *counter = counter.saturating_add(1);
        if counter.is_multiple_of(u64::from(every)) { Err(injected(step)) } else { Ok(()) }
    }
}

/// Builds a synthetic contention error.
fn injected(step: &str) -> StoreError {
    StoreError::Busy(format!("injected {step} contention"))
}

// ============================================================================
// SECTION: Writer
// ============================================================================

/// Writer settings shared by every writer of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterConfig {
    /// Rows per transaction.
    pub batch_size: usize,
    /// Bound on consecutive failures and the backoff base.
    pub retry: RetryPolicy,
    /// Synthetic contention schedule.
    pub faults: FaultPlan,
}

/// Counters reported by one writer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriterStats {
    /// Writer identity.
    pub writer_id: i64,
    /// Transactions committed.
    pub batches_committed: u64,
    /// Rows committed.
    pub rows_committed: u64,
    /// Begin or row attempts retried after contention.
    pub contention_retries: u64,
    /// Batches rolled back and retried as a unit.
    pub batch_retries: u64,
    /// Non-contention failures.
    pub errors: u64,
}

/// How one batch ended.
enum BatchOutcome {
    /// Committed.
    Committed,
    /// Rolled back; try again after backoff.
    Retry,
    /// Stop was requested.
    Stopped,
}

/// One writer thread's state.
pub struct Writer {
    /// Writer identity stored with each row.
    id: i64,
    /// Target store.
    store: PrimaryStore,
    /// Settings.
    config: WriterConfig,
    /// Time source for `created_at`.
    clock: Arc<dyn Clock>,
    /// Event log.
    log: EventLog,
    /// Shared stop flag.
    stop: StopSignal,
}

impl Writer {
    /// Creates a writer.
    #[must_use]
    pub fn new(
        id: i64,
        store: PrimaryStore,
        config: WriterConfig,
        clock: Arc<dyn Clock>,
        log: &EventLog,
        stop: StopSignal,
    ) -> Self {
        Self {
            id,
            store,
            config,
            clock,
            log: log.component("writer"),
            stop,
        }
    }

    /// Writes batches until stopped; returns the writer's counters.
    #[must_use]
    pub fn run(self) -> WriterStats {
        let mut cursor = SequenceCursor::new();
        let mut faults = FaultState::new(self.config.faults);
        let mut stats = WriterStats {
            writer_id: self.id,
            ..WriterStats::default()
        };
        let mut failed_batches = 0_u32;
        self.log.debug("writer_started").field("writer_id", self.id).emit();
        while !self.stop.is_stopped() {
            match self.write_batch(&mut cursor, &mut faults, &mut stats) {
                BatchOutcome::Committed => failed_batches = 0,
                BatchOutcome::Retry => {
                    failed_batches = failed_batches.saturating_add(1);
                    let backoff = self.config.retry.jittered_backoff(failed_batches.min(self.config.retry.attempts()));
                    if self.stop.wait_timeout(backoff) {
                        break;
                    }
                }
                BatchOutcome::Stopped => break,
            }
        }
        self.log
            .info("writer_stopped")
            .field("writer_id", self.id)
            .field("rows_committed", stats.rows_committed)
            .field("contention_retries", stats.contention_retries)
            .field("batch_retries", stats.batch_retries)
            .field("errors", stats.errors)
            .emit();
        stats
    }

    /// Writes one batch.
    fn write_batch(
        &self,
        cursor: &mut SequenceCursor,
        faults: &mut FaultState,
        stats: &mut WriterStats,
    ) -> BatchOutcome {
        let Some(connection) = self.begin(faults, stats) else {
            return if self.stop.is_stopped() { BatchOutcome::Stopped } else { BatchOutcome::Retry };
        };
        let policy = self.config.retry;
        let created_at = rfc3339(self.clock.now());
        for _ in 0 .. self.config.batch_size {
            let mut failures = 0_u32;
            loop {
                let seq = cursor.advance();
                let payload = format!("writer-{}-seq-{seq}", self.id);
                let result = faults.insert().and_then(|()| {
                    insert_event(
                        &connection,
                        &EventRow {
                            writer_id: self.id,
                            seq,
                            payload: &payload,
                            created_at: &created_at,
                        },
                    )
                });
                match result {
                    Ok(()) => break,
                    Err(err) if err.is_contention() => {
                        cursor.rewind_row();
                        stats.contention_retries = stats.contention_retries.saturating_add(1);
                        failures = failures.saturating_add(1);
                        if failures >= policy.attempts() {
                            self.abandon(connection, cursor, stats, "row", &err);
                            return BatchOutcome::Retry;
                        }
                        self.log
                            .debug("writer_row_retry")
                            .field("writer_id", self.id)
                            .field("seq", seq)
                            .field("attempt", failures)
                            .emit();
                        if self.stop.wait_timeout(policy.backoff_for(failures)) {
                            self.abandon(connection, cursor, stats, "stopped", &err);
                            return BatchOutcome::Stopped;
                        }
                    }
                    Err(err) => {
                        self.fail(connection, cursor, stats, &err);
                        return BatchOutcome::Retry;
                    }
                }
            }
        }
        let committed = faults.commit().and_then(|()| {
            connection.execute_batch("COMMIT").map_err(|err| StoreError::from_db(&err))
        });
        match committed {
            Ok(()) => {
                cursor.commit();
                stats.batches_committed = stats.batches_committed.saturating_add(1);
                stats.rows_committed = cursor.committed();
                BatchOutcome::Committed
            }
            Err(err) if err.is_contention() => {
                self.abandon(connection, cursor, stats, "commit", &err);
                BatchOutcome::Retry
            }
            Err(err) => {
                self.fail(connection, cursor, stats, &err);
                BatchOutcome::Retry
            }
        }
    }

    /// Checks out a connection and opens a write transaction, with retry.
    fn begin(&self, faults: &mut FaultState, stats: &mut WriterStats) -> Option<PooledConnection> {
        let deadline = Deadline::none().with_stop(self.stop.clone());
        let result = retry_with_backoff(
            &self.config.retry,
            &deadline,
            StoreError::is_contention,
            |_| {
                let connection = self.store.connection()?;
                faults.begin()?;
                connection.execute_batch("BEGIN IMMEDIATE").map_err(|err| StoreError::from_db(&err))?;
                Ok(connection)
            },
            |attempt, backoff, err| {
                stats.contention_retries = stats.contention_retries.saturating_add(1);
                self.log
                    .debug("writer_begin_retry")
                    .field("writer_id", self.id)
                    .field("attempt", attempt)
                    .field("backoff_ms", u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX))
                    .error(err)
                    .emit();
            },
        );
        match result {
            Ok(connection) => Some(connection),
            Err(RetryError::Cancelled(_)) => None,
            Err(RetryError::Exhausted {
                last, ..
            }) => {
                stats.batch_retries = stats.batch_retries.saturating_add(1);
                self.log.warn("writer_batch_retry").field("writer_id", self.id).field("step", "begin").error(&last).emit();
                None
            }
            Err(RetryError::Fatal {
                error, ..
            }) => {
                stats.errors = stats.errors.saturating_add(1);
                self.log.error("writer_error").field("writer_id", self.id).field("step", "begin").error(&error).emit();
                None
            }
        }
    }

    /// Rolls back after contention and schedules a batch retry.
    fn abandon(
        &self,
        connection: PooledConnection,
        cursor: &mut SequenceCursor,
        stats: &mut WriterStats,
        step: &'static str,
        err: &StoreError,
    ) {
        let dropped = rollback(connection, cursor);
        stats.batch_retries = stats.batch_retries.saturating_add(1);
        self.log
            .warn("writer_batch_retry")
            .field("writer_id", self.id)
            .field("step", step)
            .field("rows_dropped", dropped)
            .error(err)
            .emit();
    }

    /// Rolls back after a non-contention failure.
    fn fail(
        &self,
        connection: PooledConnection,
        cursor: &mut SequenceCursor,
        stats: &mut WriterStats,
        err: &StoreError,
    ) {
        let dropped = rollback(connection, cursor);
        stats.errors = stats.errors.saturating_add(1);
        self.log
            .error("writer_error")
            .field("writer_id", self.id)
            .field("rows_dropped", dropped)
            .error(err)
            .emit();
    }
}

/// Rolls back the open transaction and rewinds the cursor to the batch start.
fn rollback(connection: PooledConnection, cursor: &mut SequenceCursor) -> u64 {
    let _ = connection.execute_batch("ROLLBACK");
    drop(connection);
    cursor.abort_batch()
}

// ============================================================================
// SECTION: Tests
// ============================================================================
