// crates/snapkeep-store-sqlite/tests/snapshot_engine.rs
// ============================================================================
// Module: Snapshot Engine Tests
// Description: End-to-end checks of VACUUM INTO snapshots on live stores.
// Purpose: Validate consistency, idempotence, retry, cancellation, and
//          crash safety of snapshot installation.
// ============================================================================

//! ## Overview
//! Exercises [`SnapshotEngine`] against real `SQLite` files:
//! - snapshots carry every committed row and pass `integrity_check`
//! - two snapshots of an unchanged store agree
//! - lock contention is retried with backoff, then reported
//! - deadlines and stop signals surface as cancellation
//! - a crash between clone and rename never touches the destination

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    reason = "Test-only assertions and helpers are permitted."
)]

use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use rusqlite::Connection;
use snapkeep_core::CancelReason;
use snapkeep_core::Deadline;
use snapkeep_core::EventLog;
use snapkeep_core::MemoryEventSink;
use snapkeep_core::StopSignal;
use snapkeep_core::SystemClock;
use snapkeep_store_sqlite::EventRow;
use snapkeep_store_sqlite::JournalMode;
use snapkeep_store_sqlite::PrimaryStore;
use snapkeep_store_sqlite::SnapshotConfig;
use snapkeep_store_sqlite::SnapshotEngine;
use snapkeep_store_sqlite::SnapshotError;
use snapkeep_store_sqlite::StoreConfig;
use snapkeep_store_sqlite::inspect_copy;
use snapkeep_store_sqlite::insert_event;
use tempfile::TempDir;

// ============================================================================
// SECTION: Helpers
// ============================================================================

fn open_store(dir: &Path, journal_mode: JournalMode) -> PrimaryStore {
    let mut config = StoreConfig::new(dir.join("primary.sqlite"));
    config.journal_mode = journal_mode;
    config.busy_timeout_ms = 2_000;
    PrimaryStore::open(config).unwrap()
}

fn insert_rows(store: &PrimaryStore, writer_id: i64, rows: u64) {
    let mut connection = store.connection().unwrap();
    let tx = connection.transaction().unwrap();
    for seq in 1 ..= rows {
        insert_event(
            &tx,
            &EventRow {
                writer_id,
                seq,
                payload: "payload",
                created_at: "2026-01-01T00:00:00Z",
            },
        )
        .unwrap();
    }
    tx.commit().unwrap();
}

fn fast_config() -> SnapshotConfig {
    SnapshotConfig {
        max_attempts: 3,
        base_backoff_ms: 10,
        lock_wait_ms: 20,
        checkpoint: true,
    }
}

fn memory_engine(config: SnapshotConfig) -> (Arc<MemoryEventSink>, SnapshotEngine) {
    let sink = Arc::new(MemoryEventSink::new());
    let log = EventLog::new(sink.clone(), Arc::new(SystemClock));
    (sink, SnapshotEngine::new(config, &log))
}

/// Holds an exclusive rollback-journal lock so readers see `SQLITE_BUSY`.
fn hold_exclusive_lock(path: &Path) -> Connection {
    let holder = Connection::open(path).unwrap();
    holder.execute_batch("BEGIN EXCLUSIVE;").unwrap();
    holder
}

fn leftover_staging_files(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.to_string_lossy().contains(".staging-"))
        .collect()
}

// ============================================================================
// SECTION: Consistency
// ============================================================================

#[test]
fn snapshot_contains_every_committed_row() {
    let temp = TempDir::new().unwrap();
    let store = open_store(temp.path(), JournalMode::Wal);
    insert_rows(&store, 1, 120);
    let (sink, engine) = memory_engine(fast_config());
    let dest = temp.path().join("snapshots").join("current.sqlite");

    let outcome = engine.snapshot(&Deadline::none(), store.path(), &dest).unwrap();

    assert_eq!(outcome.path, dest);
    assert_eq!(outcome.attempts, 1);
    assert!(outcome.bytes > 0);
    let inspection = inspect_copy(&dest).unwrap();
    assert_eq!(inspection.rows, 120);
    assert!(inspection.is_sound());
    assert_eq!(sink.count("snapshot_attempt"), 1);
    assert_eq!(sink.count("snapshot_complete"), 1);
    assert!(leftover_staging_files(&temp.path().join("snapshots")).is_empty());
}

#[test]
fn snapshots_of_unchanged_store_agree() {
    let temp = TempDir::new().unwrap();
    let store = open_store(temp.path(), JournalMode::Wal);
    insert_rows(&store, 1, 40);
    let (_, engine) = memory_engine(fast_config());
    let first = temp.path().join("first.sqlite");
    let second = temp.path().join("second.sqlite");

    engine.snapshot(&Deadline::none(), store.path(), &first).unwrap();
    engine.snapshot(&Deadline::none(), store.path(), &second).unwrap();

    assert_eq!(inspect_copy(&first).unwrap(), inspect_copy(&second).unwrap());
}

#[test]
fn snapshot_replaces_previous_copy() {
    let temp = TempDir::new().unwrap();
    let store = open_store(temp.path(), JournalMode::Wal);
    insert_rows(&store, 1, 10);
    let (_, engine) = memory_engine(fast_config());
    let dest = temp.path().join("current.sqlite");

    engine.snapshot(&Deadline::none(), store.path(), &dest).unwrap();
    insert_rows(&store, 2, 15);
    engine.snapshot(&Deadline::none(), store.path(), &dest).unwrap();

    assert_eq!(inspect_copy(&dest).unwrap().rows, 25);
    assert!(leftover_staging_files(temp.path()).is_empty());
}

#[test]
fn snapshot_taken_under_concurrent_writes_is_sound() {
    let temp = TempDir::new().unwrap();
    let store = open_store(temp.path(), JournalMode::Wal);
    let writer_store = store.clone();
    let writer = thread::spawn(move || {
        for writer_id in 1 ..= 20 {
            insert_rows(&writer_store, writer_id, 25);
        }
    });
    let (_, engine) = memory_engine(SnapshotConfig {
        lock_wait_ms: 2_000,
        ..fast_config()
    });
    let dest = temp.path().join("live.sqlite");
    let mut previous = 0;
    for _ in 0 .. 5 {
        engine.snapshot(&Deadline::none(), store.path(), &dest).unwrap();
        let inspection = inspect_copy(&dest).unwrap();
        assert!(inspection.is_sound());
        assert!(inspection.rows >= previous);
        assert!(inspection.rows <= store.count_rows().unwrap());
        assert_eq!(inspection.rows % 25, 0, "snapshot split a transaction");
        previous = inspection.rows;
    }
    writer.join().unwrap();
}

// ============================================================================
// SECTION: Contention
// ============================================================================

#[test]
fn contention_is_retried_then_reported() {
    let temp = TempDir::new().unwrap();
    let store = open_store(temp.path(), JournalMode::Delete);
    insert_rows(&store, 1, 5);
    let holder = hold_exclusive_lock(store.path());
    let (sink, engine) = memory_engine(fast_config());
    let dest = temp.path().join("blocked.sqlite");

    let err = engine.snapshot(&Deadline::none(), store.path(), &dest).unwrap_err();

    assert!(matches!(err, SnapshotError::Contention { attempts: 3, .. }), "{err:?}");
    assert_eq!(sink.count("snapshot_attempt"), 3);
    assert_eq!(sink.count("snapshot_retry"), 2);
    assert_eq!(sink.count("snapshot_failed"), 1);
    assert!(!dest.exists());
    assert!(leftover_staging_files(temp.path()).is_empty());
    drop(holder);
}

#[test]
fn contention_clears_within_retry_budget() {
    let temp = TempDir::new().unwrap();
    let store = open_store(temp.path(), JournalMode::Delete);
    insert_rows(&store, 1, 5);
    let holder = hold_exclusive_lock(store.path());
    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(60));
        holder.execute_batch("ROLLBACK;").unwrap();
    });
    let (_, engine) = memory_engine(SnapshotConfig {
        max_attempts: 10,
        base_backoff_ms: 30,
        lock_wait_ms: 10,
        checkpoint: false,
    });
    let dest = temp.path().join("eventually.sqlite");

    let outcome = engine.snapshot(&Deadline::none(), store.path(), &dest).unwrap();

    releaser.join().unwrap();
    assert!(outcome.attempts > 1);
    assert_eq!(inspect_copy(&dest).unwrap().rows, 5);
}

// ============================================================================
// SECTION: Cancellation
// ============================================================================

#[test]
fn deadline_cuts_backoff_short() {
    let temp = TempDir::new().unwrap();
    let store = open_store(temp.path(), JournalMode::Delete);
    let holder = hold_exclusive_lock(store.path());
    let (_, engine) = memory_engine(SnapshotConfig {
        max_attempts: 5,
        base_backoff_ms: 5_000,
        lock_wait_ms: 20,
        checkpoint: false,
    });
    let started = Instant::now();

    let err = engine
        .snapshot(
            &Deadline::after(Duration::from_millis(200)),
            store.path(),
            &temp.path().join("late.sqlite"),
        )
        .unwrap_err();

    assert!(
        matches!(err, SnapshotError::Cancelled(cancelled) if cancelled.reason == CancelReason::DeadlineExceeded)
    );
    assert!(started.elapsed() < Duration::from_secs(3));
    drop(holder);
}

#[test]
fn deadline_during_lock_wait_is_cancellation_not_contention() {
    let temp = TempDir::new().unwrap();
    let store = open_store(temp.path(), JournalMode::Delete);
    let holder = hold_exclusive_lock(store.path());
    let (_, engine) = memory_engine(SnapshotConfig {
        max_attempts: 3,
        base_backoff_ms: 10,
        lock_wait_ms: 500,
        checkpoint: false,
    });

    let err = engine
        .snapshot(
            &Deadline::after(Duration::from_millis(100)),
            store.path(),
            &temp.path().join("late.sqlite"),
        )
        .unwrap_err();

    assert!(matches!(err, SnapshotError::Cancelled(_)), "{err:?}");
    drop(holder);
}

#[test]
fn stop_signal_cancels_before_cloning() {
    let temp = TempDir::new().unwrap();
    let store = open_store(temp.path(), JournalMode::Wal);
    let stop = StopSignal::new();
    stop.stop();
    let (_, engine) = memory_engine(fast_config());

    let err = engine
        .snapshot(
            &Deadline::none().with_stop(stop),
            store.path(),
            &temp.path().join("stopped.sqlite"),
        )
        .unwrap_err();

    assert!(
        matches!(err, SnapshotError::Cancelled(cancelled) if cancelled.reason == CancelReason::Stopped)
    );
}

#[test]
fn missing_source_is_invalid() {
    let temp = TempDir::new().unwrap();
    let (_, engine) = memory_engine(fast_config());
    let err = engine
        .snapshot(
            &Deadline::none(),
            &temp.path().join("absent.sqlite"),
            &temp.path().join("dest.sqlite"),
        )
        .unwrap_err();
    assert!(matches!(err, SnapshotError::Invalid(_)));
}

// ============================================================================
// SECTION: Crash Safety
// ============================================================================

fn run_crash_writer(source: &Path, dest: &Path) -> PathBuf {
    let output = Command::new(env!("CARGO_BIN_EXE_snapshot_crash_writer"))
        .arg(source)
        .arg(dest)
        .output()
        .unwrap();
    assert!(!output.status.success(), "crash writer should abort");
    PathBuf::from(String::from_utf8(output.stdout).unwrap().trim())
}

#[test]
fn crash_before_install_keeps_previous_snapshot() {
    let temp = TempDir::new().unwrap();
    let store = open_store(temp.path(), JournalMode::Wal);
    insert_rows(&store, 1, 30);
    let (_, engine) = memory_engine(fast_config());
    let dest = temp.path().join("current.sqlite");
    engine.snapshot(&Deadline::none(), store.path(), &dest).unwrap();
    let before = std::fs::read(&dest).unwrap();
    insert_rows(&store, 2, 30);
    store.close();

    let staging = run_crash_writer(store.path(), &dest);

    assert_eq!(std::fs::read(&dest).unwrap(), before);
    assert_eq!(inspect_copy(&dest).unwrap().rows, 30);
    assert_ne!(staging, dest);
    assert_eq!(inspect_copy(&staging).unwrap().rows, 60);
}

#[test]
fn crash_before_first_install_leaves_destination_absent() {
    let temp = TempDir::new().unwrap();
    let store = open_store(temp.path(), JournalMode::Wal);
    insert_rows(&store, 1, 10);
    store.close();
    let dest = temp.path().join("never.sqlite");

    let _staging = run_crash_writer(store.path(), &dest);

    assert!(!dest.exists());
}
