// crates/snapkeep-store-sqlite/tests/primary_store.rs
// ============================================================================
// Module: Primary Store Tests
// Description: Schema, pooling, and contention classification checks.
// Purpose: Validate the capability surface the snapshot and writer paths use.
// ============================================================================

//! ## Overview
//! - schema creation and seeding on open
//! - pool bounds: `max_open` caps checkouts, `max_idle` caps parked connections
//! - busy/locked failures classify as contention
//! - per-producer sequence summaries

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    reason = "Test-only assertions and helpers are permitted."
)]

use rusqlite::Connection;
use rusqlite::params;
use snapkeep_core::Classify;
use snapkeep_core::ErrorClass;
use snapkeep_store_sqlite::EventRow;
use snapkeep_store_sqlite::JournalMode;
use snapkeep_store_sqlite::PrimaryStore;
use snapkeep_store_sqlite::SEED_WRITER_ID;
use snapkeep_store_sqlite::StoreConfig;
use snapkeep_store_sqlite::StoreError;
use snapkeep_store_sqlite::insert_event;
use tempfile::TempDir;

fn config(temp: &TempDir) -> StoreConfig {
    StoreConfig::new(temp.path().join("nested").join("primary.sqlite"))
}

#[test]
fn open_creates_schema_and_seeds_once() {
    let temp = TempDir::new().unwrap();
    let mut config = config(&temp);
    config.seed_rows = 7;

    let store = PrimaryStore::open(config.clone()).unwrap();
    assert_eq!(store.count_rows().unwrap(), 7);
    assert_eq!(store.max_seq(SEED_WRITER_ID).unwrap(), 7);
    drop(store);

    let reopened = PrimaryStore::open(config).unwrap();
    assert_eq!(reopened.count_rows().unwrap(), 7);
}

#[test]
fn store_path_must_not_be_a_directory() {
    let temp = TempDir::new().unwrap();
    let err = PrimaryStore::open(StoreConfig::new(temp.path())).err().unwrap();
    assert!(matches!(err, StoreError::Invalid(_)));
}

#[test]
fn pool_caps_open_connections() {
    let temp = TempDir::new().unwrap();
    let mut config = config(&temp);
    config.pool_max_open = 2;
    config.pool_max_idle = 2;
    config.pool_checkout_timeout_ms = 50;
    let store = PrimaryStore::open(config).unwrap();

    let first = store.connection().unwrap();
    let second = store.connection().unwrap();
    let err = store.connection().err().unwrap();

    assert!(matches!(err, StoreError::PoolTimeout(_)));
    assert_eq!(err.class(), ErrorClass::Contention);
    assert_eq!(store.pool_stats().open, 2);
    drop(first);
    assert!(store.connection().is_ok());
    drop(second);
}

#[test]
fn pool_closes_connections_beyond_idle_cap() {
    let temp = TempDir::new().unwrap();
    let mut config = config(&temp);
    config.pool_max_open = 4;
    config.pool_max_idle = 1;
    let store = PrimaryStore::open(config).unwrap();

    let held: Vec<_> = (0 .. 3).map(|_| store.connection().unwrap()).collect();
    assert_eq!(store.pool_stats().open, 3);
    drop(held);

    let stats = store.pool_stats();
    assert_eq!(stats.open, 1);
    assert_eq!(stats.idle, 1);
    store.close();
    assert_eq!(store.pool_stats().open, 0);
}

#[test]
fn locked_database_classifies_as_contention() {
    let temp = TempDir::new().unwrap();
    let mut config = config(&temp);
    config.journal_mode = JournalMode::Delete;
    config.busy_timeout_ms = 10;
    let store = PrimaryStore::open(config).unwrap();
    let holder = Connection::open(store.path()).unwrap();
    holder.execute_batch("BEGIN EXCLUSIVE;").unwrap();

    let err = store
        .execute(
            "INSERT INTO events (writer_id, seq, payload, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![1_i64, 1_i64, "x", "t"],
        )
        .unwrap_err();

    assert!(matches!(err, StoreError::Busy(_)), "{err:?}");
    assert!(err.is_contention());
    holder.execute_batch("ROLLBACK;").unwrap();
    assert_eq!(store.count_rows().unwrap(), 0);
}

#[test]
fn syntax_errors_are_not_contention() {
    let temp = TempDir::new().unwrap();
    let store = PrimaryStore::open(config(&temp)).unwrap();
    let err = store.execute("INSERT INTO nowhere VALUES (1)", []).unwrap_err();
    assert!(matches!(err, StoreError::Db(_)));
    assert_eq!(err.class(), ErrorClass::Io);
}

#[test]
fn writer_sequences_expose_gaps_and_duplicates() {
    let temp = TempDir::new().unwrap();
    let store = PrimaryStore::open(config(&temp)).unwrap();
    let connection = store.connection().unwrap();
    for (writer_id, seq) in [(1, 1), (1, 2), (1, 3), (2, 1), (2, 3), (3, 1), (3, 1)] {
        insert_event(
            &connection,
            &EventRow {
                writer_id,
                seq,
                payload: "p",
                created_at: "t",
            },
        )
        .unwrap();
    }
    drop(connection);

    let sequences = store.writer_sequences().unwrap();
    let gapless: Vec<(i64, bool)> =
        sequences.iter().map(|sequence| (sequence.writer_id, sequence.is_gapless())).collect();
    assert_eq!(gapless, vec![(1, true), (2, false), (3, false)]);
}
