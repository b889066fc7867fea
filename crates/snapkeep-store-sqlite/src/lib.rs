// crates/snapkeep-store-sqlite/src/lib.rs
// ============================================================================
// Module: Snapkeep SQLite Store Library
// Description: Live primary store, snapshot engine, and copy inspection.
// Purpose: Expose the SQLite-facing half of snapkeep.
// Dependencies: snapkeep-core, rusqlite
// ============================================================================

//! ## Overview
//! - [`PrimaryStore`]: the live database behind a bounded connection pool.
//! - [`SnapshotEngine`]: `VACUUM INTO` clones installed by atomic rename.
//! - [`inspect_copy`]: read-only row counts and integrity checks.

pub mod inspect;
pub mod pool;
pub mod snapshot;
pub mod store;

pub use inspect::CopyInspection;
pub use inspect::INTEGRITY_OK;
pub use inspect::inspect_copy;
pub use pool::PoolStats;
pub use pool::PooledConnection;
pub use snapshot::SnapshotConfig;
pub use snapshot::SnapshotEngine;
pub use snapshot::SnapshotError;
pub use snapshot::SnapshotOutcome;
pub use snapshot::StagedSnapshot;
pub use store::EVENTS_TABLE;
pub use store::EventRow;
pub use store::JournalMode;
pub use store::PrimaryStore;
pub use store::SEED_WRITER_ID;
pub use store::StoreConfig;
pub use store::StoreError;
pub use store::SyncMode;
pub use store::WriterSequence;
pub use store::insert_event;
pub use store::is_contention;
