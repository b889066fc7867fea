// crates/snapkeep-store-sqlite/src/store.rs
// ============================================================================
// Module: SQLite Primary Store
// Description: Live, concurrently written SQLite database behind a pool.
// Purpose: Own committed data and classify contention for retry loops.
// Dependencies: snapkeep-core, rusqlite, serde, thiserror
// ============================================================================

//! ## Overview
//! [`PrimaryStore`] opens the live database in WAL mode, ensures the
//! append-only `events` table exists, and hands out pooled connections for
//! statements and transactions. Every rusqlite failure is folded into
//! [`StoreError`], with busy/locked outcomes split out as
//! [`StoreError::Busy`] so retry loops can tell contention from real
//! failures.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use rusqlite::ErrorCode;
use rusqlite::OpenFlags;
use rusqlite::Params;
use rusqlite::params;
use serde::Deserialize;
use serde::Serialize;
use snapkeep_core::Classify;
use snapkeep_core::ErrorClass;
use thiserror::Error;

use crate::pool::ConnectionPool;
use crate::pool::PoolStats;
use crate::pool::PooledConnection;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default busy timeout for pooled connections.
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
/// Default pool size.
const DEFAULT_POOL_MAX_OPEN: usize = 10;
/// Default idle connections retained.
const DEFAULT_POOL_MAX_IDLE: usize = 10;
/// Default wait for a free pooled connection.
const DEFAULT_POOL_CHECKOUT_TIMEOUT_MS: u64 = 30_000;
/// Maximum length of a single path component.
pub(crate) const MAX_PATH_COMPONENT_LENGTH: usize = 255;
/// Maximum total path length.
pub(crate) const MAX_TOTAL_PATH_LENGTH: usize = 4096;
/// Append-only table written by producers.
pub const EVENTS_TABLE: &str = "events";
/// Producer identity used for seed rows.
pub const SEED_WRITER_ID: i64 = 0;

/// Schema applied on open.
const SCHEMA_SQL: &str = "CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    writer_id INTEGER NOT NULL,
    seq INTEGER NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS events_writer_seq ON events (writer_id, seq);";

// ============================================================================
// SECTION: Config
// ============================================================================

/// `SQLite` journal mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JournalMode {
    /// Write-ahead log; readers never block the writer.
    #[default]
    Wal,
    /// Rollback journal.
    Delete,
}

impl JournalMode {
    /// Returns the pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Wal => "wal",
            Self::Delete => "delete",
        }
    }
}

/// `SQLite` synchronous mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Full fsync on every commit.
    #[default]
    Full,
    /// Fsync at checkpoints only (safe under WAL).
    Normal,
}

impl SyncMode {
    /// Returns the pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Normal => "normal",
        }
    }
}

/// Primary store configuration.
///
/// # Invariants
/// - `pool_max_open` is at least one.
/// - `pool_max_idle` never exceeds `pool_max_open`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database file path.
    pub path: PathBuf,
    /// Busy timeout for pooled connections in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Journal mode.
    #[serde(default)]
    pub journal_mode: JournalMode,
    /// Synchronous mode.
    #[serde(default)]
    pub sync_mode: SyncMode,
    /// Maximum open pooled connections.
    #[serde(default = "default_pool_max_open")]
    pub pool_max_open: usize,
    /// Maximum idle pooled connections retained.
    #[serde(default = "default_pool_max_idle")]
    pub pool_max_idle: usize,
    /// Longest wait for a free pooled connection in milliseconds.
    #[serde(default = "default_pool_checkout_timeout_ms")]
    pub pool_checkout_timeout_ms: u64,
    /// Rows inserted under [`SEED_WRITER_ID`] when the store is empty.
    #[serde(default)]
    pub seed_rows: u64,
}

/// Returns the default busy timeout.
const fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

/// Returns the default pool size.
const fn default_pool_max_open() -> usize {
    DEFAULT_POOL_MAX_OPEN
}

/// Returns the default idle cap.
const fn default_pool_max_idle() -> usize {
    DEFAULT_POOL_MAX_IDLE
}

/// Returns the default checkout wait.
const fn default_pool_checkout_timeout_ms() -> u64 {
    DEFAULT_POOL_CHECKOUT_TIMEOUT_MS
}

impl StoreConfig {
    /// Returns a configuration with defaults for `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            journal_mode: JournalMode::default(),
            sync_mode: SyncMode::default(),
            pool_max_open: DEFAULT_POOL_MAX_OPEN,
            pool_max_idle: DEFAULT_POOL_MAX_IDLE,
            pool_checkout_timeout_ms: DEFAULT_POOL_CHECKOUT_TIMEOUT_MS,
            seed_rows: 0,
        }
    }

    /// Validates path and pool limits.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Invalid`] when a limit is out of range.
    pub fn validate(&self) -> Result<(), StoreError> {
        validate_store_path(&self.path)?;
        if self.pool_max_open == 0 {
            return Err(StoreError::Invalid("pool_max_open must be greater than zero".to_string()));
        }
        if self.pool_max_idle > self.pool_max_open {
            return Err(StoreError::Invalid(format!(
                "pool_max_idle ({}) exceeds pool_max_open ({})",
                self.pool_max_idle, self.pool_max_open
            )));
        }
        if self.pool_checkout_timeout_ms == 0 {
            return Err(StoreError::Invalid(
                "pool_checkout_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Primary store errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Filesystem failure around the database file.
    #[error("sqlite store io error: {0}")]
    Io(String),
    /// Non-transient engine failure.
    #[error("sqlite store db error: {0}")]
    Db(String),
    /// Transient busy/locked contention.
    #[error("sqlite store busy: {0}")]
    Busy(String),
    /// No pooled connection freed up in time.
    #[error("sqlite store pool timeout: {0}")]
    PoolTimeout(String),
    /// Invalid configuration or input.
    #[error("sqlite store invalid: {0}")]
    Invalid(String),
}

impl StoreError {
    /// Maps a rusqlite error, splitting out contention.
    #[must_use]
    pub fn from_db(error: &rusqlite::Error) -> Self {
        if is_contention(error) {
            Self::Busy(error.to_string())
        } else {
            Self::Db(error.to_string())
        }
    }

    /// True for transient contention.
    #[must_use]
    pub const fn is_contention(&self) -> bool {
        matches!(self, Self::Busy(_) | Self::PoolTimeout(_))
    }
}

impl Classify for StoreError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Busy(_) | Self::PoolTimeout(_) => ErrorClass::Contention,
            Self::Io(_) | Self::Db(_) => ErrorClass::Io,
            Self::Invalid(_) => ErrorClass::Invalid,
        }
    }
}

/// Returns true when `error` is `SQLITE_BUSY` or `SQLITE_LOCKED`.
#[must_use]
pub fn is_contention(error: &rusqlite::Error) -> bool {
    match error.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => true,
        Some(_) => false,
        None => is_contention_message(&error.to_string()),
    }
}

/// Classifies error text when no result code is attached.
fn is_contention_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("database is locked") || lower.contains("database is busy")
}

// ============================================================================
// SECTION: Rows
// ============================================================================

/// One producer-tagged row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRow<'a> {
    /// Producer identity.
    pub writer_id: i64,
    /// Producer-local sequence number (1-based).
    pub seq: u64,
    /// Opaque payload.
    pub payload: &'a str,
    /// RFC 3339 insertion time from the injected clock.
    pub created_at: &'a str,
}

/// Committed sequence summary for one producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WriterSequence {
    /// Producer identity.
    pub writer_id: i64,
    /// Committed rows.
    pub rows: u64,
    /// Distinct sequence numbers among them.
    pub distinct: u64,
    /// Smallest sequence number.
    pub min_seq: u64,
    /// Largest sequence number.
    pub max_seq: u64,
}

impl WriterSequence {
    /// True when the rows are exactly `1..=max_seq`.
    #[must_use]
    pub const fn is_gapless(&self) -> bool {
        self.rows == self.distinct
            && self.rows == self.max_seq
            && (self.rows == 0 || self.min_seq == 1)
    }
}

/// Inserts one row on `connection`, usually inside an open transaction.
///
/// # Errors
///
/// Returns [`StoreError::Busy`] on contention, [`StoreError::Db`] otherwise.
pub fn insert_event(connection: &Connection, row: &EventRow<'_>) -> Result<(), StoreError> {
    let seq = i64::try_from(row.seq)
        .map_err(|_| StoreError::Invalid(format!("sequence {} out of range", row.seq)))?;
    connection
        .execute(
            "INSERT INTO events (writer_id, seq, payload, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![row.writer_id, seq, row.payload, row.created_at],
        )
        .map_err(|err| StoreError::from_db(&err))?;
    Ok(())
}

// ============================================================================
// SECTION: Store
// ============================================================================

/// Live primary store.
///
/// # Invariants
/// - Every pooled connection carries the configured pragmas and busy timeout.
/// - The `events` table exists once [`PrimaryStore::open`] returns.
#[derive(Clone)]
pub struct PrimaryStore {
    /// Store configuration.
    config: Arc<StoreConfig>,
    /// Shared connection pool.
    pool: Arc<ConnectionPool>,
}

impl PrimaryStore {
    /// Opens (creating if needed) the store and ensures its schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the path is invalid or the database
    /// cannot be opened or initialised.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;
        ensure_parent_dir(&config.path)?;
        let config = Arc::new(config);
        let opener_config = Arc::clone(&config);
        let pool = Arc::new(ConnectionPool::new(
            config.pool_max_open,
            config.pool_max_idle,
            Duration::from_millis(config.pool_checkout_timeout_ms),
            Box::new(move || open_connection(&opener_config)),
        ));
        let store = Self {
            config,
            pool,
        };
        store.connection()?.execute_batch(SCHEMA_SQL).map_err(|err| StoreError::from_db(&err))?;
        if store.config.seed_rows > 0 {
            store.seed(store.config.seed_rows)?;
        }
        Ok(store)
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Returns the database file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Checks out a pooled connection.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::PoolTimeout`] when the pool stays exhausted.
    pub fn connection(&self) -> Result<PooledConnection, StoreError> {
        self.pool.get()
    }

    /// Executes one statement on a pooled connection.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on checkout or statement failure.
    pub fn execute<P: Params>(&self, sql: &str, params: P) -> Result<usize, StoreError> {
        self.connection()?.execute(sql, params).map_err(|err| StoreError::from_db(&err))
    }

    /// Runs a single-row query on a pooled connection.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on checkout or query failure.
    pub fn query_row<T, P, F>(&self, sql: &str, params: P, map: F) -> Result<T, StoreError>
    where
        P: Params,
        F: FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        self.connection()?.query_row(sql, params, map).map_err(|err| StoreError::from_db(&err))
    }

    /// Counts committed rows in the `events` table.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on checkout or query failure.
    pub fn count_rows(&self) -> Result<u64, StoreError> {
        let count: i64 = self.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        u64::try_from(count).map_err(|_| StoreError::Db(format!("negative row count {count}")))
    }

    /// Returns the highest committed sequence number for `writer_id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on checkout or query failure.
    pub fn max_seq(&self, writer_id: i64) -> Result<u64, StoreError> {
        let max: i64 = self.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM events WHERE writer_id = ?1",
            params![writer_id],
            |row| row.get(0),
        )?;
        u64::try_from(max).map_err(|_| StoreError::Db(format!("negative sequence {max}")))
    }

    /// Summarises committed sequences per producer, ordered by writer id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on checkout or query failure.
    pub fn writer_sequences(&self) -> Result<Vec<WriterSequence>, StoreError> {
        let connection = self.connection()?;
        let mut statement = connection
            .prepare(
                "SELECT writer_id, COUNT(*), COUNT(DISTINCT seq), MIN(seq), MAX(seq) FROM events \
                 GROUP BY writer_id ORDER BY writer_id",
            )
            .map_err(|err| StoreError::from_db(&err))?;
        let rows = statement
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })
            .map_err(|err| StoreError::from_db(&err))?;
        let mut sequences = Vec::new();
        for row in rows {
            let (writer_id, count, distinct, min_seq, max_seq) =
                row.map_err(|err| StoreError::from_db(&err))?;
            sequences.push(WriterSequence {
                writer_id,
                rows: non_negative(count)?,
                distinct: non_negative(distinct)?,
                min_seq: non_negative(min_seq)?,
                max_seq: non_negative(max_seq)?,
            });
        }
        Ok(sequences)
    }

    /// Returns pool occupancy.
    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Closes idle pooled connections; checked-out ones close on return.
    pub fn close(&self) {
        self.pool.close_idle();
    }

    /// Inserts `rows` seed rows when the seed producer has none yet.
    fn seed(&self, rows: u64) -> Result<(), StoreError> {
        if self.max_seq(SEED_WRITER_ID)? > 0 {
            return Ok(());
        }
        let mut connection = self.connection()?;
        let tx = connection.transaction().map_err(|err| StoreError::from_db(&err))?;
        for seq in 1 ..= rows {
            insert_event(
                &tx,
                &EventRow {
                    writer_id: SEED_WRITER_ID,
                    seq,
                    payload: "seed",
                    created_at: "1970-01-01T00:00:00Z",
                },
            )?;
        }
        tx.commit().map_err(|err| StoreError::from_db(&err))
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Converts a SQL integer into a count.
fn non_negative(value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Db(format!("unexpected negative value {value}")))
}

/// Ensures the parent directory for `path` exists.
pub(crate) fn ensure_parent_dir(path: &Path) -> Result<(), StoreError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            std::fs::create_dir_all(parent).map_err(|err| StoreError::Io(err.to_string()))
        }
        _ => Ok(()),
    }
}

/// Validates a database or snapshot path against length limits.
pub(crate) fn validate_store_path(path: &Path) -> Result<(), StoreError> {
    if path.as_os_str().is_empty() {
        return Err(StoreError::Invalid("store path must not be empty".to_string()));
    }
    if path.display().to_string().len() > MAX_TOTAL_PATH_LENGTH {
        return Err(StoreError::Invalid("store path exceeds length limit".to_string()));
    }
    for component in path.components() {
        if component.as_os_str().len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(StoreError::Invalid(
                "store path contains an overlong component".to_string(),
            ));
        }
    }
    if path.is_dir() {
        return Err(StoreError::Invalid("store path must be a file, not a directory".to_string()));
    }
    Ok(())
}

/// Opens a read-write connection and applies the configured pragmas.
fn open_connection(config: &StoreConfig) -> Result<Connection, StoreError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let connection =
        Connection::open_with_flags(&config.path, flags).map_err(|err| StoreError::from_db(&err))?;
    connection
        .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
        .map_err(|err| StoreError::from_db(&err))?;
    connection
        .execute_batch(&format!("PRAGMA journal_mode = {};", config.journal_mode.pragma_value()))
        .map_err(|err| StoreError::from_db(&err))?;
    connection
        .execute_batch(&format!("PRAGMA synchronous = {};", config.sync_mode.pragma_value()))
        .map_err(|err| StoreError::from_db(&err))?;
    Ok(connection)
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contention_message_fallback_matches_busy_and_locked() {
        assert!(is_contention_message("database is locked"));
        assert!(is_contention_message("Database Is Busy"));
        assert!(!is_contention_message("disk I/O error"));
    }

    #[test]
    fn writer_sequence_gapless_rules() {
        let gapless = WriterSequence {
            writer_id: 1,
            rows: 3,
            distinct: 3,
            min_seq: 1,
            max_seq: 3,
        };
        assert!(gapless.is_gapless());
        let duplicate = WriterSequence {
            distinct: 2,
            ..gapless
        };
        assert!(!duplicate.is_gapless());
        let gap = WriterSequence {
            max_seq: 4,
            ..gapless
        };
        assert!(!gap.is_gapless());
    }

    #[test]
    fn idle_cap_cannot_exceed_pool_size() {
        let mut config = StoreConfig::new("/tmp/snapkeep-config-check.sqlite");
        config.pool_max_open = 2;
        config.pool_max_idle = 3;
        assert!(matches!(config.validate(), Err(StoreError::Invalid(_))));
    }
}
