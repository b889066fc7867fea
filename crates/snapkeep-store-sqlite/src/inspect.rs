// crates/snapkeep-store-sqlite/src/inspect.rs
// ============================================================================
// Module: Copy Inspection
// Description: Read-only row counts and integrity checks on snapshot files.
// Purpose: Verify that a published copy is openable, complete, and sound.
// Dependencies: rusqlite, serde
// ============================================================================

//! ## Overview
//! Snapshot files are plain `SQLite` databases, so any of them can be opened
//! read-only and checked with `PRAGMA integrity_check`. [`inspect_copy`]
//! does both in one connection and reports the `events` row count plus the
//! integrity verdict (`"ok"` or the engine's joined messages).

use std::path::Path;
use std::time::Duration;

use rusqlite::Connection;
use rusqlite::OpenFlags;
use serde::Serialize;

use crate::store::StoreError;

/// Integrity verdict for a sound database.
pub const INTEGRITY_OK: &str = "ok";
/// Lock wait when opening a copy.
const INSPECT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of inspecting a snapshot or published copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CopyInspection {
    /// Rows in the `events` table.
    pub rows: u64,
    /// `"ok"` or the integrity check's messages.
    pub integrity: String,
}

impl CopyInspection {
    /// True when the integrity check passed.
    #[must_use]
    pub fn is_sound(&self) -> bool {
        self.integrity == INTEGRITY_OK
    }
}

/// Counts rows and runs the integrity check on the database at `path`.
///
/// # Errors
///
/// Returns [`StoreError`] when the file cannot be opened or queried; an
/// unsound file that still opens is reported through
/// [`CopyInspection::integrity`] instead.
pub fn inspect_copy(path: &Path) -> Result<CopyInspection, StoreError> {
    let connection = open_read_only(path)?;
    let integrity = integrity_check(&connection)?;
    let rows = count_events(&connection)?;
    Ok(CopyInspection {
        rows,
        integrity,
    })
}

/// Opens `path` read-only.
fn open_read_only(path: &Path) -> Result<Connection, StoreError> {
    if !path.is_file() {
        return Err(StoreError::Io(format!("copy not found: {}", path.display())));
    }
    let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let connection =
        Connection::open_with_flags(path, flags).map_err(|err| StoreError::from_db(&err))?;
    connection.busy_timeout(INSPECT_BUSY_TIMEOUT).map_err(|err| StoreError::from_db(&err))?;
    Ok(connection)
}

/// Runs `PRAGMA integrity_check` and joins its rows.
fn integrity_check(connection: &Connection) -> Result<String, StoreError> {
    let mut statement =
        connection.prepare("PRAGMA integrity_check").map_err(|err| StoreError::from_db(&err))?;
    let rows = statement
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(|err| StoreError::from_db(&err))?;
    let mut messages = Vec::new();
    for row in rows {
        messages.push(row.map_err(|err| StoreError::from_db(&err))?);
    }
    if messages.is_empty() {
        return Err(StoreError::Db("integrity_check returned no rows".to_string()));
    }
    Ok(messages.join("; "))
}

/// Counts rows in the `events` table.
fn count_events(connection: &Connection) -> Result<u64, StoreError> {
    let count: i64 = connection
        .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
        .map_err(|err| StoreError::from_db(&err))?;
    u64::try_from(count).map_err(|_| StoreError::Db(format!("negative row count {count}")))
}
