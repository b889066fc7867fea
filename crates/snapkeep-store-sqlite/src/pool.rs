// crates/snapkeep-store-sqlite/src/pool.rs
// ============================================================================
// Module: Connection Pool
// Description: Bounded pool of SQLite connections with an idle cap.
// Purpose: Share one fixed-size set of connections between writers and readers.
// Dependencies: rusqlite
// ============================================================================

//! ## Overview
//! The pool opens connections lazily up to `max_open` and keeps at most
//! `max_idle` of them around once they are returned; surplus connections are
//! closed on return. Checkout blocks on a condvar until a connection is free
//! or the checkout timeout elapses. A timed-out checkout is reported as
//! contention so callers retry it like any other busy condition.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;
use std::time::Instant;

use rusqlite::Connection;

use crate::store::StoreError;

// ============================================================================
// SECTION: Types
// ============================================================================

/// Opens a fresh, fully configured connection.
pub(crate) type ConnectionOpener = Box<dyn Fn() -> Result<Connection, StoreError> + Send + Sync>;

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections currently open (idle plus checked out).
    pub open: usize,
    /// Connections parked in the idle list.
    pub idle: usize,
    /// Configured upper bound on open connections.
    pub max_open: usize,
    /// Configured upper bound on idle connections.
    pub max_idle: usize,
}

/// Mutable pool bookkeeping guarded by the pool mutex.
struct PoolState {
    /// Parked connections ready for reuse.
    idle: Vec<Connection>,
    /// Count of open connections, idle or checked out.
    open: usize,
}

/// Bounded connection pool.
pub(crate) struct ConnectionPool {
    /// Guarded bookkeeping.
    state: Mutex<PoolState>,
    /// Signalled whenever a connection is returned or a slot frees up.
    available: Condvar,
    /// Maximum open connections.
    max_open: usize,
    /// Maximum idle connections retained on return.
    max_idle: usize,
    /// Longest wait for a free connection.
    checkout_timeout: Duration,
    /// Connection factory.
    opener: ConnectionOpener,
}

impl ConnectionPool {
    /// Creates an empty pool.
    pub(crate) fn new(
        max_open: usize,
        max_idle: usize,
        checkout_timeout: Duration,
        opener: ConnectionOpener,
    ) -> Self {
        Self {
            state: Mutex::new(PoolState {
                idle: Vec::with_capacity(max_idle),
                open: 0,
            }),
            available: Condvar::new(),
            max_open,
            max_idle: max_idle.min(max_open),
            checkout_timeout,
            opener,
        }
    }

    /// Checks out a connection, opening one if below `max_open`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::PoolTimeout`] when no connection frees up within
    /// the checkout timeout, or the opener's error.
    pub(crate) fn get(self: &Arc<Self>) -> Result<PooledConnection, StoreError> {
        let give_up_at = Instant::now() + self.checkout_timeout;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(connection) = state.idle.pop() {
                return Ok(PooledConnection {
                    connection: Some(connection),
                    pool: Arc::clone(self),
                });
            }
            if state.open < self.max_open {
                state.open += 1;
                drop(state);
                return match (self.opener)() {
                    Ok(connection) => Ok(PooledConnection {
                        connection: Some(connection),
                        pool: Arc::clone(self),
                    }),
                    Err(err) => {
                        self.release_slot();
                        Err(err)
                    }
                };
            }
            let now = Instant::now();
            if now >= give_up_at {
                return Err(StoreError::PoolTimeout(format!(
                    "no connection available within {} ms ({} open)",
                    self.checkout_timeout.as_millis(),
                    state.open
                )));
            }
            let (guard, _) = self
                .available
                .wait_timeout(state, give_up_at - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    /// Returns current occupancy.
    pub(crate) fn stats(&self) -> PoolStats {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        PoolStats {
            open: state.open,
            idle: state.idle.len(),
            max_open: self.max_open,
            max_idle: self.max_idle,
        }
    }

    /// Closes every idle connection.
    pub(crate) fn close_idle(&self) {
        let drained = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let drained = std::mem::take(&mut state.idle);
            state.open -= drained.len();
            drained
        };
        drop(drained);
        self.available.notify_all();
    }

    /// Parks or closes a returned connection.
    fn put_back(&self, connection: Connection) {
        let surplus = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.idle.len() < self.max_idle {
                state.idle.push(connection);
                None
            } else {
                state.open -= 1;
                Some(connection)
            }
        };
        drop(surplus);
        self.available.notify_one();
    }

    /// Frees a slot whose connection failed to open.
    fn release_slot(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.open -= 1;
        drop(state);
        self.available.notify_one();
    }
}

// ============================================================================
// SECTION: Guard
// ============================================================================

/// Checked-out connection; returned to the pool on drop.
pub struct PooledConnection {
    /// The connection; `None` only during drop.
    connection: Option<Connection>,
    /// Owning pool.
    pool: Arc<ConnectionPool>,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match &self.connection {
            Some(connection) => connection,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        match &mut self.connection {
            Some(connection) => connection,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            if connection.is_autocommit() {
                self.pool.put_back(connection);
            } else {
                // A transaction leaked past its guard; never hand it out again.
                drop(connection);
                self.pool.release_slot();
            }
        }
    }
}
