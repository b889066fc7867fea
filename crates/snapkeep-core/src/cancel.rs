// crates/snapkeep-core/src/cancel.rs
// ============================================================================
// Module: Cancellation
// Description: Cooperative stop signals and per-call deadlines.
// Purpose: Bound waits without pre-empting work in progress.
// Dependencies: thiserror
// ============================================================================

//! ## Overview
//! A [`StopSignal`] is shared by every task that should wind down together
//! and is checked between iterations. A [`Deadline`] bounds a single
//! snapshot or publish call; it can also observe a stop signal so that one
//! check covers both. Waiting through [`Deadline::sleep`] or
//! [`StopSignal::wait_timeout`] wakes immediately on stop.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;
use std::time::Instant;

use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Longest single wait slice while sleeping under a deadline.
const SLEEP_SLICE: Duration = Duration::from_millis(10);

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Why an operation was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The per-call deadline passed.
    DeadlineExceeded,
    /// A cooperative stop was requested.
    Stopped,
}

impl CancelReason {
    /// Returns a stable label for logs.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Stopped => "stopped",
        }
    }
}

/// Cancellation outcome, distinct from contention or I/O failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled: {}", .reason.label())]
pub struct Cancelled {
    /// Cancellation cause.
    pub reason: CancelReason,
}

// ============================================================================
// SECTION: Stop Signal
// ============================================================================

/// Shared cooperative stop flag.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    /// Stop flag paired with a condvar for prompt wake-ups.
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    /// Creates an unsignalled stop flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a stop and wakes all waiters.
    pub fn stop(&self) {
        let (flag, condvar) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        condvar.notify_all();
    }

    /// Returns true once a stop has been requested.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits up to `timeout`; returns true if stopped meanwhile.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, condvar) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = condvar
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

// ============================================================================
// SECTION: Deadline
// ============================================================================

/// Per-call deadline, optionally tied to a stop signal.
#[derive(Debug, Clone, Default)]
pub struct Deadline {
    /// Absolute expiry instant; `None` never expires on time.
    at: Option<Instant>,
    /// Stop signal that also cancels the call.
    stop: Option<StopSignal>,
}

impl Deadline {
    /// Returns a deadline that never expires.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Returns a deadline `timeout` from now.
    #[must_use]
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now().checked_add(timeout),
            stop: None,
        }
    }

    /// Returns a deadline expiring at `at`.
    #[must_use]
    pub const fn at(at: Instant) -> Self {
        Self {
            at: Some(at),
            stop: None,
        }
    }

    /// Ties the deadline to a stop signal.
    #[must_use]
    pub fn with_stop(mut self, stop: StopSignal) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Returns the remaining budget, or `None` when unbounded.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Returns `Err` once the deadline has passed or a stop was requested.
    ///
    /// # Errors
    ///
    /// Returns [`Cancelled`] with the triggering reason.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.stop.as_ref().is_some_and(StopSignal::is_stopped) {
            return Err(Cancelled {
                reason: CancelReason::Stopped,
            });
        }
        if self.remaining().is_some_and(|left| left.is_zero()) {
            return Err(Cancelled {
                reason: CancelReason::DeadlineExceeded,
            });
        }
        Ok(())
    }

    /// Sleeps for `duration`, returning early with `Err` on cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`Cancelled`] when the deadline passes or a stop is requested
    /// before the sleep completes.
    pub fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        let wake_at = Instant::now() + duration;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= wake_at {
                return Ok(());
            }
            let mut slice = (wake_at - now).min(SLEEP_SLICE);
            if let Some(left) = self.remaining() {
                slice = slice.min(left);
            }
            match &self.stop {
                Some(stop) => {
                    stop.wait_timeout(slice);
                }
                None => std::thread::sleep(slice),
            }
        }
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
