// crates/snapkeep-core/src/retry.rs
// ============================================================================
// Module: Retry
// Description: Bounded linear backoff and rewind-on-failure sequencing.
// Purpose: Share one retry discipline between snapshots, writers, publishes.
// Dependencies: rand, thiserror
// ============================================================================

//! ## Overview
//! [`retry_with_backoff`] runs an operation up to `max_attempts` times,
//! sleeping `base_backoff * attempt` between transient failures and giving
//! up immediately on anything else. Sleeps go through a [`Deadline`] so a
//! cancelled call never waits out its backoff.
//!
//! [`SequenceCursor`] models a writer's private sequence counter whose
//! increments are applied before the row is durable. A failed row or batch
//! restores the cursor instead of advancing past the lost numbers:
//! `Pending(k) -> Committed(k)` on success, `Pending(k) -> Pending(k)` on
//! retry.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::time::Duration;

use rand::Rng;
use thiserror::Error;

use crate::cancel::Cancelled;
use crate::cancel::Deadline;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default attempt bound.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default backoff base.
const DEFAULT_BASE_BACKOFF: Duration = Duration::from_millis(200);

// ============================================================================
// SECTION: Policy
// ============================================================================

/// Bounded retry policy with linearly increasing backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum attempts including the first one.
    pub max_attempts: u32,
    /// Backoff multiplied by the attempt number.
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_BASE_BACKOFF)
    }
}

impl RetryPolicy {
    /// Creates a policy.
    #[must_use]
    pub const fn new(max_attempts: u32, base_backoff: Duration) -> Self {
        Self {
            max_attempts,
            base_backoff,
        }
    }

    /// Backoff to wait after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.base_backoff.saturating_mul(attempt)
    }

    /// Linear backoff plus up to half a base interval of random jitter.
    #[must_use]
    pub fn jittered_backoff(&self, attempt: u32) -> Duration {
        let base = self.backoff_for(attempt);
        let spread = u64::try_from(self.base_backoff.as_millis() / 2).unwrap_or(u64::MAX);
        if spread == 0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0 ..= spread);
        base.saturating_add(Duration::from_millis(jitter))
    }

    /// Attempt bound, never less than one.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

// ============================================================================
// SECTION: Retry Loop
// ============================================================================

/// Terminal outcome of a retried operation.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt failed transiently.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Error from the final attempt.
        last: E,
    },
    /// A non-transient failure ended the loop.
    #[error("attempt {attempt} failed: {error}")]
    Fatal {
        /// Attempt that failed.
        attempt: u32,
        /// The failure.
        error: E,
    },
    /// The deadline or stop signal fired.
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

/// Runs `operation` under `policy`, retrying while `is_transient` holds.
///
/// `operation` receives the 1-based attempt number. `on_retry` runs before
/// each backoff sleep with the attempt number, the sleep, and the error.
///
/// # Errors
///
/// Returns [`RetryError::Fatal`] on the first non-transient error,
/// [`RetryError::Exhausted`] when the bound is reached, or
/// [`RetryError::Cancelled`] when `deadline` fires before or between attempts.
pub fn retry_with_backoff<T, E, F, P, R>(
    policy: &RetryPolicy,
    deadline: &Deadline,
    is_transient: P,
    mut operation: F,
    mut on_retry: R,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Result<T, E>,
    P: Fn(&E) -> bool,
    R: FnMut(u32, Duration, &E),
{
    let max_attempts = policy.attempts();
    let mut attempt = 0_u32;
    loop {
        attempt = attempt.saturating_add(1);
        deadline.check()?;
        match operation(attempt) {
            Ok(value) => return Ok(value),
            Err(error) if !is_transient(&error) => {
                return Err(RetryError::Fatal {
                    attempt,
                    error,
                });
            }
            Err(error) => {
                if attempt >= max_attempts {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: error,
                    });
                }
                let backoff = policy.backoff_for(attempt);
                on_retry(attempt, backoff, &error);
                deadline.sleep(backoff)?;
            }
        }
    }
}

// ============================================================================
// SECTION: Sequence Cursor
// ============================================================================

/// Observable state of a [`SequenceCursor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceState {
    /// Every claimed number up to `k` is durable.
    Committed(u64),
    /// Numbers `committed + 1 ..= through` are claimed but not yet durable.
    Pending {
        /// Last durable number.
        committed: u64,
        /// Last claimed number.
        through: u64,
    },
}

/// Writer-local monotonic sequence counter with rewind on failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceCursor {
    /// Highest number known to be committed.
    committed: u64,
    /// Highest number claimed in the open batch.
    pending: u64,
}

impl SequenceCursor {
    /// Starts a cursor before sequence number 1.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            committed: 0,
            pending: 0,
        }
    }

    /// Resumes a cursor whose rows through `committed` are already durable.
    #[must_use]
    pub const fn resume(committed: u64) -> Self {
        Self {
            committed,
            pending: committed,
        }
    }

    /// Claims the next number for a row about to be written.
    pub const fn advance(&mut self) -> u64 {
        self.pending = self.pending.saturating_add(1);
        self.pending
    }

    /// Un-claims the most recent number after its row failed to apply.
    pub const fn rewind_row(&mut self) {
        if self.pending > self.committed {
            self.pending -= 1;
        }
    }

    /// Marks every claimed number durable; returns the new committed value.
    pub const fn commit(&mut self) -> u64 {
        self.committed = self.pending;
        self.committed
    }

    /// Drops every claim of the open batch; returns how many were dropped.
    pub const fn abort_batch(&mut self) -> u64 {
        let dropped = self.pending - self.committed;
        self.pending = self.committed;
        dropped
    }

    /// Highest committed number.
    #[must_use]
    pub const fn committed(&self) -> u64 {
        self.committed
    }

    /// Highest claimed number.
    #[must_use]
    pub const fn pending(&self) -> u64 {
        self.pending
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> SequenceState {
        if self.pending == self.committed {
            SequenceState::Committed(self.committed)
        } else {
            SequenceState::Pending {
                committed: self.committed,
                through: self.pending,
            }
        }
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic, reason = "Test-only assertions.")]

    use std::cell::Cell;

    use super::*;

    #[derive(Debug, PartialEq, Eq)]
    enum FakeError {
        Busy,
        Disk,
    }

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1))
    }

    #[test]
    fn backoff_grows_linearly() {
        let policy = RetryPolicy::new(5, Duration::from_millis(200));
        assert_eq!(policy.backoff_for(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(600));
        let jittered = policy.jittered_backoff(2);
        assert!(jittered >= Duration::from_millis(400));
        assert!(jittered <= Duration::from_millis(500));
    }

    #[test]
    fn transient_errors_retry_until_success() {
        let calls = Cell::new(0);
        let mut retries = Vec::new();
        let result = retry_with_backoff(
            &quick_policy(3),
            &Deadline::none(),
            |err: &FakeError| *err == FakeError::Busy,
            |attempt| {
                calls.set(calls.get() + 1);
                if attempt < 3 { Err(FakeError::Busy) } else { Ok(attempt) }
            },
            |attempt, _, _| retries.push(attempt),
        );
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.get(), 3);
        assert_eq!(retries, vec![1, 2]);
    }

    #[test]
    fn fatal_error_aborts_without_retry() {
        let calls = Cell::new(0);
        let result: Result<(), _> = retry_with_backoff(
            &quick_policy(5),
            &Deadline::none(),
            |err: &FakeError| *err == FakeError::Busy,
            |_| {
                calls.set(calls.get() + 1);
                Err(FakeError::Disk)
            },
            |_, _, _| {},
        );
        match result {
            Err(RetryError::Fatal {
                attempt,
                error,
            }) => {
                assert_eq!(attempt, 1);
                assert_eq!(error, FakeError::Disk);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn exhaustion_reports_attempt_count() {
        let result: Result<(), _> = retry_with_backoff(
            &quick_policy(4),
            &Deadline::none(),
            |_: &FakeError| true,
            |_| Err(FakeError::Busy),
            |_, _, _| {},
        );
        match result {
            Err(RetryError::Exhausted {
                attempts, ..
            }) => assert_eq!(attempts, 4),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn expired_deadline_cancels_before_first_attempt() {
        let calls = Cell::new(0);
        let result: Result<(), RetryError<FakeError>> = retry_with_backoff(
            &quick_policy(4),
            &Deadline::after(Duration::ZERO),
            |_| true,
            |_| {
                calls.set(calls.get() + 1);
                Ok(())
            },
            |_, _, _| {},
        );
        assert!(matches!(result, Err(RetryError::Cancelled(_))));
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn cursor_rewinds_failed_row() {
        let mut cursor = SequenceCursor::new();
        assert_eq!(cursor.advance(), 1);
        assert_eq!(cursor.advance(), 2);
        cursor.rewind_row();
        assert_eq!(cursor.advance(), 2);
        assert_eq!(
            cursor.state(),
            SequenceState::Pending {
                committed: 0,
                through: 2
            }
        );
        assert_eq!(cursor.commit(), 2);
        assert_eq!(cursor.state(), SequenceState::Committed(2));
    }

    #[test]
    fn cursor_abort_restores_batch_start() {
        let mut cursor = SequenceCursor::resume(10);
        cursor.advance();
        cursor.advance();
        cursor.advance();
        assert_eq!(cursor.abort_batch(), 3);
        assert_eq!(cursor.state(), SequenceState::Committed(10));
        assert_eq!(cursor.advance(), 11);
    }

    #[test]
    fn cursor_rewind_never_crosses_committed() {
        let mut cursor = SequenceCursor::resume(5);
        cursor.rewind_row();
        assert_eq!(cursor.pending(), 5);
        assert_eq!(cursor.committed(), 5);
    }
}
