// crates/snapkeep-core/src/clock.rs
// ============================================================================
// Module: Clock
// Description: Injectable wall-clock time source.
// Purpose: Let every component ask for "now" without a process-wide global.
// Dependencies: time
// ============================================================================

//! ## Overview
//! Components that stamp keys, records, or events receive an
//! `Arc<dyn Clock>` at composition time. Production wiring uses
//! [`SystemClock`]; tests substitute [`ManualClock`] for deterministic keys.
//! Elapsed-time measurement stays on `std::time::Instant`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Mutex;
use std::sync::PoisonError;

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

// ============================================================================
// SECTION: Clock Trait
// ============================================================================

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    /// Returns the current UTC time.
    fn now(&self) -> OffsetDateTime;
}

/// Real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Manually driven clock for tests and replay.
#[derive(Debug)]
pub struct ManualClock {
    /// Current instant reported by the clock.
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    /// Creates a clock frozen at `start`.
    #[must_use]
    pub const fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Moves the clock forward by `by`.
    pub fn advance(&self, by: std::time::Duration) {
        let step = time::Duration::try_from(by).unwrap_or(time::Duration::MAX);
        let mut guard = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *guard = guard.saturating_add(step);
    }

    /// Replaces the current time.
    pub fn set(&self, at: OffsetDateTime) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ============================================================================
// SECTION: Formatting Helpers
// ============================================================================

/// Formats `at` as `YYYYMMDD-HHMMSS` (UTC).
#[must_use]
pub fn compact_stamp(at: OffsetDateTime) -> String {
    let at = at.to_offset(time::UtcOffset::UTC);
    format!(
        "{:04}{:02}{:02}-{:02}{:02}{:02}",
        at.year(),
        u8::from(at.month()),
        at.day(),
        at.hour(),
        at.minute(),
        at.second()
    )
}

/// Formats the date part of `at` as `YYYY-MM-DD` (UTC).
#[must_use]
pub fn date_stamp(at: OffsetDateTime) -> String {
    let at = at.to_offset(time::UtcOffset::UTC);
    format!("{:04}-{:02}-{:02}", at.year(), u8::from(at.month()), at.day())
}

/// Formats the time part of `at` as `HHMMSS` (UTC).
#[must_use]
pub fn time_stamp(at: OffsetDateTime) -> String {
    let at = at.to_offset(time::UtcOffset::UTC);
    format!("{:02}{:02}{:02}", at.hour(), at.minute(), at.second())
}

/// Formats `at` as RFC 3339, falling back to unix seconds when out of range.
#[must_use]
pub fn rfc3339(at: OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_else(|_| at.unix_timestamp().to_string())
}

// ============================================================================
// SECTION: Tests
// ============================================================================
