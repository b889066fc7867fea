// crates/snapkeep-verifier/src/record.rs
// ============================================================================
// Module: Verification Records
// Description: Per-cycle records, run judgement, and the sequence audit.
// Purpose: Decide whether a verification run upheld the snapshot guarantees.
// Dependencies: snapkeep-store-sqlite, serde
// ============================================================================

//! ## Overview
//! The harness appends one [`VerificationRecord`] per cycle and never edits
//! it afterwards. [`judge`] walks the records in order and reports every
//! broken guarantee as a [`Violation`]:
//! - a cycle that failed, carrying the failure's class
//! - a published copy whose integrity check is not `ok`
//! - a published copy holding more rows than the primary
//! - a published row count lower than the last clean cycle's
//!
//! Every breach other than a failed cycle is classed
//! [`ErrorClass::IntegrityViolation`].
//!
//! [`audit_sequences`] compares each writer's committed rows against the
//! counters it reported.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use serde::Serialize;
use snapkeep_core::ErrorClass;
use snapkeep_store_sqlite::INTEGRITY_OK;
use snapkeep_store_sqlite::SEED_WRITER_ID;
use snapkeep_store_sqlite::WriterSequence;

use crate::writer::WriterStats;

// ============================================================================
// SECTION: Records
// ============================================================================

/// Outcome of one snapshot, publish, and verify cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationRecord {
    /// Zero-based position in the run.
    pub index: usize,
    /// RFC 3339 cycle start time.
    pub timestamp: String,
    /// Cycle wall time in milliseconds.
    pub duration_ms: u64,
    /// Rows in the primary store after publishing.
    pub primary_count: Option<u64>,
    /// Rows in the published copy.
    pub snapshot_count: Option<u64>,
    /// Integrity check verdict of the published copy.
    pub integrity: Option<String>,
    /// Failure message when the cycle did not complete.
    pub error: Option<String>,
    /// Class of the failure when the cycle did not complete.
    pub error_class: Option<ErrorClass>,
    /// True for the cycle run after writers were told to stop.
    pub is_final: bool,
}

impl VerificationRecord {
    /// True when the cycle completed without error.
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.error.is_none()
    }
}

/// One broken guarantee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    /// Index of the offending record, or `None` for audit findings.
    pub index: Option<usize>,
    /// Failure class; data-guarantee breaches are `integrity_violation`.
    pub class: ErrorClass,
    /// Human-readable reason.
    pub reason: String,
}

impl Violation {
    /// Creates an integrity violation tied to record `index`.
    fn at(index: usize, reason: impl Into<String>) -> Self {
        Self {
            index: Some(index),
            class: ErrorClass::IntegrityViolation,
            reason: reason.into(),
        }
    }

    /// Creates a violation for a cycle that failed with `class`.
    fn failed(index: usize, class: ErrorClass, reason: String) -> Self {
        Self {
            index: Some(index),
            class,
            reason,
        }
    }

    /// Creates an integrity violation not tied to a record.
    fn global(reason: impl Into<String>) -> Self {
        Self {
            index: None,
            class: ErrorClass::IntegrityViolation,
            reason: reason.into(),
        }
    }
}

// ============================================================================
// SECTION: Judgement
// ============================================================================

/// Checks every record in order and returns the violations found.
#[must_use]
pub fn judge(records: &[VerificationRecord]) -> Vec<Violation> {
    let mut violations = Vec::new();
    let mut last_clean: Option<u64> = None;
    for record in records {
        if let Some(error) = &record.error {
            let reason = if record.is_final {
                format!("final cycle failed: {error}")
            } else {
                format!("cycle failed: {error}")
            };
            let class = record.error_class.unwrap_or(ErrorClass::Io);
            violations.push(Violation::failed(record.index, class, reason));
            continue;
        }
        match record.integrity.as_deref() {
            Some(INTEGRITY_OK) => {}
            Some(other) => {
                violations.push(Violation::at(record.index, format!("integrity check failed: {other}")));
            }
            None => violations.push(Violation::at(record.index, "integrity check missing")),
        }
        let (Some(primary), Some(snapshot)) = (record.primary_count, record.snapshot_count) else {
            violations.push(Violation::at(record.index, "row counts missing"));
            continue;
        };
        if snapshot > primary {
            violations.push(Violation::at(
                record.index,
                format!("snapshot has {snapshot} rows but primary has {primary}"),
            ));
        }
        if let Some(previous) = last_clean
            && snapshot < previous
        {
            violations.push(Violation::at(
                record.index,
                format!("snapshot rows decreased from {previous} to {snapshot}"),
            ));
        }
        last_clean = Some(snapshot);
    }
    violations
}

// ============================================================================
// SECTION: Sequence Audit
// ============================================================================

/// Audit verdict for one writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SequenceAudit {
    /// Writer identity.
    pub writer_id: i64,
    /// Rows the writer reported committing.
    pub reported_rows: u64,
    /// Rows found in the store.
    pub stored_rows: u64,
    /// True when the stored rows are exactly `1..=n`.
    pub gapless: bool,
}

impl SequenceAudit {
    /// True when the stored rows are gapless and match the report.
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.gapless && self.reported_rows == self.stored_rows
    }
}

/// Matches stored sequences with writer counters.
///
/// Seed rows are skipped. A writer with no stored rows is audited against
/// an empty sequence.
#[must_use]
pub fn audit_sequences(sequences: &[WriterSequence], writers: &[WriterStats]) -> Vec<SequenceAudit> {
    let stored: BTreeMap<i64, &WriterSequence> = sequences
        .iter()
        .filter(|sequence| sequence.writer_id != SEED_WRITER_ID)
        .map(|sequence| (sequence.writer_id, sequence))
        .collect();
    let mut audits: Vec<SequenceAudit> = writers
        .iter()
        .map(|stats| {
            let (stored_rows, gapless) =
                stored.get(&stats.writer_id).map_or((0, true), |sequence| (sequence.rows, sequence.is_gapless()));
            SequenceAudit {
                writer_id: stats.writer_id,
                reported_rows: stats.rows_committed,
                stored_rows,
                gapless,
            }
        })
        .collect();
    for (writer_id, sequence) in &stored {
        if !writers.iter().any(|stats| stats.writer_id == *writer_id) {
            audits.push(SequenceAudit {
                writer_id: *writer_id,
                reported_rows: 0,
                stored_rows: sequence.rows,
                gapless: sequence.is_gapless(),
            });
        }
    }
    audits
}

/// Turns unclean audits into violations.
#[must_use]
pub fn audit_violations(audits: &[SequenceAudit]) -> Vec<Violation> {
    audits
        .iter()
        .filter(|audit| !audit.is_clean())
        .map(|audit| {
            let reason = if audit.gapless {
                format!(
                    "writer {} reported {} rows but {} are stored",
                    audit.writer_id, audit.reported_rows, audit.stored_rows
                )
            } else {
                format!("writer {} has gaps or duplicates in its sequence", audit.writer_id)
            };
            Violation::global(reason)
        })
        .collect()
}

// ============================================================================
// SECTION: Tests
// ============================================================================
