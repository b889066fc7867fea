// crates/snapkeep-core/tests/sequence_cursor.rs
// ============================================================================
// Module: Sequence Cursor Property Tests
// Description: Model-based checks for rewind-on-failure sequencing.
// Purpose: Prove committed sequence numbers stay gapless and unique.
// Dependencies: snapkeep-core, proptest
// ============================================================================

//! ## Overview
//! Drives a [`SequenceCursor`] with arbitrary interleavings of row claims,
//! row failures, batch aborts, and commits, while a model "table" records
//! only rows whose batch committed. The table must always be exactly
//! `1..=n` for the cursor's committed value `n`.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    reason = "Test-only assertions and helpers are permitted."
)]

use proptest::prelude::*;
use snapkeep_core::SequenceCursor;
use snapkeep_core::SequenceState;

#[derive(Debug, Clone, Copy)]
enum Step {
    WriteRow,
    FailRow,
    Commit,
    AbortBatch,
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => Just(Step::WriteRow),
        2 => Just(Step::FailRow),
        1 => Just(Step::Commit),
        1 => Just(Step::AbortBatch),
    ]
}

proptest! {
    #[test]
    fn committed_rows_are_gapless_and_unique(steps in prop::collection::vec(step_strategy(), 0 .. 400)) {
        let mut cursor = SequenceCursor::new();
        let mut table: Vec<u64> = Vec::new();
        let mut open_batch: Vec<u64> = Vec::new();
        for step in steps {
            match step {
                Step::WriteRow => {
                    let seq = cursor.advance();
                    open_batch.push(seq);
                }
                Step::FailRow => {
                    // The insert for a freshly claimed number did not apply.
                    let seq = cursor.advance();
                    cursor.rewind_row();
                    prop_assert_eq!(cursor.pending(), seq - 1);
                }
                Step::Commit => {
                    table.append(&mut open_batch);
                    cursor.commit();
                }
                Step::AbortBatch => {
                    let dropped = cursor.abort_batch();
                    prop_assert_eq!(dropped, open_batch.len() as u64);
                    open_batch.clear();
                }
            }
        }
        let expected: Vec<u64> = (1 ..= cursor.committed()).collect();
        prop_assert_eq!(table, expected);
        match cursor.state() {
            SequenceState::Committed(k) => prop_assert!(open_batch.is_empty() && k == cursor.committed()),
            SequenceState::Pending { committed, through } => {
                prop_assert_eq!(through - committed, open_batch.len() as u64);
            }
        }
    }
}
