// crates/snapkeep-verifier/src/lib.rs
// ============================================================================
// Module: Snapkeep Verifier
// Description: Consistency verification of snapshots under concurrent writes.
// Purpose: Prove published copies never regress or outrun the primary.
// Dependencies: snapkeep-core, snapkeep-publish, snapkeep-store-sqlite
// ============================================================================

//! ## Overview
//! [`Harness`] loads a fresh primary store with [`Writer`] threads, runs
//! timed snapshot and publish cycles, and judges the resulting
//! [`VerificationRecord`]s together with a per-writer sequence audit.

pub mod harness;
pub mod record;
pub mod writer;

pub use harness::Harness;
pub use harness::HarnessConfig;
pub use harness::HarnessState;
pub use harness::StateHandle;
pub use harness::VerifierError;
pub use harness::VerifierReport;
pub use harness::fresh_store;
pub use record::SequenceAudit;
pub use record::VerificationRecord;
pub use record::Violation;
pub use record::audit_sequences;
pub use record::audit_violations;
pub use record::judge;
pub use writer::FaultPlan;
pub use writer::Writer;
pub use writer::WriterConfig;
pub use writer::WriterStats;
