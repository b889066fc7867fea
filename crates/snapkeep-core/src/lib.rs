// crates/snapkeep-core/src/lib.rs
// ============================================================================
// Module: Snapkeep Core Library
// Description: Shared primitives for snapshotting a live SQLite store.
// Purpose: Provide injected time, cancellation, retry, and structured events.
// Dependencies: rand, serde, serde_json, thiserror, time
// ============================================================================

//! ## Overview
//! `snapkeep-core` holds the plumbing every other snapkeep crate leans on:
//! an injectable [`Clock`], a cooperative [`StopSignal`] and per-call
//! [`Deadline`], bounded linear-backoff retry with an explicit
//! [`SequenceCursor`] for rewind-on-failure, the shared [`ErrorClass`]
//! taxonomy, and JSON-line [`EventSink`] logging.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod cancel;
pub mod clock;
pub mod error;
pub mod events;
pub mod retry;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use cancel::CancelReason;
pub use cancel::Cancelled;
pub use cancel::Deadline;
pub use cancel::StopSignal;
pub use clock::Clock;
pub use clock::ManualClock;
pub use clock::SystemClock;
pub use error::Classify;
pub use error::ErrorClass;
pub use events::EventLog;
pub use events::EventSink;
pub use events::FileEventSink;
pub use events::Level;
pub use events::LevelFilterSink;
pub use events::LogEvent;
pub use events::MemoryEventSink;
pub use events::NoopEventSink;
pub use events::StderrEventSink;
pub use retry::RetryError;
pub use retry::RetryPolicy;
pub use retry::SequenceCursor;
pub use retry::SequenceState;
pub use retry::retry_with_backoff;
