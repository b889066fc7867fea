// crates/snapkeep-core/src/error.rs
// ============================================================================
// Module: Error Classes
// Description: Cross-crate failure taxonomy.
// Purpose: Label every failure as contention, I/O, cancellation, and so on.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! Each crate keeps its own `thiserror` enum; [`Classify`] maps those onto a
//! shared [`ErrorClass`] so the verifier and logs can report outcomes
//! uniformly. Only [`ErrorClass::Contention`] is ever retried.

use serde::Serialize;

/// Shared failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Transient lock contention; retried locally with backoff.
    Contention,
    /// Non-retryable I/O or engine failure.
    Io,
    /// Cooperative stop or deadline; not a failure of the data path.
    Cancelled,
    /// The published copy failed its structural self-check.
    IntegrityViolation,
    /// The current pointer moved but the backup copy did not land.
    PartialPublish,
    /// Invalid input or configuration.
    Invalid,
}

impl ErrorClass {
    /// Returns a stable label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Contention => "contention",
            Self::Io => "io",
            Self::Cancelled => "cancelled",
            Self::IntegrityViolation => "integrity_violation",
            Self::PartialPublish => "partial_publish",
            Self::Invalid => "invalid",
        }
    }

    /// True when a local retry may succeed.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::Contention)
    }
}

/// Errors that can report their [`ErrorClass`].
pub trait Classify {
    /// Returns the failure class.
    fn class(&self) -> ErrorClass;
}
