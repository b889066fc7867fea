// crates/snapkeep-publish/src/error.rs
// ============================================================================
// Module: Publish Errors
// Description: Failure taxonomy for local and remote publication.
// Purpose: Tell callers which step failed and what durable state remains.
// Dependencies: snapkeep-core, snapkeep-store-sqlite, thiserror
// ============================================================================

//! ## Overview
//! Failure taxonomy for local and remote publication: each variant tells the
//! caller which step failed and what durable state remains.

use snapkeep_core::Cancelled;
use snapkeep_core::Classify;
use snapkeep_core::ErrorClass;
use snapkeep_store_sqlite::SnapshotError;
use thiserror::Error;

use crate::object_store::ObjectStoreError;

/// Publication errors.
///
/// The variant names the step that failed, which in turn fixes what a
/// reader of the durable location can observe:
/// - [`PublishError::Upload`]: nothing changed.
/// - [`PublishError::Current`]: the current copy still holds the previous
///   snapshot.
/// - [`PublishError::Partial`]: the current copy holds the new snapshot but
///   no backup record was written for it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// Local file I/O failed.
    #[error("publish io error: {0}")]
    Io(String),
    /// Uploading the temporary object failed.
    #[error("publish upload failed: {0}")]
    Upload(ObjectStoreError),
    /// Installing the current object failed.
    #[error("publish current copy failed: {0}")]
    Current(ObjectStoreError),
    /// Current was updated but the backup copy failed.
    #[error("publish partial: current {current_key} updated, backup {backup_key} failed: {message}")]
    Partial {
        /// Current key, already updated.
        current_key: String,
        /// Backup key that was not written.
        backup_key: String,
        /// Last backup failure.
        message: String,
    },
    /// Fetching the current object failed.
    #[error("publish download failed: {0}")]
    Download(ObjectStoreError),
    /// Invalid input or settings.
    #[error("publish invalid: {0}")]
    Invalid(String),
    /// The snapshot step failed.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    /// Cancelled before completion.
    #[error("publish cancelled: {}", .0.reason.label())]
    Cancelled(#[from] Cancelled),
}

impl Classify for PublishError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Io(_) | Self::Upload(_) | Self::Current(_) | Self::Download(_) => ErrorClass::Io,
            Self::Partial {
                ..
            } => ErrorClass::PartialPublish,
            Self::Invalid(_) => ErrorClass::Invalid,
            Self::Snapshot(err) => err.class(),
            Self::Cancelled(_) => ErrorClass::Cancelled,
        }
    }
}

impl From<std::io::Error> for PublishError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use snapkeep_core::CancelReason;

    use super::*;

    #[test]
    fn partial_publish_has_its_own_class() {
        let err = PublishError::Partial {
            current_key: "app.sqlite".to_string(),
            backup_key: "backups/2026-01-02/030405-app.sqlite".to_string(),
            message: "boom".to_string(),
        };
        assert_eq!(err.class(), ErrorClass::PartialPublish);
        assert!(err.to_string().contains("backups/2026-01-02/030405-app.sqlite"));
    }

    #[test]
    fn snapshot_errors_keep_their_class() {
        let err = PublishError::from(SnapshotError::Contention {
            attempts: 3,
            message: "locked".to_string(),
        });
        assert_eq!(err.class(), ErrorClass::Contention);
        let cancelled = PublishError::from(Cancelled {
            reason: CancelReason::Stopped,
        });
        assert_eq!(cancelled.class(), ErrorClass::Cancelled);
    }
}
