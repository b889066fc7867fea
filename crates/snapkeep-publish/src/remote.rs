// crates/snapkeep-publish/src/remote.rs
// ============================================================================
// Module: Remote Publisher
// Description: Two-phase publish of snapshots to an object store.
// Purpose: Keep a current object plus an immutable, dated backup trail.
// Dependencies: snapkeep-core, rand, serde
// ============================================================================

//! ## Overview
//! A publish runs four ordered steps against one [`ObjectStoreClient`]:
//!
//! 1. upload the snapshot to a unique temporary key,
//! 2. server-side copy it over the current key,
//! 3. server-side copy it to a fresh backup key,
//! 4. delete the temporary key.
//!
//! Readers of the current key only ever see a complete object because the
//! only step that touches it is a single copy. Backup keys are never
//! reused: a derived key that already exists gets a numeric suffix, and a
//! caller-supplied key that exists is rejected before anything is uploaded.
//!
//! The startup counterpart [`RemotePublisher::download_if_needed`] fetches
//! the current object for a cold start and creates an empty placeholder
//! when there is nothing to fetch yet.
//!
//! Checking a derived backup key and copying to it are two calls; two
//! publishers racing on the same second may pick the same suffix. A single
//! process publishes one snapshot at a time, so this is not guarded.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs;
use std::fs::File;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use rand::Rng;
use serde::Serialize;
use snapkeep_core::Clock;
use snapkeep_core::Deadline;
use snapkeep_core::EventLog;
use snapkeep_core::RetryError;
use snapkeep_core::RetryPolicy;
use snapkeep_core::clock::compact_stamp;
use snapkeep_core::clock::date_stamp;
use snapkeep_core::clock::time_stamp;
use snapkeep_core::retry_with_backoff;

use crate::error::PublishError;
use crate::object_store::ObjectStoreClient;
use crate::object_store::ObjectStoreError;
use crate::object_store::key_basename;
use crate::object_store::validate_key;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Root of the backup trail.
pub const BACKUP_ROOT: &str = "backups";
/// Highest numeric suffix tried when a derived backup key is taken.
const MAX_BACKUP_SUFFIX: u32 = 999;
/// Suffix of the local file a download lands in before rename.
const DOWNLOAD_SUFFIX: &str = ".download";

// ============================================================================
// SECTION: Receipts
// ============================================================================

/// Result of a successful remote publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishReceipt {
    /// Current key, now holding the snapshot.
    pub current_key: String,
    /// Backup key written for this publish.
    pub backup_key: String,
    /// Temporary key used for the upload.
    pub temp_key: String,
    /// Whether the temporary key was deleted.
    pub temp_cleaned: bool,
    /// Attempts the backup copy took.
    pub backup_attempts: u32,
}

/// Result of [`RemotePublisher::download_if_needed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DownloadOutcome {
    /// The current object was fetched.
    Downloaded {
        /// Bytes written.
        bytes: u64,
    },
    /// No current object exists yet.
    Placeholder {
        /// True when an empty local file was created.
        created: bool,
    },
}

// ============================================================================
// SECTION: Publisher
// ============================================================================

/// Publisher bound to one object store and current key.
#[derive(Clone)]
pub struct RemotePublisher {
    /// Object store capability.
    client: Arc<dyn ObjectStoreClient>,
    /// Key always holding the latest snapshot.
    current_key: String,
    /// Time source for temp and backup names.
    clock: Arc<dyn Clock>,
    /// Event log.
    log: EventLog,
    /// Retry bound for the backup copy.
    backup_retry: RetryPolicy,
}

impl RemotePublisher {
    /// Creates a publisher for `current_key`.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Invalid`] when `current_key` is not a valid key.
    pub fn new(
        client: Arc<dyn ObjectStoreClient>,
        current_key: impl Into<String>,
        clock: Arc<dyn Clock>,
        log: &EventLog,
        backup_retry: RetryPolicy,
    ) -> Result<Self, PublishError> {
        let current_key = current_key.into();
        validate_key(&current_key).map_err(|err| PublishError::Invalid(err.to_string()))?;
        Ok(Self {
            client,
            current_key,
            clock,
            log: log.component("publish_remote"),
            backup_retry,
        })
    }

    /// Returns the current key.
    #[must_use]
    pub fn current_key(&self) -> &str {
        &self.current_key
    }

    /// Publishes `snapshot` as the current object and records a backup.
    ///
    /// # Errors
    ///
    /// - [`PublishError::Invalid`] for a missing snapshot or a supplied
    ///   backup key that is malformed or already taken.
    /// - [`PublishError::Upload`] when the upload fails; nothing changed.
    /// - [`PublishError::Current`] when the current copy fails; current
    ///   still holds the previous snapshot.
    /// - [`PublishError::Partial`] when the backup copy fails after retries;
    ///   current holds the new snapshot.
    /// - [`PublishError::Cancelled`] when `deadline` fires before current
    ///   is touched.
    pub fn publish(
        &self,
        deadline: &Deadline,
        snapshot: &Path,
        backup_key: Option<&str>,
    ) -> Result<PublishReceipt, PublishError> {
        if !snapshot.is_file() {
            return Err(PublishError::Invalid(format!("snapshot not found: {}", snapshot.display())));
        }
        deadline.check()?;
        let now = self.clock.now();
        let backup_key = self.resolve_backup_key(backup_key, now)?;
        let nonce: u32 = rand::thread_rng().r#gen();
        let temp_key = format!("{}.tmp-{}-{nonce:08x}", self.current_key, compact_stamp(now));

        if let Err(err) = self.client.put_file(&temp_key, snapshot) {
            self.cleanup_temp(&temp_key);
            self.log.error("publish_upload_failed").field("key", temp_key.as_str()).error(&err).emit();
            return Err(PublishError::Upload(err));
        }
        self.log.debug("publish_upload").field("key", temp_key.as_str()).emit();

        if let Err(cancelled) = deadline.check() {
            self.cleanup_temp(&temp_key);
            return Err(cancelled.into());
        }
        if let Err(err) = self.client.copy(&temp_key, &self.current_key) {
            self.cleanup_temp(&temp_key);
            self.log
                .error("publish_current_failed")
                .field("key", self.current_key.as_str())
                .error(&err)
                .emit();
            return Err(PublishError::Current(err));
        }
        self.log.info("publish_current").field("key", self.current_key.as_str()).emit();

        let backup_attempts = match self.copy_backup(deadline, &temp_key, &backup_key) {
            Ok(attempts) => attempts,
            Err(message) => {
                self.cleanup_temp(&temp_key);
                self.log
                    .error("publish_partial")
                    .field("current_key", self.current_key.as_str())
                    .field("backup_key", backup_key.as_str())
                    .field("error", message.as_str())
                    .emit();
                return Err(PublishError::Partial {
                    current_key: self.current_key.clone(),
                    backup_key,
                    message,
                });
            }
        };
        self.log
            .info("publish_backup")
            .field("key", backup_key.as_str())
            .field("attempts", backup_attempts)
            .emit();

        let temp_cleaned = self.cleanup_temp(&temp_key);
        self.log
            .info("publish_complete")
            .field("store", self.client.describe())
            .field("current_key", self.current_key.as_str())
            .field("backup_key", backup_key.as_str())
            .field("temp_cleaned", temp_cleaned)
            .emit();
        Ok(PublishReceipt {
            current_key: self.current_key.clone(),
            backup_key,
            temp_key,
            temp_cleaned,
            backup_attempts,
        })
    }

    /// Fetches the current object into `dest` for a cold start.
    ///
    /// When no current object exists an empty placeholder is created,
    /// unless `dest` already exists, in which case it is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Download`] on object-store failure and
    /// [`PublishError::Io`] on local failure.
    pub fn download_if_needed(&self, dest: &Path) -> Result<DownloadOutcome, PublishError> {
        if let Some(bytes) = self.fetch_current(dest)? {
            self.log
                .info("restore_downloaded")
                .field("store", self.client.describe())
                .field("key", self.current_key.as_str())
                .field("path", dest.display().to_string())
                .field("bytes", bytes)
                .emit();
            return Ok(DownloadOutcome::Downloaded {
                bytes,
            });
        }
        let created = if dest.exists() {
            false
        } else {
            File::create(dest)?.sync_all()?;
            true
        };
        self.log
            .warn("restore_placeholder")
            .field("key", self.current_key.as_str())
            .field("path", dest.display().to_string())
            .field("created", created)
            .emit();
        Ok(DownloadOutcome::Placeholder {
            created,
        })
    }

    /// Fetches the current object into `dest`, failing when absent.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Download`] when the object is missing or the
    /// fetch fails.
    pub fn download_current(&self, dest: &Path) -> Result<u64, PublishError> {
        self.fetch_current(dest)?
            .ok_or_else(|| PublishError::Download(ObjectStoreError::NotFound(self.current_key.clone())))
    }

    /// Fetches current into `dest` through a sibling file and rename.
    fn fetch_current(&self, dest: &Path) -> Result<Option<u64>, PublishError> {
        if let Some(parent) = dest.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut raw = dest.as_os_str().to_os_string();
        raw.push(DOWNLOAD_SUFFIX);
        let temp = PathBuf::from(raw);
        let fetched = match self.client.get_to_file(&self.current_key, &temp) {
            Ok(fetched) => fetched,
            Err(err) => {
                let _ = fs::remove_file(&temp);
                return Err(PublishError::Download(err));
            }
        };
        if !fetched {
            let _ = fs::remove_file(&temp);
            return Ok(None);
        }
        let installed = File::open(&temp)
            .and_then(|file| file.sync_all())
            .and_then(|()| fs::rename(&temp, dest))
            .and_then(|()| fs::metadata(dest));
        match installed {
            Ok(metadata) => Ok(Some(metadata.len())),
            Err(err) => {
                let _ = fs::remove_file(&temp);
                Err(err.into())
            }
        }
    }

    /// Picks the backup key, rejecting or avoiding keys already taken.
    fn resolve_backup_key(
        &self,
        supplied: Option<&str>,
        now: time::OffsetDateTime,
    ) -> Result<String, PublishError> {
        if let Some(key) = supplied {
            validate_key(key).map_err(|err| PublishError::Invalid(err.to_string()))?;
            if self.client.exists(key).map_err(PublishError::Upload)? {
                return Err(PublishError::Invalid(format!("backup key already exists: {key}")));
            }
            return Ok(key.to_string());
        }
        let base = key_basename(&self.current_key);
        let dir = format!("{BACKUP_ROOT}/{}", date_stamp(now));
        let time = time_stamp(now);
        let first = format!("{dir}/{time}-{base}");
        if !self.client.exists(&first).map_err(PublishError::Upload)? {
            return Ok(first);
        }
        for suffix in 1 ..= MAX_BACKUP_SUFFIX {
            let candidate = format!("{dir}/{time}-{suffix}-{base}");
            if !self.client.exists(&candidate).map_err(PublishError::Upload)? {
                return Ok(candidate);
            }
        }
        Err(PublishError::Invalid(format!("no free backup key under {dir}/{time}")))
    }

    /// Copies temp to the backup key under the retry policy.
    fn copy_backup(&self, deadline: &Deadline, temp_key: &str, backup_key: &str) -> Result<u32, String> {
        let result = retry_with_backoff(
            &self.backup_retry,
            deadline,
            |err: &ObjectStoreError| !matches!(err, ObjectStoreError::Invalid(_)),
            |attempt| self.client.copy(temp_key, backup_key).map(|()| attempt),
            |attempt, backoff, err| {
                self.log
                    .warn("publish_backup_retry")
                    .field("key", backup_key)
                    .field("attempt", attempt)
                    .field("backoff_ms", u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX))
                    .error(err)
                    .emit();
            },
        );
        result.map_err(|err| match err {
            RetryError::Exhausted {
                attempts,
                last,
            } => format!("{last} (after {attempts} attempts)"),
            RetryError::Fatal {
                error, ..
            } => error.to_string(),
            RetryError::Cancelled(cancelled) => cancelled.to_string(),
        })
    }

    /// Deletes the temp key; failures are logged and reported as `false`.
    fn cleanup_temp(&self, temp_key: &str) -> bool {
        match self.client.delete(temp_key) {
            Ok(()) => true,
            Err(err) => {
                self.log
                    .warn("publish_temp_cleanup_failed")
                    .field("key", temp_key)
                    .error(&err)
                    .emit();
                false
            }
        }
    }
}
