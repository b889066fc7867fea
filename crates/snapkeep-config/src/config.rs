// crates/snapkeep-config/src/config.rs
// ============================================================================
// Module: Snapkeep Configuration
// Description: Configuration loading, validation, and component builders.
// Purpose: Provide strict, fail-closed config parsing with hard limits.
// Dependencies: snapkeep-core, snapkeep-publish, snapkeep-store-sqlite, serde, toml
// ============================================================================

//! ## Overview
//! Configuration is loaded from a TOML file with strict size and path limits
//! and validated before anything is opened. Every section has defaults, so
//! an empty file is a valid configuration whose publish target does nothing.
//!
//! Resolution order: an explicit path, then `SNAPKEEP_CONFIG`, then
//! `snapkeep.toml` in the working directory. Only the last one may be
//! missing, in which case the defaults apply.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::env;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use snapkeep_core::Clock;
use snapkeep_core::EventLog;
use snapkeep_core::EventSink;
use snapkeep_core::FileEventSink;
use snapkeep_core::Level;
use snapkeep_core::LevelFilterSink;
use snapkeep_core::NoopEventSink;
use snapkeep_core::RetryPolicy;
use snapkeep_core::StderrEventSink;
use snapkeep_publish::ArchiveTarget;
use snapkeep_publish::LocalPublisher;
use snapkeep_publish::ObjectStoreConfig;
use snapkeep_publish::PublishTarget;
use snapkeep_publish::RemotePublisher;
use snapkeep_publish::build_client;
use snapkeep_publish::object_store::validate_key;
use snapkeep_store_sqlite::SnapshotConfig;
use snapkeep_store_sqlite::StoreConfig;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default configuration filename when no path is specified.
const DEFAULT_CONFIG_NAME: &str = "snapkeep.toml";
/// Environment variable used to override the config path.
pub const CONFIG_ENV_VAR: &str = "SNAPKEEP_CONFIG";
/// Maximum configuration file size in bytes.
pub(crate) const MAX_CONFIG_FILE_SIZE: usize = 1024 * 1024;
/// Maximum length of a single path component.
pub(crate) const MAX_PATH_COMPONENT_LENGTH: usize = 255;
/// Maximum total path length.
pub(crate) const MAX_TOTAL_PATH_LENGTH: usize = 4096;
/// Maximum number of verifier writers.
pub(crate) const MAX_WRITERS: usize = 64;
/// Maximum rows per writer transaction.
pub(crate) const MAX_BATCH_SIZE: usize = 10_000;
/// Default live database path.
const DEFAULT_STORE_PATH: &str = "data/app.sqlite";
/// Default per-cycle timeout.
const DEFAULT_CYCLE_TIMEOUT_MS: u64 = 30_000;
/// Default staging directory for snapshots awaiting publish.
const DEFAULT_STAGING_DIR: &str = "tmp/staging";
/// Default directory for timestamped local snapshots.
const DEFAULT_BACKUPS_DIR: &str = "tmp/backups";
/// Default number of archived snapshots kept.
const DEFAULT_ARCHIVE_KEEP: usize = 10;
/// Maximum number of archived snapshots kept.
pub(crate) const MAX_ARCHIVE_KEEP: usize = 10_000;
/// Default current key for remote publish.
const DEFAULT_CURRENT_KEY: &str = "app.sqlite";
/// Default verifier writer count.
const DEFAULT_WRITERS: usize = 4;
/// Default rows per writer transaction.
const DEFAULT_BATCH_SIZE: usize = 50;
/// Default verifier run length.
const DEFAULT_DURATION_MS: u64 = 10_000;
/// Default verifier tick interval.
const DEFAULT_INTERVAL_MS: u64 = 2_000;
/// Default verifier scratch directory.
const DEFAULT_WORK_DIR: &str = "tmp/verify";
/// Default writer retry bound.
const DEFAULT_WRITE_MAX_ATTEMPTS: u32 = 5;
/// Default writer backoff base.
const DEFAULT_WRITE_BASE_BACKOFF_MS: u64 = 10;
/// Default timeout for one periodic or shutdown backup.
const DEFAULT_BACKUP_TIMEOUT_MS: u64 = 120_000;

// ============================================================================
// SECTION: Root Config
// ============================================================================

/// Complete snapkeep configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapkeepConfig {
    /// Live database settings.
    #[serde(default = "default_store")]
    pub store: StoreConfig,
    /// Snapshot engine settings.
    #[serde(default)]
    pub snapshot: SnapshotSection,
    /// Publish target settings.
    #[serde(default)]
    pub publish: PublishConfig,
    /// Consistency verifier settings.
    #[serde(default)]
    pub verifier: VerifierConfig,
    /// Production backup lifecycle settings.
    #[serde(default)]
    pub backup: BackupConfig,
    /// Structured logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for SnapkeepConfig {
    fn default() -> Self {
        Self {
            store: default_store(),
            snapshot: SnapshotSection::default(),
            publish: PublishConfig::default(),
            verifier: VerifierConfig::default(),
            backup: BackupConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Returns the default store section.
fn default_store() -> StoreConfig {
    StoreConfig::new(DEFAULT_STORE_PATH)
}

impl SnapkeepConfig {
    /// Loads configuration from disk using the default resolution rules.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when loading or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (resolved, explicit) = resolve_path(path)?;
        if !explicit && !resolved.exists() {
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }
        Self::load_file(&resolved)
    }

    /// Loads and validates one configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file is unreadable, oversized,
    /// malformed, or invalid.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        validate_path(path)?;
        let bytes = fs::read(path).map_err(|err| ConfigError::Io(err.to_string()))?;
        if bytes.len() > MAX_CONFIG_FILE_SIZE {
            return Err(ConfigError::Invalid("config file exceeds size limit".to_string()));
        }
        let content = std::str::from_utf8(&bytes)
            .map_err(|_| ConfigError::Invalid("config file must be utf-8".to_string()))?;
        let config: Self = toml::from_str(content).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.store.validate().map_err(|err| ConfigError::Invalid(format!("store: {err}")))?;
        self.snapshot.validate()?;
        self.publish.validate()?;
        self.verifier.validate()?;
        self.backup.validate()?;
        self.logging.validate()?;
        Ok(())
    }

    /// Builds the event log described by `[logging]`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] when the log file cannot be opened.
    pub fn event_log(&self, clock: Arc<dyn Clock>) -> Result<EventLog, ConfigError> {
        Ok(EventLog::new(self.logging.build_sink()?, clock))
    }

    /// Builds the publish target described by `[publish]`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the object-store client cannot be built.
    pub fn publish_target(&self, clock: Arc<dyn Clock>, log: &EventLog) -> Result<PublishTarget, ConfigError> {
        self.publish.build(clock, log)
    }
}

// ============================================================================
// SECTION: Snapshot
// ============================================================================

/// `[snapshot]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotSection {
    /// Snapshot engine settings, inlined into the section.
    #[serde(flatten)]
    pub engine: SnapshotConfig,
    /// Timeout for one snapshot-and-publish cycle.
    #[serde(default = "default_cycle_timeout_ms")]
    pub cycle_timeout_ms: u64,
    /// Directory for snapshots awaiting publish.
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
}

impl Default for SnapshotSection {
    fn default() -> Self {
        Self {
            engine: SnapshotConfig::default(),
            cycle_timeout_ms: DEFAULT_CYCLE_TIMEOUT_MS,
            staging_dir: PathBuf::from(DEFAULT_STAGING_DIR),
        }
    }
}

/// Returns the default cycle timeout.
const fn default_cycle_timeout_ms() -> u64 {
    DEFAULT_CYCLE_TIMEOUT_MS
}

/// Returns the default staging directory.
fn default_staging_dir() -> PathBuf {
    PathBuf::from(DEFAULT_STAGING_DIR)
}

impl SnapshotSection {
    /// Returns the cycle timeout.
    #[must_use]
    pub const fn cycle_timeout(&self) -> Duration {
        Duration::from_millis(self.cycle_timeout_ms)
    }

    /// Validates snapshot settings.
    fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate().map_err(|err| ConfigError::Invalid(format!("snapshot: {err}")))?;
        if self.cycle_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "snapshot.cycle_timeout_ms must be greater than zero".to_string(),
            ));
        }
        validate_path(&self.staging_dir)
    }
}

// ============================================================================
// SECTION: Publish
// ============================================================================

/// Publish target selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PublishTargetKind {
    /// No snapshots are taken or kept.
    #[default]
    Noop,
    /// Timestamped snapshot files in `backups_dir`, pruned to `archive_keep`.
    Archive,
    /// Atomic install at `local_path`.
    Local,
    /// Two-phase publish to `object_store`.
    Remote,
}

/// `[publish]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Target selection.
    #[serde(default)]
    pub target: PublishTargetKind,
    /// Directory for the archive target's snapshot files.
    #[serde(default = "default_backups_dir")]
    pub backups_dir: PathBuf,
    /// Snapshot files the archive target retains.
    #[serde(default = "default_archive_keep")]
    pub archive_keep: usize,
    /// Destination of the local target.
    #[serde(default)]
    pub local_path: Option<PathBuf>,
    /// Object store of the remote target.
    #[serde(default)]
    pub object_store: Option<ObjectStoreConfig>,
    /// Key always holding the latest snapshot.
    #[serde(default = "default_current_key")]
    pub current_key: String,
    /// Attempts for the backup copy.
    #[serde(default = "default_backup_copy_attempts")]
    pub backup_copy_attempts: u32,
    /// Backoff base for the backup copy in milliseconds.
    #[serde(default = "default_backup_copy_backoff_ms")]
    pub backup_copy_backoff_ms: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            target: PublishTargetKind::default(),
            backups_dir: default_backups_dir(),
            archive_keep: default_archive_keep(),
            local_path: None,
            object_store: None,
            current_key: default_current_key(),
            backup_copy_attempts: default_backup_copy_attempts(),
            backup_copy_backoff_ms: default_backup_copy_backoff_ms(),
        }
    }
}

/// Returns the default backups directory.
fn default_backups_dir() -> PathBuf {
    PathBuf::from(DEFAULT_BACKUPS_DIR)
}

/// Returns the default archive retention.
const fn default_archive_keep() -> usize {
    DEFAULT_ARCHIVE_KEEP
}

/// Returns the default current key.
fn default_current_key() -> String {
    DEFAULT_CURRENT_KEY.to_string()
}

/// Returns the default backup copy attempt bound.
fn default_backup_copy_attempts() -> u32 {
    RetryPolicy::default().max_attempts
}

/// Returns the default backup copy backoff base.
fn default_backup_copy_backoff_ms() -> u64 {
    u64::try_from(RetryPolicy::default().base_backoff.as_millis()).unwrap_or(u64::MAX)
}

impl PublishConfig {
    /// Returns the backup copy retry policy.
    #[must_use]
    pub const fn backup_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.backup_copy_attempts, Duration::from_millis(self.backup_copy_backoff_ms))
    }

    /// Validates publish settings.
    fn validate(&self) -> Result<(), ConfigError> {
        validate_path(&self.backups_dir)?;
        if self.backup_copy_attempts == 0 {
            return Err(ConfigError::Invalid(
                "publish.backup_copy_attempts must be greater than zero".to_string(),
            ));
        }
        match self.target {
            PublishTargetKind::Noop => Ok(()),
            PublishTargetKind::Archive => {
                if self.archive_keep == 0 || self.archive_keep > MAX_ARCHIVE_KEEP {
                    return Err(ConfigError::Invalid(format!(
                        "publish.archive_keep must be between 1 and {MAX_ARCHIVE_KEEP}"
                    )));
                }
                Ok(())
            }
            PublishTargetKind::Local => {
                let path = self.local_path.as_deref().ok_or_else(|| {
                    ConfigError::Invalid("publish.target=local requires publish.local_path".to_string())
                })?;
                validate_path(path)
            }
            PublishTargetKind::Remote => {
                let store = self.object_store.as_ref().ok_or_else(|| {
                    ConfigError::Invalid(
                        "publish.target=remote requires [publish.object_store]".to_string(),
                    )
                })?;
                store.validate().map_err(|err| ConfigError::Invalid(format!("publish.object_store: {err}")))?;
                validate_key(&self.current_key)
                    .map_err(|err| ConfigError::Invalid(format!("publish.current_key: {err}")))
            }
        }
    }

    /// Builds the configured target.
    fn build(&self, clock: Arc<dyn Clock>, log: &EventLog) -> Result<PublishTarget, ConfigError> {
        match self.target {
            PublishTargetKind::Noop => Ok(PublishTarget::Noop),
            PublishTargetKind::Archive => ArchiveTarget::new(&self.backups_dir, self.archive_keep, clock, log)
                .map(PublishTarget::Archive)
                .map_err(|err| ConfigError::Invalid(err.to_string())),
            PublishTargetKind::Local => {
                let path = self.local_path.clone().ok_or_else(|| {
                    ConfigError::Invalid("publish.target=local requires publish.local_path".to_string())
                })?;
                Ok(PublishTarget::Local(LocalPublisher::new(path, log)))
            }
            PublishTargetKind::Remote => {
                let store = self.object_store.as_ref().ok_or_else(|| {
                    ConfigError::Invalid(
                        "publish.target=remote requires [publish.object_store]".to_string(),
                    )
                })?;
                let client = build_client(store).map_err(|err| ConfigError::Invalid(err.to_string()))?;
                let publisher =
                    RemotePublisher::new(client, self.current_key.clone(), clock, log, self.backup_retry())
                        .map_err(|err| ConfigError::Invalid(err.to_string()))?;
                Ok(PublishTarget::Remote(publisher))
            }
        }
    }
}

// ============================================================================
// SECTION: Verifier
// ============================================================================

/// `[verifier]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerifierConfig {
    /// Concurrent writer threads.
    #[serde(default = "default_writers")]
    pub writers: usize,
    /// Rows per writer transaction.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Run length in milliseconds.
    #[serde(default = "default_duration_ms")]
    pub duration_ms: u64,
    /// Tick interval in milliseconds.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Scratch directory for the verifier's store and snapshots.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Consecutive contention failures tolerated per row.
    #[serde(default = "default_write_max_attempts")]
    pub write_max_attempts: u32,
    /// Writer backoff base in milliseconds.
    #[serde(default = "default_write_base_backoff_ms")]
    pub write_base_backoff_ms: u64,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            writers: DEFAULT_WRITERS,
            batch_size: DEFAULT_BATCH_SIZE,
            duration_ms: DEFAULT_DURATION_MS,
            interval_ms: DEFAULT_INTERVAL_MS,
            work_dir: default_work_dir(),
            write_max_attempts: DEFAULT_WRITE_MAX_ATTEMPTS,
            write_base_backoff_ms: DEFAULT_WRITE_BASE_BACKOFF_MS,
        }
    }
}

/// Returns the default writer count.
const fn default_writers() -> usize {
    DEFAULT_WRITERS
}

/// Returns the default batch size.
const fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

/// Returns the default run length.
const fn default_duration_ms() -> u64 {
    DEFAULT_DURATION_MS
}

/// Returns the default tick interval.
const fn default_interval_ms() -> u64 {
    DEFAULT_INTERVAL_MS
}

/// Returns the default scratch directory.
fn default_work_dir() -> PathBuf {
    PathBuf::from(DEFAULT_WORK_DIR)
}

/// Returns the default writer retry bound.
const fn default_write_max_attempts() -> u32 {
    DEFAULT_WRITE_MAX_ATTEMPTS
}

/// Returns the default writer backoff base.
const fn default_write_base_backoff_ms() -> u64 {
    DEFAULT_WRITE_BASE_BACKOFF_MS
}

impl VerifierConfig {
    /// Returns the writer retry policy.
    #[must_use]
    pub const fn write_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.write_max_attempts, Duration::from_millis(self.write_base_backoff_ms))
    }

    /// Validates verifier settings.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.writers == 0 || self.writers > MAX_WRITERS {
            return Err(ConfigError::Invalid(format!(
                "verifier.writers must be between 1 and {MAX_WRITERS}"
            )));
        }
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(ConfigError::Invalid(format!(
                "verifier.batch_size must be between 1 and {MAX_BATCH_SIZE}"
            )));
        }
        if self.interval_ms == 0 {
            return Err(ConfigError::Invalid("verifier.interval_ms must be greater than zero".to_string()));
        }
        if self.write_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "verifier.write_max_attempts must be greater than zero".to_string(),
            ));
        }
        validate_path(&self.work_dir)
    }
}

// ============================================================================
// SECTION: Backup
// ============================================================================

/// `[backup]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupConfig {
    /// Periodic backup interval; absent disables the timer.
    #[serde(default)]
    pub periodic_interval_ms: Option<u64>,
    /// Timeout for one periodic or shutdown backup.
    #[serde(default = "default_backup_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            periodic_interval_ms: None,
            timeout_ms: DEFAULT_BACKUP_TIMEOUT_MS,
        }
    }
}

/// Returns the default backup timeout.
const fn default_backup_timeout_ms() -> u64 {
    DEFAULT_BACKUP_TIMEOUT_MS
}

impl BackupConfig {
    /// Returns the periodic interval, if enabled.
    #[must_use]
    pub fn periodic_interval(&self) -> Option<Duration> {
        self.periodic_interval_ms.map(Duration::from_millis)
    }

    /// Returns the per-backup timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Validates backup settings.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.periodic_interval_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "backup.periodic_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::Invalid("backup.timeout_ms must be greater than zero".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// SECTION: Logging
// ============================================================================

/// Log destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogSinkKind {
    /// JSON lines on stderr.
    #[default]
    Stderr,
    /// JSON lines appended to `path`.
    File,
    /// Discard events.
    None,
}

/// `[logging]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LoggingConfig {
    /// Destination.
    #[serde(default)]
    pub sink: LogSinkKind,
    /// File path for the file sink.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Minimum level recorded.
    #[serde(default)]
    pub level: Level,
}

impl LoggingConfig {
    /// Validates logging settings.
    fn validate(&self) -> Result<(), ConfigError> {
        match (self.sink, &self.path) {
            (LogSinkKind::File, None) => {
                Err(ConfigError::Invalid("logging.sink=file requires logging.path".to_string()))
            }
            (LogSinkKind::File, Some(path)) => validate_path(path),
            _ => Ok(()),
        }
    }

    /// Builds the configured sink, filtered to `level`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] when the log file cannot be opened.
    pub fn build_sink(&self) -> Result<Arc<dyn EventSink>, ConfigError> {
        let inner: Arc<dyn EventSink> = match self.sink {
            LogSinkKind::Stderr => Arc::new(StderrEventSink),
            LogSinkKind::None => return Ok(Arc::new(NoopEventSink)),
            LogSinkKind::File => {
                let path = self.path.as_deref().ok_or_else(|| {
                    ConfigError::Invalid("logging.sink=file requires logging.path".to_string())
                })?;
                Arc::new(FileEventSink::new(path).map_err(|err| ConfigError::Io(err.to_string()))?)
            }
        };
        Ok(Arc::new(LevelFilterSink::new(inner, self.level)))
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Configuration loading or validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O failure while reading configuration.
    #[error("config io error: {0}")]
    Io(String),
    /// TOML parsing error.
    #[error("config parse error: {0}")]
    Parse(String),
    /// Invalid configuration data.
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Resolves the config path; the flag reports whether it was requested.
fn resolve_path(path: Option<&Path>) -> Result<(PathBuf, bool), ConfigError> {
    if let Some(path) = path {
        return Ok((path.to_path_buf(), true));
    }
    if let Ok(env_path) = env::var(CONFIG_ENV_VAR) {
        if env_path.len() > MAX_TOTAL_PATH_LENGTH {
            return Err(ConfigError::Invalid("config path exceeds max length".to_string()));
        }
        return Ok((PathBuf::from(env_path), true));
    }
    Ok((PathBuf::from(DEFAULT_CONFIG_NAME), false))
}

/// Validates a configured path against length limits.
fn validate_path(path: &Path) -> Result<(), ConfigError> {
    let text = path.to_string_lossy();
    if text.is_empty() {
        return Err(ConfigError::Invalid("path must not be empty".to_string()));
    }
    if text.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(ConfigError::Invalid("path exceeds max length".to_string()));
    }
    for component in path.components() {
        let value = component.as_os_str().to_string_lossy();
        if value.len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(ConfigError::Invalid("path component too long".to_string()));
        }
    }
    Ok(())
}
