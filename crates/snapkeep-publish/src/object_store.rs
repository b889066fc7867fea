// crates/snapkeep-publish/src/object_store.rs
// ============================================================================
// Module: Object Store Client
// Description: Minimal object-store capability and its S3 implementation.
// Purpose: Give the remote publisher upload, copy, delete, and fetch primitives.
// Dependencies: aws-config, aws-sdk-s3, serde, thiserror, tokio
// ============================================================================

//! ## Overview
//! The remote publisher depends only on [`ObjectStoreClient`]: upload a
//! file, fetch an object into a file, server-side copy, delete, and an
//! existence check. Each client is bound to one bucket. The S3 client runs
//! the async SDK on a private runtime and blocks the calling thread, so the
//! publisher stays synchronous like the rest of the snapshot path.
//!
//! Object keys are restricted to a conservative character set so they can
//! be used verbatim as S3 copy sources and as relative filesystem paths.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use aws_config::BehaviorVersion;
use aws_config::Region;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::runtime::Runtime;
use tokio::runtime::RuntimeFlavor;

use crate::filesystem::FilesystemObjectStore;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Maximum length of a single key segment.
const MAX_KEY_SEGMENT_LENGTH: usize = 255;
/// Maximum total key length.
const MAX_KEY_LENGTH: usize = 1024;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Object-store errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ObjectStoreError {
    /// Invalid configuration or key.
    #[error("object store invalid: {0}")]
    Invalid(String),
    /// Local I/O failure.
    #[error("object store io error: {0}")]
    Io(String),
    /// Backend returned an error.
    #[error("object store backend error: {0}")]
    Backend(String),
    /// Source object of a copy or fetch does not exist.
    #[error("object not found: {0}")]
    NotFound(String),
}

// ============================================================================
// SECTION: Client Trait
// ============================================================================

/// Object-store capability bound to one bucket.
pub trait ObjectStoreClient: Send + Sync {
    /// Uploads the file at `source` to `key`, replacing any object there.
    ///
    /// # Errors
    ///
    /// Returns [`ObjectStoreError`] when the file cannot be read or stored.
    fn put_file(&self, key: &str, source: &Path) -> Result<(), ObjectStoreError>;

    /// Writes the object at `key` to `dest`; returns `false` if absent.
    ///
    /// # Errors
    ///
    /// Returns [`ObjectStoreError`] on backend or local I/O failure.
    fn get_to_file(&self, key: &str, dest: &Path) -> Result<bool, ObjectStoreError>;

    /// Server-side copies `from` to `to`; readers of `to` see old or new.
    ///
    /// # Errors
    ///
    /// Returns [`ObjectStoreError::NotFound`] when `from` is missing, or any
    /// backend failure.
    fn copy(&self, from: &str, to: &str) -> Result<(), ObjectStoreError>;

    /// Deletes `key`; deleting a missing key succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`ObjectStoreError`] on backend failure.
    fn delete(&self, key: &str) -> Result<(), ObjectStoreError>;

    /// Returns true when `key` exists.
    ///
    /// # Errors
    ///
    /// Returns [`ObjectStoreError`] on backend failure.
    fn exists(&self, key: &str) -> Result<bool, ObjectStoreError>;

    /// Human-readable location, e.g. `s3://bucket/prefix/`.
    fn describe(&self) -> String;
}

// ============================================================================
// SECTION: Config
// ============================================================================

/// Supported object-store providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectStoreProvider {
    /// Amazon S3 compatible object storage.
    S3,
    /// A local directory standing in for a bucket.
    Filesystem,
}

/// Object-store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObjectStoreConfig {
    /// Provider selection.
    pub provider: ObjectStoreProvider,
    /// Bucket name (S3) or root directory (filesystem).
    pub bucket: String,
    /// Optional region (S3 only; defaults to environment).
    #[serde(default)]
    pub region: Option<String>,
    /// Optional S3-compatible endpoint.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Optional key prefix inside the bucket.
    #[serde(default)]
    pub prefix: Option<String>,
    /// Force path-style addressing (S3-compatible).
    #[serde(default)]
    pub force_path_style: bool,
    /// Allow non-TLS endpoints (explicit opt-in).
    #[serde(default)]
    pub allow_http: bool,
}

impl ObjectStoreConfig {
    /// Validates bucket, endpoint, and prefix.
    ///
    /// # Errors
    ///
    /// Returns [`ObjectStoreError::Invalid`] on a bad setting.
    pub fn validate(&self) -> Result<(), ObjectStoreError> {
        if self.bucket.trim().is_empty() {
            return Err(ObjectStoreError::Invalid("bucket must be set".to_string()));
        }
        if let Some(endpoint) = &self.endpoint {
            let trimmed = endpoint.trim();
            if !(trimmed.starts_with("https://") || trimmed.starts_with("http://")) {
                return Err(ObjectStoreError::Invalid(
                    "endpoint must include http:// or https://".to_string(),
                ));
            }
            if trimmed.starts_with("http://") && !self.allow_http {
                return Err(ObjectStoreError::Invalid(
                    "endpoint uses http:// without allow_http".to_string(),
                ));
            }
        }
        if let Some(prefix) = &self.prefix {
            normalize_prefix(prefix)?;
        }
        Ok(())
    }
}

/// Builds a client for `config`.
///
/// # Errors
///
/// Returns [`ObjectStoreError`] when validation or client setup fails.
pub fn build_client(config: &ObjectStoreConfig) -> Result<Arc<dyn ObjectStoreClient>, ObjectStoreError> {
    config.validate()?;
    let prefix = normalize_prefix(config.prefix.as_deref().unwrap_or(""))?;
    match config.provider {
        ObjectStoreProvider::S3 => Ok(Arc::new(S3ObjectStoreClient::new(config, prefix)?)),
        ObjectStoreProvider::Filesystem => {
            let root = Path::new(&config.bucket).join(prefix.trim_end_matches('/'));
            Ok(Arc::new(FilesystemObjectStore::new(root)?))
        }
    }
}

// ============================================================================
// SECTION: Runtime Helpers
// ============================================================================

/// Blocks on an object-store future using a compatible runtime.
fn block_on_with_runtime<F, T>(runtime: &Runtime, future: F) -> Result<T, ObjectStoreError>
where
    F: Future<Output = Result<T, ObjectStoreError>> + Send + 'static,
    T: Send + 'static,
{
    if let Ok(handle) = Handle::try_current() {
        if matches!(handle.runtime_flavor(), RuntimeFlavor::MultiThread) {
            return tokio::task::block_in_place(|| handle.block_on(future));
        }
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        std::thread::spawn(move || {
            let result = Runtime::new()
                .map_err(|err| ObjectStoreError::Io(err.to_string()))
                .and_then(|runtime| runtime.block_on(future));
            let _ = tx.send(result);
        });
        return rx
            .recv()
            .unwrap_or_else(|_| Err(ObjectStoreError::Io("object store thread join failed".to_string())));
    }
    runtime.block_on(future)
}

// ============================================================================
// SECTION: S3 Client
// ============================================================================

/// S3-backed object-store client.
pub struct S3ObjectStoreClient {
    /// Underlying S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Normalised key prefix (empty or ending in `/`).
    prefix: String,
    /// Runtime for blocking S3 calls.
    runtime: Option<Arc<Runtime>>,
}

impl Drop for S3ObjectStoreClient {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            let _ = std::thread::spawn(move || drop(runtime));
        }
    }
}

impl S3ObjectStoreClient {
    /// Builds a client from configuration and a normalised prefix.
    fn new(config: &ObjectStoreConfig, prefix: String) -> Result<Self, ObjectStoreError> {
        let runtime = Runtime::new().map_err(|err| ObjectStoreError::Io(err.to_string()))?;
        let region = config.region.clone();
        let endpoint = config.endpoint.clone();
        let shared_config = block_on_with_runtime(&runtime, async {
            let mut loader = aws_config::defaults(BehaviorVersion::latest());
            if let Some(region) = region {
                loader = loader.region(Region::new(region));
            }
            if let Some(endpoint) = endpoint {
                loader = loader.endpoint_url(endpoint);
            }
            Ok(loader.load().await)
        })?;
        let mut s3_builder = aws_sdk_s3::config::Builder::from(&shared_config);
        if config.force_path_style {
            s3_builder = s3_builder.force_path_style(true);
        }
        Ok(Self {
            client: Client::from_conf(s3_builder.build()),
            bucket: config.bucket.clone(),
            prefix,
            runtime: Some(Arc::new(runtime)),
        })
    }

    /// Validates `key` and applies the prefix.
    fn full_key(&self, key: &str) -> Result<String, ObjectStoreError> {
        validate_key(key)?;
        Ok(format!("{}{key}", self.prefix))
    }

    /// Returns the runtime or an error after shutdown.
    fn runtime(&self) -> Result<&Runtime, ObjectStoreError> {
        self.runtime
            .as_ref()
            .map(AsRef::as_ref)
            .ok_or_else(|| ObjectStoreError::Io("object store runtime closed".to_string()))
    }
}

impl ObjectStoreClient for S3ObjectStoreClient {
    fn put_file(&self, key: &str, source: &Path) -> Result<(), ObjectStoreError> {
        let key = self.full_key(key)?;
        let bucket = self.bucket.clone();
        let client = self.client.clone();
        let source = source.to_path_buf();
        block_on_with_runtime(self.runtime()?, async move {
            let body = ByteStream::from_path(&source)
                .await
                .map_err(|err| ObjectStoreError::Io(err.to_string()))?;
            client
                .put_object()
                .bucket(bucket)
                .key(key)
                .content_type("application/vnd.sqlite3")
                .body(body)
                .send()
                .await
                .map_err(|err| ObjectStoreError::Backend(err.to_string()))?;
            Ok(())
        })
    }

    fn get_to_file(&self, key: &str, dest: &Path) -> Result<bool, ObjectStoreError> {
        let key = self.full_key(key)?;
        let bucket = self.bucket.clone();
        let client = self.client.clone();
        let dest = dest.to_path_buf();
        block_on_with_runtime(self.runtime()?, async move {
            let output = match client.get_object().bucket(bucket).key(key).send().await {
                Ok(output) => output,
                Err(err) if err.as_service_error().is_some_and(|service| service.is_no_such_key()) => {
                    return Ok(false);
                }
                Err(err) => return Err(ObjectStoreError::Backend(err.to_string())),
            };
            let mut reader = output.body.into_async_read();
            let mut file = tokio::fs::File::create(&dest)
                .await
                .map_err(|err| ObjectStoreError::Io(err.to_string()))?;
            tokio::io::copy(&mut reader, &mut file)
                .await
                .map_err(|err| ObjectStoreError::Io(err.to_string()))?;
            file.sync_all().await.map_err(|err| ObjectStoreError::Io(err.to_string()))?;
            Ok(true)
        })
    }

    fn copy(&self, from: &str, to: &str) -> Result<(), ObjectStoreError> {
        let source = format!("{}/{}", self.bucket, self.full_key(from)?);
        let to = self.full_key(to)?;
        let bucket = self.bucket.clone();
        let client = self.client.clone();
        block_on_with_runtime(self.runtime()?, async move {
            client
                .copy_object()
                .bucket(bucket)
                .copy_source(source.clone())
                .key(to)
                .send()
                .await
                .map_err(|err| {
                    if err.as_service_error().is_some_and(|service| {
                        service.meta().code() == Some("NoSuchKey")
                    }) {
                        ObjectStoreError::NotFound(source)
                    } else {
                        ObjectStoreError::Backend(err.to_string())
                    }
                })?;
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        let key = self.full_key(key)?;
        let bucket = self.bucket.clone();
        let client = self.client.clone();
        block_on_with_runtime(self.runtime()?, async move {
            client
                .delete_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|err| ObjectStoreError::Backend(err.to_string()))?;
            Ok(())
        })
    }

    fn exists(&self, key: &str) -> Result<bool, ObjectStoreError> {
        let key = self.full_key(key)?;
        let bucket = self.bucket.clone();
        let client = self.client.clone();
        block_on_with_runtime(self.runtime()?, async move {
            match client.head_object().bucket(bucket).key(key).send().await {
                Ok(_) => Ok(true),
                Err(err) if err.as_service_error().is_some_and(|service| service.is_not_found()) => {
                    Ok(false)
                }
                Err(err) => Err(ObjectStoreError::Backend(err.to_string())),
            }
        })
    }

    fn describe(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.prefix)
    }
}

// ============================================================================
// SECTION: Key Helpers
// ============================================================================

/// Validates an object key.
///
/// Keys are relative, `/`-separated, and limited to ASCII alphanumerics and
/// `._-` in each segment.
///
/// # Errors
///
/// Returns [`ObjectStoreError::Invalid`] for empty, oversized, traversing, or
/// otherwise unsafe keys.
pub fn validate_key(key: &str) -> Result<(), ObjectStoreError> {
    if key.is_empty() {
        return Err(ObjectStoreError::Invalid("key must be set".to_string()));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(ObjectStoreError::Invalid("key exceeds length limit".to_string()));
    }
    if key.starts_with('/') || key.ends_with('/') {
        return Err(ObjectStoreError::Invalid(format!("key must be relative: {key}")));
    }
    for segment in key.split('/') {
        validate_segment(segment)?;
    }
    Ok(())
}

/// Validates one key segment.
fn validate_segment(segment: &str) -> Result<(), ObjectStoreError> {
    if segment.is_empty() || segment == "." || segment == ".." {
        return Err(ObjectStoreError::Invalid("key segment is invalid".to_string()));
    }
    if segment.len() > MAX_KEY_SEGMENT_LENGTH {
        return Err(ObjectStoreError::Invalid("key segment exceeds length limit".to_string()));
    }
    if !segment.chars().all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-')) {
        return Err(ObjectStoreError::Invalid(format!(
            "key segment contains invalid characters: {segment}"
        )));
    }
    Ok(())
}

/// Normalises a prefix to empty or `segment/.../`.
fn normalize_prefix(raw: &str) -> Result<String, ObjectStoreError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(String::new());
    }
    if trimmed.starts_with('/') {
        return Err(ObjectStoreError::Invalid(
            "prefix must be relative (no leading slash)".to_string(),
        ));
    }
    let normalized = trimmed.strip_suffix('/').unwrap_or(trimmed);
    validate_key(normalized)?;
    Ok(format!("{normalized}/"))
}

/// Returns the final `/`-separated segment of `key`.
#[must_use]
pub fn key_basename(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

// ============================================================================
// SECTION: Tests
// ============================================================================
