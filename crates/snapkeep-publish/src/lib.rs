// crates/snapkeep-publish/src/lib.rs
// ============================================================================
// Module: Snapkeep Publish
// Description: Local and remote publication of snapshot files.
// Purpose: Make snapshots durable outside the process and restore them.
// Dependencies: snapkeep-core, snapkeep-store-sqlite, aws-sdk-s3
// ============================================================================

//! ## Overview
//! Snapshot files produced by the snapshot engine become durable here:
//! [`LocalPublisher`] installs them at a fixed path, [`RemotePublisher`]
//! runs a two-phase object-store publish with an immutable backup trail,
//! [`ArchiveTarget`] keeps a bounded directory of timestamped snapshots, and
//! [`PublishTarget`] ties one of them (or none) into the startup, periodic,
//! and shutdown backup lifecycle.

pub mod archive;
pub mod error;
pub mod filesystem;
pub mod local;
pub mod memory;
pub mod object_store;
pub mod remote;
pub mod target;

pub use archive::ArchiveReceipt;
pub use archive::ArchiveTarget;
pub use error::PublishError;
pub use filesystem::FilesystemObjectStore;
pub use local::LocalPublisher;
pub use local::LocalReceipt;
pub use local::publish_local;
pub use memory::InMemoryObjectStore;
pub use memory::ObjectOp;
pub use object_store::ObjectStoreClient;
pub use object_store::ObjectStoreConfig;
pub use object_store::ObjectStoreError;
pub use object_store::ObjectStoreProvider;
pub use object_store::S3ObjectStoreClient;
pub use object_store::build_client;
pub use remote::BACKUP_ROOT;
pub use remote::DownloadOutcome;
pub use remote::PublishReceipt;
pub use remote::RemotePublisher;
pub use target::BackupJob;
pub use target::BackupReport;
pub use target::PeriodicBackup;
pub use target::PublishReport;
pub use target::PublishTarget;
