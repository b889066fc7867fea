// crates/snapkeep-publish/src/filesystem.rs
// ============================================================================
// Module: Filesystem Object Store
// Description: A directory that behaves like a single-bucket object store.
// Purpose: Run the remote publish protocol against local or mounted storage.
// Dependencies: rand
// ============================================================================

//! ## Overview
//! Keys map to relative paths under a root directory. Every write lands in
//! a uniquely named sibling temp file and is renamed into place, so a reader
//! of a key sees the old bytes or the new ones, never a mix, matching the
//! copy atomicity an object store provides.

use std::fs;
use std::fs::File;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use rand::Rng;

use crate::object_store::ObjectStoreClient;
use crate::object_store::ObjectStoreError;
use crate::object_store::validate_key;

/// Directory-backed object store.
#[derive(Debug, Clone)]
pub struct FilesystemObjectStore {
    /// Root directory standing in for the bucket.
    root: PathBuf,
}

impl FilesystemObjectStore {
    /// Opens (creating if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`ObjectStoreError::Io`] when the root cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, ObjectStoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|err| ObjectStoreError::Io(err.to_string()))?;
        Ok(Self {
            root,
        })
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a key to its path.
    fn path_for(&self, key: &str) -> Result<PathBuf, ObjectStoreError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    /// Copies `source` into `dest` through a sibling temp file and rename.
    fn install_from(source: &Path, dest: &Path) -> Result<(), ObjectStoreError> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|err| ObjectStoreError::Io(err.to_string()))?;
        }
        let temp = temp_sibling(dest);
        let result = copy_synced(source, &temp).and_then(|()| fs::rename(&temp, dest));
        if let Err(err) = result {
            let _ = fs::remove_file(&temp);
            return Err(ObjectStoreError::Io(err.to_string()));
        }
        Ok(())
    }
}

impl ObjectStoreClient for FilesystemObjectStore {
    fn put_file(&self, key: &str, source: &Path) -> Result<(), ObjectStoreError> {
        let dest = self.path_for(key)?;
        Self::install_from(source, &dest)
    }

    fn get_to_file(&self, key: &str, dest: &Path) -> Result<bool, ObjectStoreError> {
        let source = self.path_for(key)?;
        if !source.is_file() {
            return Ok(false);
        }
        copy_synced(&source, dest).map_err(|err| ObjectStoreError::Io(err.to_string()))?;
        Ok(true)
    }

    fn copy(&self, from: &str, to: &str) -> Result<(), ObjectStoreError> {
        let source = self.path_for(from)?;
        let dest = self.path_for(to)?;
        if !source.is_file() {
            return Err(ObjectStoreError::NotFound(from.to_string()));
        }
        Self::install_from(&source, &dest)
    }

    fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        match fs::remove_file(self.path_for(key)?) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(ObjectStoreError::Io(err.to_string())),
        }
    }

    fn exists(&self, key: &str) -> Result<bool, ObjectStoreError> {
        Ok(self.path_for(key)?.is_file())
    }

    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }
}

/// Copies `source` to `dest` and fsyncs the result.
fn copy_synced(source: &Path, dest: &Path) -> io::Result<()> {
    fs::copy(source, dest)?;
    File::open(dest)?.sync_all()
}

/// Returns a unique hidden temp path beside `dest`.
fn temp_sibling(dest: &Path) -> PathBuf {
    let name = dest.file_name().map_or_else(String::new, |name| name.to_string_lossy().into_owned());
    let nonce: u64 = rand::thread_rng().r#gen();
    dest.with_file_name(format!(".{name}.part-{nonce:016x}"))
}
