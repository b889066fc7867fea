// crates/snapkeep-publish/src/memory.rs
// ============================================================================
// Module: In-Memory Object Store
// Description: Map-backed object store with fault injection.
// Purpose: Drive publish-protocol tests without a network backend.
// Dependencies: none
// ============================================================================

//! ## Overview
//! [`InMemoryObjectStore`] keeps objects in a `BTreeMap`, records every
//! operation in order, and can be told to fail uploads, deletes, or copies
//! whose destination starts with a given prefix (always, or a fixed number
//! of times before recovering).

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use std::sync::PoisonError;

use crate::object_store::ObjectStoreClient;
use crate::object_store::ObjectStoreError;
use crate::object_store::validate_key;

/// One recorded operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectOp {
    /// Upload to a key.
    Put(String),
    /// Fetch of a key.
    Get(String),
    /// Server-side copy `(from, to)`.
    Copy(String, String),
    /// Delete of a key.
    Delete(String),
}

/// Copy fault targeting destinations under a prefix.
#[derive(Debug, Clone)]
struct CopyFault {
    /// Destination prefix that triggers the fault.
    prefix: String,
    /// Failures left; `None` fails forever.
    remaining: Option<u32>,
}

/// Injected faults.
#[derive(Debug, Default)]
struct Faults {
    /// Fail every upload.
    put: bool,
    /// Fail every delete.
    delete: bool,
    /// Copy faults by destination prefix.
    copies: Vec<CopyFault>,
}

/// Map-backed object store.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    /// Stored objects.
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    /// Operation history in call order.
    ops: Mutex<Vec<ObjectOp>>,
    /// Active faults.
    faults: Mutex<Faults>,
}

impl InMemoryObjectStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails copies into keys starting with `prefix`, `times` times or forever.
    pub fn fail_copies_into(&self, prefix: &str, times: Option<u32>) {
        lock(&self.faults).copies.push(CopyFault {
            prefix: prefix.to_string(),
            remaining: times,
        });
    }

    /// Fails every upload while `fail` is set.
    pub fn fail_puts(&self, fail: bool) {
        lock(&self.faults).put = fail;
    }

    /// Fails every delete while `fail` is set.
    pub fn fail_deletes(&self, fail: bool) {
        lock(&self.faults).delete = fail;
    }

    /// Removes every injected fault.
    pub fn clear_faults(&self) {
        *lock(&self.faults) = Faults::default();
    }

    /// Returns a copy of the object at `key`.
    #[must_use]
    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        lock(&self.objects).get(key).cloned()
    }

    /// Returns every stored key in order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        lock(&self.objects).keys().cloned().collect()
    }

    /// Returns the operation history.
    #[must_use]
    pub fn ops(&self) -> Vec<ObjectOp> {
        lock(&self.ops).clone()
    }

    /// Stores `bytes` at `key` directly, bypassing faults and history.
    pub fn insert(&self, key: &str, bytes: Vec<u8>) {
        lock(&self.objects).insert(key.to_string(), bytes);
    }

    /// Appends an operation to the history.
    fn record(&self, op: ObjectOp) {
        lock(&self.ops).push(op);
    }

    /// Consumes a copy fault matching `to`, if any.
    fn copy_fault(&self, to: &str) -> bool {
        let mut faults = lock(&self.faults);
        for fault in &mut faults.copies {
            if !to.starts_with(&fault.prefix) {
                continue;
            }
            match &mut fault.remaining {
                None => return true,
                Some(0) => {}
                Some(left) => {
                    *left -= 1;
                    return true;
                }
            }
        }
        false
    }
}

impl ObjectStoreClient for InMemoryObjectStore {
    fn put_file(&self, key: &str, source: &Path) -> Result<(), ObjectStoreError> {
        validate_key(key)?;
        self.record(ObjectOp::Put(key.to_string()));
        if lock(&self.faults).put {
            return Err(ObjectStoreError::Backend(format!("injected upload failure: {key}")));
        }
        let bytes = std::fs::read(source).map_err(|err| ObjectStoreError::Io(err.to_string()))?;
        lock(&self.objects).insert(key.to_string(), bytes);
        Ok(())
    }

    fn get_to_file(&self, key: &str, dest: &Path) -> Result<bool, ObjectStoreError> {
        validate_key(key)?;
        self.record(ObjectOp::Get(key.to_string()));
        let Some(bytes) = self.object(key) else {
            return Ok(false);
        };
        std::fs::write(dest, bytes).map_err(|err| ObjectStoreError::Io(err.to_string()))?;
        Ok(true)
    }

    fn copy(&self, from: &str, to: &str) -> Result<(), ObjectStoreError> {
        validate_key(from)?;
        validate_key(to)?;
        self.record(ObjectOp::Copy(from.to_string(), to.to_string()));
        if self.copy_fault(to) {
            return Err(ObjectStoreError::Backend(format!("injected copy failure: {to}")));
        }
        let mut objects = lock(&self.objects);
        let bytes = objects.get(from).cloned().ok_or_else(|| ObjectStoreError::NotFound(from.to_string()))?;
        objects.insert(to.to_string(), bytes);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        validate_key(key)?;
        self.record(ObjectOp::Delete(key.to_string()));
        if lock(&self.faults).delete {
            return Err(ObjectStoreError::Backend(format!("injected delete failure: {key}")));
        }
        lock(&self.objects).remove(key);
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool, ObjectStoreError> {
        validate_key(key)?;
        Ok(lock(&self.objects).contains_key(key))
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

/// Locks a mutex, recovering from poisoning.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
