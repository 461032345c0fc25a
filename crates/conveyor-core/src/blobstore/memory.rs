//! In-memory blob store backed by a `HashMap`, for tests and local runs.

use std::collections::HashMap;
use std::sync::Mutex;

use super::{validate_key, BlobStore, BlobStoreError, Result, WritePrecondition};

#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All keys currently stored, sorted. Test helper.
    pub fn keys(&self) -> Vec<String> {
        let blobs = self.blobs.lock().unwrap();
        let mut keys: Vec<String> = blobs.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl BlobStore for MemoryBlobStore {
    fn cat(&self, key: &str) -> Result<Vec<u8>> {
        validate_key(key)?;
        let blobs = self.blobs.lock().unwrap();
        blobs
            .get(key)
            .cloned()
            .ok_or_else(|| BlobStoreError::NotFound(key.to_string()))
    }

    fn copy(&self, data: &[u8], key: &str, precondition: WritePrecondition) -> Result<()> {
        validate_key(key)?;
        let mut blobs = self.blobs.lock().unwrap();
        if precondition == WritePrecondition::FailIfExists && blobs.contains_key(key) {
            return Err(BlobStoreError::PreconditionFailed(key.to_string()));
        }
        blobs.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        Ok(self.blobs.lock().unwrap().contains_key(key))
    }
}
