//! Blob-store boundary.
//!
//! Builders report status through a shared key-value store. The store is a
//! mailbox keyed by `{status-root}/{version}/{builder}`, not a CAS: keys are
//! caller-chosen paths and writes are last-write-wins unless a precondition
//! is requested. The `FailIfExists` precondition must be atomic in any
//! backend; it backs the in-flight marker.

pub mod fs;
pub mod memory;

use thiserror::Error;

pub use fs::FsBlobStore;
pub use memory::MemoryBlobStore;

/// Errors from blob-store operations.
#[derive(Debug, Error)]
pub enum BlobStoreError {
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("write precondition failed, key already exists: {0}")]
    PreconditionFailed(String),

    #[error("invalid blob key: {0}")]
    InvalidKey(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BlobStoreError>;

/// Write-time precondition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePrecondition {
    /// Unconditional last-write-wins.
    None,
    /// Atomic create-if-absent; the write fails with `PreconditionFailed`
    /// when the key already holds a blob.
    FailIfExists,
}

/// Key-value blob store interface.
pub trait BlobStore: Send + Sync {
    /// Read the blob at `key`. Absent keys are `NotFound`.
    fn cat(&self, key: &str) -> Result<Vec<u8>>;

    /// Write `data` at `key`, subject to `precondition`.
    fn copy(&self, data: &[u8], key: &str, precondition: WritePrecondition) -> Result<()>;

    /// Whether `key` holds a blob.
    fn exists(&self, key: &str) -> Result<bool>;
}

/// Reject keys that could escape a filesystem root or alias other keys.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.ends_with('/')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if bad {
        return Err(BlobStoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_validation() {
        assert!(validate_key("builder-status/1.2.3/x86-generic").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("/abs").is_err());
        assert!(validate_key("trailing/").is_err());
        assert!(validate_key("a//b").is_err());
        assert!(validate_key("a/../b").is_err());
    }
}
