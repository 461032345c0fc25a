//! Builder status records and their blob-store contract.
//!
//! Many independent workers report completion by dropping one status blob
//! each under `{status-root}/{version}/{builder}`. The decode side is
//! deliberately forgiving: a missing key reads as `Missing` and a corrupt
//! blob reads as `Failed` with no message, so one malformed write can never
//! poison the master's polling loop.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::blobstore::{BlobStore, BlobStoreError, WritePrecondition};

/// Fixed status vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Failed,
    Passed,
    Inflight,
    Missing,
    Aborted,
}

impl BuildStatus {
    /// Status for a build that finished with the given success bit.
    pub fn completed_status(success: bool) -> Self {
        if success {
            BuildStatus::Passed
        } else {
            BuildStatus::Failed
        }
    }

    /// Whether this is a terminal state.
    pub fn completed(&self) -> bool {
        matches!(
            self,
            BuildStatus::Passed | BuildStatus::Failed | BuildStatus::Aborted
        )
    }
}

/// Immutable status value reported by one builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderStatus {
    pub status: BuildStatus,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub dashboard_url: Option<String>,
}

impl BuilderStatus {
    pub fn new(status: BuildStatus) -> Self {
        BuilderStatus {
            status,
            message: None,
            dashboard_url: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_dashboard_url(mut self, url: impl Into<String>) -> Self {
        self.dashboard_url = Some(url.into());
        self
    }

    pub fn passed(&self) -> bool {
        self.status == BuildStatus::Passed
    }

    pub fn failed(&self) -> bool {
        self.status == BuildStatus::Failed
    }

    pub fn inflight(&self) -> bool {
        self.status == BuildStatus::Inflight
    }

    pub fn missing(&self) -> bool {
        self.status == BuildStatus::Missing
    }

    pub fn completed(&self) -> bool {
        self.status.completed()
    }

    /// Store key for a builder's status blob.
    pub fn store_key(status_root: &str, version: &str, builder: &str) -> String {
        format!("{status_root}/{version}/{builder}")
    }

    /// Serialize for the blob store.
    pub fn to_blob(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("status record always serializes")
    }

    /// Decode a blob. Unrecognized bytes degrade to `Failed` with no
    /// message instead of erroring.
    pub fn from_blob(data: &[u8]) -> Self {
        match serde_json::from_slice(data) {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "unparseable builder status blob, treating as failed");
                BuilderStatus::new(BuildStatus::Failed)
            }
        }
    }

    /// Fetch a builder's status. Absent keys read as `Missing`.
    pub fn fetch(
        store: &dyn BlobStore,
        status_root: &str,
        version: &str,
        builder: &str,
    ) -> Result<Self, BlobStoreError> {
        let key = Self::store_key(status_root, version, builder);
        match store.cat(&key) {
            Ok(data) => Ok(Self::from_blob(&data)),
            Err(BlobStoreError::NotFound(_)) => Ok(BuilderStatus::new(BuildStatus::Missing)),
            Err(e) => Err(e),
        }
    }

    /// Upload this status for a builder.
    pub fn upload(
        &self,
        store: &dyn BlobStore,
        status_root: &str,
        version: &str,
        builder: &str,
        precondition: WritePrecondition,
    ) -> Result<(), BlobStoreError> {
        let key = Self::store_key(status_root, version, builder);
        store.copy(&self.to_blob(), &key, precondition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobstore::MemoryBlobStore;

    #[test]
    fn completed_status_maps_bool() {
        assert_eq!(BuildStatus::completed_status(true), BuildStatus::Passed);
        assert_eq!(BuildStatus::completed_status(false), BuildStatus::Failed);
    }

    #[test]
    fn terminal_states() {
        assert!(BuildStatus::Passed.completed());
        assert!(BuildStatus::Failed.completed());
        assert!(BuildStatus::Aborted.completed());
        assert!(!BuildStatus::Inflight.completed());
        assert!(!BuildStatus::Missing.completed());
    }

    #[test]
    fn store_roundtrip_preserves_fields() {
        let store = MemoryBlobStore::new();
        let status = BuilderStatus::new(BuildStatus::Passed)
            .with_message("all stages green")
            .with_dashboard_url("https://ci.example.com/b/42");
        status
            .upload(&store, "builder-status", "1.2.3", "x86-generic", WritePrecondition::None)
            .unwrap();

        let got = BuilderStatus::fetch(&store, "builder-status", "1.2.3", "x86-generic").unwrap();
        assert_eq!(got, status);
    }

    #[test]
    fn missing_key_reads_as_missing() {
        let store = MemoryBlobStore::new();
        let got = BuilderStatus::fetch(&store, "builder-status", "1.2.3", "nobody").unwrap();
        assert!(got.missing());
        assert_eq!(got.message, None);
    }

    #[test]
    fn corrupt_blob_reads_as_failed_without_error() {
        let store = MemoryBlobStore::new();
        store
            .copy(b"\x00not json at all", "builder-status/1.2.3/bad", WritePrecondition::None)
            .unwrap();
        let got = BuilderStatus::fetch(&store, "builder-status", "1.2.3", "bad").unwrap();
        assert!(got.failed());
        assert_eq!(got.message, None);
    }

    #[test]
    fn unknown_status_string_reads_as_failed() {
        let store = MemoryBlobStore::new();
        store
            .copy(
                br#"{"status": "exploded", "message": null}"#,
                "builder-status/1.2.3/odd",
                WritePrecondition::None,
            )
            .unwrap();
        let got = BuilderStatus::fetch(&store, "builder-status", "1.2.3", "odd").unwrap();
        assert!(got.failed());
    }
}
