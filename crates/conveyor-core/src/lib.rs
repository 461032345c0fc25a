//! Conveyor core library
//!
//! Leaf value types and shared plumbing for the build coordinator:
//! version descriptors, builder status records, the blob-store boundary,
//! a synchronous git subprocess wrapper, manifest filtering, and the
//! retry/poll loop primitives the higher layers are built on.

pub mod blobstore;
pub mod git;
pub mod manifest;
pub mod retry;
pub mod status;
pub mod telemetry;
pub mod version;

pub use blobstore::{BlobStore, BlobStoreError, FsBlobStore, MemoryBlobStore, WritePrecondition};
pub use git::{GitError, GitOutput};
pub use manifest::{filter_manifest, FilterManifestError};
pub use retry::{poll_until, retry_with_reload, PollOutcome, RetryDecision};
pub use status::{BuildStatus, BuilderStatus};
pub use telemetry::init_tracing;
pub use version::{IncrType, VersionInfo, VersionUpdateError};
