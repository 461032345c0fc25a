//! Buildspec lifecycle failure taxonomy.

use conveyor_core::{BlobStoreError, GitError, VersionUpdateError};
use thiserror::Error;

use crate::build_db::BuildDbError;

#[derive(Debug, Error)]
pub enum SpecsError {
    /// API misuse or an invariant violation in the versions repository
    /// layout (for example one version appearing under two branches).
    #[error("buildspec value error: {0}")]
    Value(String),

    /// `get_next_build_spec` ran out of attempts. The mirror has been
    /// restored to a clean tracked state.
    #[error("no buildspec generated after {attempts} attempts: {source}")]
    Generation {
        attempts: u32,
        #[source]
        source: Box<SpecsError>,
    },

    /// `update_status` ran out of attempts. The mirror has been restored to
    /// a clean tracked state.
    #[error("build status not recorded after {attempts} attempts: {source}")]
    StatusUpdate {
        attempts: u32,
        #[source]
        source: Box<SpecsError>,
    },

    /// Another builder holds the inflight marker for this version.
    #[error("build {version} is already marked inflight")]
    AlreadyInflight { version: String },

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Blob(#[from] BlobStoreError),

    #[error(transparent)]
    Version(#[from] VersionUpdateError),

    #[error(transparent)]
    BuildDb(#[from] BuildDbError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SpecsResult<T> = std::result::Result<T, SpecsError>;
