//! Conveyor manifest-versions library
//!
//! Owns the buildspec lifecycle: minting ordered versions, publishing
//! immutable manifest snapshots into a shared versions repository, marking
//! builds inflight, recording pass/fail outcomes, and aggregating the
//! completion status many independent builders report through the blob
//! store.

pub mod build_db;
pub mod error;
pub mod slave_status;
pub mod specs_manager;

pub use build_db::{BuildDatabase, BuildDbError, BuildState, MemoryBuildDatabase};
pub use error::{SpecsError, SpecsResult};
pub use slave_status::{SlaveStatus, BUILDER_START_TIMEOUT};
pub use specs_manager::{BuildSpecsManager, ManagerConfig, PUSH_BRANCH};
