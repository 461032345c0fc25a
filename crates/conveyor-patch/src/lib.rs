//! Conveyor patch engine
//!
//! Represents one code change bound for a validation run: identity across
//! the three Gerrit identifier spaces, transitive dependency resolution over
//! CQ-DEPEND commit-message lines and Gerrit parent chains, and application
//! onto a checkout through a classified git cherry-pick protocol.

pub mod error;
pub mod format;
pub mod gerrit;
pub mod local;
pub mod patch;
pub mod query;
pub mod resolve;

pub use error::{PatchApplyError, PatchError};
pub use format::{
    format_patch_dep, get_paladin_deps, parse_change_id, parse_full_change_id,
    parse_gerrit_number, parse_patch_dep, parse_sha1, DepConstraints, FormattedDep, Remote,
};
pub use gerrit::{Approval, GerritMeta, RawDependency, ReviewStatus};
pub use local::UploadOptions;
pub use patch::{GitRepoPatch, PatchSource, PATCH_BRANCH};
pub use query::{PatchCache, PatchQuery};
pub use resolve::resolve_transitive_deps;
