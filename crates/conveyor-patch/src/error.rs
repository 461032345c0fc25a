//! Patch failure taxonomy.
//!
//! Application outcomes that used to be control flow (a patch already
//! landed, a classified conflict) are explicit `PatchApplyError` variants;
//! `PatchError` covers everything else the engine can report. Messages are
//! written to be pasted into review comments, so they name the patch and
//! explain the failure in one sentence.

use conveyor_core::git::GitError;
use thiserror::Error;

/// Errors from applying a patch to a checkout.
#[derive(Debug, Error)]
pub enum PatchApplyError {
    /// The commit is already present in the target branch; informational.
    #[error("{patch} conflicted with {} because it's already committed", scope(*.inflight))]
    AlreadyApplied { patch: String, inflight: bool },

    /// A genuine textual conflict, or (with `trivial`) a rejection caused
    /// purely by the trivial merge strategy being required.
    #[error("{patch} conflicted with {}{}{}", scope(*.inflight), trivial_suffix(*.trivial),
        files_suffix(.files))]
    Conflict {
        patch: String,
        inflight: bool,
        trivial: bool,
        files: Vec<String>,
    },

    /// The patch deletes files that are already gone from the tree; git
    /// silently drops the double-delete instead of flagging it.
    #[error("{patch} deletes files no longer present in {}{}", scope(*.inflight),
        files_suffix(.files))]
    DeletedFileConflict {
        patch: String,
        inflight: bool,
        files: Vec<String>,
    },

    /// cherry-pick exited with a code the classifier does not understand.
    #[error("{patch}: unclassified cherry-pick exit code {code}: {stderr}")]
    Fatal {
        patch: String,
        code: i32,
        stderr: String,
    },

    #[error(transparent)]
    Git(#[from] GitError),
}

impl PatchApplyError {
    /// Whether the failure is against the current patch series rather than
    /// the upstream tip.
    pub fn inflight(&self) -> bool {
        match self {
            PatchApplyError::AlreadyApplied { inflight, .. }
            | PatchApplyError::Conflict { inflight, .. }
            | PatchApplyError::DeletedFileConflict { inflight, .. } => *inflight,
            _ => false,
        }
    }
}

fn trivial_suffix(trivial: bool) -> &'static str {
    if trivial {
        " because file content merging is disabled for this project"
    } else {
        ""
    }
}

fn scope(inflight: bool) -> &'static str {
    if inflight {
        "the current patch series"
    } else {
        "the upstream tip"
    }
}

fn files_suffix(files: &[String]) -> String {
    if files.is_empty() {
        String::new()
    } else {
        format!("; conflicting files: {}", files.join(", "))
    }
}

/// Errors from patch identity, fetching and dependency handling.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("cannot parse patch dependency {text:?}: {reason}")]
    MalformedDep { text: String, reason: String },

    #[error("{patch} has a malformed CQ-DEPEND target: {text}")]
    BrokenCqDepends { patch: String, text: String },

    #[error("{patch} has a broken Change-Id: {message}")]
    BrokenChangeId {
        patch: String,
        message: String,
        missing: bool,
    },

    #[error("{patch} depends on {dep}, which {reason}")]
    Dependency {
        patch: String,
        dep: String,
        reason: String,
    },

    #[error("{patch}: range {range} contains merge commit {sha1}; refusing to infer a dependency chain")]
    MergeInRange {
        patch: String,
        range: String,
        sha1: String,
    },

    #[error("{patch}: fetch of {reference} did not produce expected sha1 {expected}")]
    FetchedWrongSha1 {
        patch: String,
        reference: String,
        expected: String,
    },

    #[error("operation {op} is not supported by this patch variant")]
    UnsupportedVariant { op: &'static str },

    #[error("{patch}: {message}")]
    Internal { patch: String, message: String },

    #[error(transparent)]
    Apply(#[from] PatchApplyError),

    #[error(transparent)]
    Git(#[from] GitError),
}

impl PatchError {
    /// Wrap a dependency's failure against the change that needed it.
    pub fn dependency(patch: impl Into<String>, dep: impl Into<String>, source: &PatchError) -> Self {
        PatchError::Dependency {
            patch: patch.into(),
            dep: dep.into(),
            reason: source.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PatchError>;
