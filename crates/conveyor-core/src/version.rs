//! Release version descriptors.
//!
//! A version is the 4-field tuple behind the `B.b.p` strings that name
//! buildspecs. The descriptor file is `KEY=value` per line; rewrites touch
//! only the version keys and preserve everything else byte-for-byte.

use std::cmp::Ordering;
use std::fmt;
use std::path::Path;

use thiserror::Error;
use tracing::info;

use crate::git::{self, GitError};

const KEY_CHROME_BRANCH: &str = "CHROME_BRANCH";
const KEY_BUILD: &str = "CHROMEOS_BUILD";
const KEY_BRANCH: &str = "CHROMEOS_BRANCH";
const KEY_PATCH: &str = "CHROMEOS_PATCH";

/// Local branch used to stage version-bump commits before pushing.
const PUSH_BRANCH: &str = "version_number_change";

/// Errors from parsing or persisting a version descriptor.
#[derive(Debug, Error)]
pub enum VersionUpdateError {
    #[error("malformed version string: {0:?}")]
    MalformedVersion(String),

    #[error("version descriptor missing key {0}")]
    MissingKey(&'static str),

    #[error("git failure while updating version file: {0}")]
    Git(#[from] GitError),

    #[error("io failure while updating version file: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VersionUpdateError>;

/// Which field a version increment advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncrType {
    /// New chrome branch: bumps chrome_branch and build_number together so
    /// versions never collide across branches.
    ChromeBranch,
    Build,
    Branch,
    Patch,
}

/// Parsed 4-field release version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub build_number: u32,
    pub branch_build_number: u32,
    pub patch_number: u32,
    pub chrome_branch: u32,
    pub incr_type: IncrType,
}

impl VersionInfo {
    /// Parse a `B.b.p` version string.
    pub fn from_version_string(
        version: &str,
        chrome_branch: u32,
        incr_type: IncrType,
    ) -> Result<Self> {
        let parse = |s: &str| {
            s.parse::<u32>()
                .map_err(|_| VersionUpdateError::MalformedVersion(version.to_string()))
        };
        let fields: Vec<&str> = version.split('.').collect();
        if fields.len() != 3 {
            return Err(VersionUpdateError::MalformedVersion(version.to_string()));
        }
        Ok(VersionInfo {
            build_number: parse(fields[0])?,
            branch_build_number: parse(fields[1])?,
            patch_number: parse(fields[2])?,
            chrome_branch,
            incr_type,
        })
    }

    /// Parse the `KEY=value` descriptor file contents.
    pub fn from_descriptor(contents: &str, incr_type: IncrType) -> Result<Self> {
        let lookup = |key: &'static str| -> Result<u32> {
            for line in contents.lines() {
                if let Some(value) = line.strip_prefix(key) {
                    if let Some(value) = value.strip_prefix('=') {
                        return value
                            .trim()
                            .parse::<u32>()
                            .map_err(|_| VersionUpdateError::MalformedVersion(line.to_string()));
                    }
                }
            }
            Err(VersionUpdateError::MissingKey(key))
        };
        Ok(VersionInfo {
            chrome_branch: lookup(KEY_CHROME_BRANCH)?,
            build_number: lookup(KEY_BUILD)?,
            branch_build_number: lookup(KEY_BRANCH)?,
            patch_number: lookup(KEY_PATCH)?,
            incr_type,
        })
    }

    /// The canonical `B.b.p` string.
    pub fn version_string(&self) -> String {
        format!(
            "{}.{}.{}",
            self.build_number, self.branch_build_number, self.patch_number
        )
    }

    /// Advance the version in place according to `incr_type` and return the
    /// new version string.
    pub fn increment_version(&mut self) -> String {
        match self.incr_type {
            IncrType::ChromeBranch => {
                self.chrome_branch += 1;
                self.build_number += 1;
                self.branch_build_number = 0;
                self.patch_number = 0;
            }
            IncrType::Build => {
                self.build_number += 1;
                self.branch_build_number = 0;
                self.patch_number = 0;
            }
            IncrType::Branch => {
                if self.patch_number == 0 {
                    self.branch_build_number += 1;
                } else {
                    self.patch_number += 1;
                }
            }
            IncrType::Patch => {
                self.patch_number += 1;
            }
        }
        self.version_string()
    }

    /// Filename prefix scoping buildspec discovery for this increment type.
    ///
    /// Branch increments only consider specs within the current build;
    /// build-level increments consider the whole branch directory.
    pub fn build_prefix(&self) -> String {
        match self.incr_type {
            IncrType::Branch => {
                if self.patch_number == 0 {
                    format!("{}.", self.build_number)
                } else {
                    format!("{}.{}.", self.build_number, self.branch_build_number)
                }
            }
            _ => String::new(),
        }
    }

    /// Rewrite the version keys of `contents`, preserving every other line.
    pub fn apply_to_descriptor(&self, contents: &str) -> String {
        let mut out = String::with_capacity(contents.len());
        for line in contents.lines() {
            let rewritten = self.rewrite_line(line);
            out.push_str(&rewritten);
            out.push('\n');
        }
        out
    }

    fn rewrite_line(&self, line: &str) -> String {
        for (key, value) in [
            (KEY_CHROME_BRANCH, self.chrome_branch),
            (KEY_BUILD, self.build_number),
            (KEY_BRANCH, self.branch_build_number),
            (KEY_PATCH, self.patch_number),
        ] {
            if line.strip_prefix(key).is_some_and(|r| r.starts_with('=')) {
                return format!("{key}={value}");
            }
        }
        line.to_string()
    }

    /// Persist this version into the descriptor file of a source checkout and
    /// push the change.
    ///
    /// The rewrite happens on a dedicated local branch; whatever the outcome,
    /// the checkout is returned to the tracked upstream branch so a failed
    /// push never leaves the tree on the staging branch.
    pub fn update_version_file(
        &self,
        repo_dir: &Path,
        version_file: &str,
        push_remote: &str,
        remote_branch: &str,
        message: &str,
    ) -> Result<()> {
        info!(
            version = %self.version_string(),
            file = version_file,
            "updating version descriptor"
        );

        let result = self.update_version_file_inner(
            repo_dir,
            version_file,
            push_remote,
            remote_branch,
            message,
        );

        // Unconditional cleanup: land back on the local tracking branch,
        // reset to the upstream copy, never on a detached HEAD.
        let tracked = format!("{push_remote}/{remote_branch}");
        let _ = git::run_git_unchecked(
            repo_dir,
            &["checkout", "-f", "-B", remote_branch, &tracked],
        );
        let _ = git::run_git_unchecked(repo_dir, &["branch", "-D", PUSH_BRANCH]);

        result
    }

    fn update_version_file_inner(
        &self,
        repo_dir: &Path,
        version_file: &str,
        push_remote: &str,
        remote_branch: &str,
        message: &str,
    ) -> Result<()> {
        let tracked = format!("{push_remote}/{remote_branch}");
        git::run_git(repo_dir, &["checkout", "-B", PUSH_BRANCH, "-t", &tracked])?;

        let path = repo_dir.join(version_file);
        let contents = std::fs::read_to_string(&path)?;
        std::fs::write(&path, self.apply_to_descriptor(&contents))?;

        git::run_git(repo_dir, &["add", version_file])?;
        git::run_git(repo_dir, &["commit", "-m", message])?;
        let refspec = format!("{PUSH_BRANCH}:{remote_branch}");
        git::run_git(repo_dir, &["push", push_remote, &refspec])?;
        Ok(())
    }
}

impl fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.version_string())
    }
}

impl PartialOrd for VersionInfo {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VersionInfo {
    /// Numeric-tuple order; never lexicographic.
    fn cmp(&self, other: &Self) -> Ordering {
        (self.build_number, self.branch_build_number, self.patch_number).cmp(&(
            other.build_number,
            other.branch_build_number,
            other.patch_number,
        ))
    }
}
