//! The patch object and its cherry-pick application protocol.
//!
//! A `GitRepoPatch` starts with partial identity (a ref, maybe a sha1) and
//! is completed by `fetch`. Application happens on a dedicated local branch
//! tracking the upstream; failures are classified by cherry-pick exit code
//! into already-applied, content conflict, or trivial-strategy rejection,
//! and the work tree is always left clean.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use conveyor_core::git;

use crate::error::{PatchApplyError, PatchError, Result};
use crate::format::{add_prefix, parse_change_id, GERRIT_CHANGE_ID_LENGTH};
use crate::gerrit::GerritMeta;
use crate::query::PatchQuery;

/// Branch used to stack patches onto a checkout.
pub const PATCH_BRANCH: &str = "patch_branch";

/// Variant-specific capability and metadata.
///
/// Each variant carries only its own fields; Gerrit review metadata never
/// appears on local patches.
#[derive(Debug, Clone)]
pub enum PatchSource {
    /// A commit in an on-disk git repository.
    Local,
    /// A local commit re-uploaded to a temporary remote ref.
    UploadedLocal {
        original_branch: String,
        original_sha1: Option<String>,
    },
    /// A CL known to Gerrit, with its review metadata.
    Gerrit(GerritMeta),
}

/// One code change bound for a validation run.
#[derive(Debug, Clone)]
pub struct GitRepoPatch {
    pub query: PatchQuery,
    /// Url (or local path) of the git repo the patch is fetched from.
    pub project_url: String,
    /// Refspec to pull from that repo.
    pub ref_name: String,
    pub commit_message: Option<String>,
    pub subject: Option<String>,
    pub source: PatchSource,
    /// Repos this patch has already been fetched into.
    fetched: HashSet<PathBuf>,
}

impl GitRepoPatch {
    pub fn new(
        project_url: String,
        ref_name: String,
        query: PatchQuery,
        source: PatchSource,
    ) -> Self {
        GitRepoPatch {
            query,
            project_url,
            ref_name,
            commit_message: None,
            subject: None,
            source,
            fetched: HashSet::new(),
        }
    }

    /// Whether this patch targets the internal remote.
    pub fn internal(&self) -> bool {
        self.query.remote == crate::format::Remote::Internal
    }

    /// Short link naming this patch in errors and review comments.
    pub fn patch_link(&self) -> String {
        match &self.source {
            PatchSource::Gerrit(meta) => {
                format!("CL:{}", add_prefix(self.query.remote, &meta.gerrit_number))
            }
            _ => self.to_string(),
        }
    }

    /// Fetch this patch into `git_repo`, completing sha1, commit message and
    /// Change-Id. Memoized per target repository.
    ///
    /// When the sha1 is already known a local log lookup is tried first to
    /// avoid the network; FETCH_HEAD is implicitly reset otherwise.
    pub fn fetch(&mut self, git_repo: &Path) -> Result<String> {
        let repo_key = normalize_repo(git_repo);
        if self.fetched.contains(&repo_key) {
            return Ok(self
                .query
                .sha1
                .clone()
                .expect("fetched patches always have a sha1"));
        }

        let mut pulled = match &self.query.sha1 {
            Some(sha1) => pull_data(git_repo, sha1)?,
            None => None,
        };

        if pulled.is_none() {
            git::run_git(git_repo, &["fetch", &self.project_url, &self.ref_name])?;
            let rev = self.query.sha1.as_deref().unwrap_or("FETCH_HEAD");
            pulled = pull_data(git_repo, rev)?;
        }

        let (sha1, subject, message) = pulled.ok_or_else(|| PatchError::FetchedWrongSha1 {
            patch: self.patch_link(),
            reference: self.ref_name.clone(),
            expected: self.query.sha1.clone().unwrap_or_default(),
        })?;

        if let Some(expected) = &self.query.sha1 {
            // Even with a known sha1, verify we actually just fetched it.
            if &sha1 != expected {
                return Err(PatchError::FetchedWrongSha1 {
                    patch: self.patch_link(),
                    reference: self.ref_name.clone(),
                    expected: expected.clone(),
                });
            }
        }

        self.query.sha1 = Some(sha1.clone());
        self.ensure_change_id(&message)?;
        self.commit_message = Some(message);
        self.subject = Some(subject);
        self.fetched.insert(repo_key);
        Ok(sha1)
    }

    /// Make sure the patch has a usable Change-Id after a fetch.
    ///
    /// Local variants that lack one in their commit message get a
    /// synthesized id derived from the sha1, with a warning; the fetch
    /// itself never fails over a missing id. Gerrit patches validate our
    /// parse against what Gerrit reported.
    fn ensure_change_id(&mut self, commit_message: &str) -> Result<()> {
        let parsed = self.parse_change_id_from_message(commit_message);

        if let PatchSource::Gerrit(_) = self.source {
            // Gerrit supplied the id; the message is a cross-check.
            match parsed {
                Ok(from_message) => {
                    if self.query.change_id.as_deref() != Some(from_message.as_str()) {
                        return Err(PatchError::Internal {
                            patch: self.patch_link(),
                            message: format!(
                                "Change-Id parsed from the commit message ({from_message}) does \
                                 not match what Gerrit reported ({:?})",
                                self.query.change_id
                            ),
                        });
                    }
                }
                Err(_) => warn!(
                    patch = %self.patch_link(),
                    "commit message lacks a Change-Id; children cannot depend on this change"
                ),
            }
            return Ok(());
        }

        if self.query.change_id.is_some() {
            return Ok(());
        }

        match parsed {
            Ok(change_id) => self.query.change_id = Some(change_id),
            Err(e) => {
                let sha1 = self.query.sha1.as_deref().unwrap_or_default();
                warn!(
                    patch = %self.patch_link(),
                    sha1,
                    error = %e,
                    "no usable Change-Id in commit message; synthesizing one from the sha1. \
                     CQ-DEPEND against this revision will not work"
                );
                self.query.change_id = Some(synthesize_change_id(sha1));
            }
        }
        Ok(())
    }

    /// Parse the Change-Id out of the last paragraph of a commit message.
    fn parse_change_id_from_message(&self, message: &str) -> Result<String> {
        let paragraph_re = Regex::new(r"\n{2,}").expect("static pattern");
        let id_re = Regex::new(r"(?im)^Change-Id:[\t ]*(\w+)\s*$").expect("static pattern");

        let trailer = paragraph_re
            .split(message.trim_end())
            .last()
            .unwrap_or_default();
        let candidate = id_re
            .captures_iter(trailer)
            .last()
            .map(|c| c[1].to_string())
            .ok_or_else(|| PatchError::BrokenChangeId {
                patch: self.patch_link(),
                message: "missing Change-Id in commit message".to_string(),
                missing: true,
            })?;

        // Commit messages must carry the strict Gerrit form, no internal
        // markers.
        parse_change_id(&candidate)
            .map(|s| s.to_string())
            .ok_or_else(|| PatchError::BrokenChangeId {
                patch: self.patch_link(),
                message: format!("invalid Change-Id {candidate:?}"),
                missing: false,
            })
    }

    /// Paths this patch touches, mapped to their modification kind
    /// (`git log --diff-filter` letters). Rename detection is off so the
    /// result does not depend on user git configuration.
    pub fn get_diff_status(&mut self, git_repo: &Path) -> Result<HashMap<String, String>> {
        let sha1 = self.fetch(git_repo)?;
        let range = format!("{sha1}^..{sha1}");
        let out = git::run_git_unchecked(
            git_repo,
            &["diff", "--no-renames", "--name-status", &range],
        )?;
        if out.code == 128 {
            // No parent: this is the first commit in the repository.
            return Ok(HashMap::new());
        }
        if !out.success() {
            return Err(git::GitError::Command {
                args: vec!["diff".to_string(), range],
                code: out.code,
                stdout: out.stdout,
                stderr: out.stderr,
            }
            .into());
        }
        Ok(out
            .stdout
            .lines()
            .filter_map(|line| {
                line.split_once('\t')
                    .map(|(kind, path)| (path.to_string(), kind.to_string()))
            })
            .collect())
    }

    /// Dependencies implied by the commit graph: every commit between the
    /// upstream and this patch's parent.
    ///
    /// Gerrit patches answer from their query metadata instead. A commit
    /// with no parent has no dependencies; a merge commit inside the range
    /// is rejected rather than flattened into a fake linear chain.
    pub fn gerrit_dependencies(
        &mut self,
        git_repo: &Path,
        upstream: &str,
    ) -> Result<Vec<PatchQuery>> {
        if let PatchSource::Gerrit(meta) = &self.source {
            return meta.dependency_queries(&self.query, &self.patch_link());
        }

        let sha1 = self.fetch(git_repo)?;
        let range = format!("{upstream}..{sha1}^");
        let out = git::run_git_unchecked(git_repo, &["rev-list", "--parents", &range])?;
        if out.code == 128 {
            // sha1^ does not resolve: root commit, nothing below it.
            return Ok(Vec::new());
        }
        if !out.success() {
            return Err(git::GitError::Command {
                args: vec!["rev-list".to_string(), range],
                code: out.code,
                stdout: out.stdout,
                stderr: out.stderr,
            }
            .into());
        }

        let mut deps = Vec::new();
        for line in out.stdout.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() > 2 {
                return Err(PatchError::MergeInRange {
                    patch: self.patch_link(),
                    range,
                    sha1: fields[0].to_string(),
                });
            }
            deps.push(PatchQuery::new(
                self.query.remote,
                self.query.project.clone(),
                self.query.tracking_branch.clone(),
                None,
                Some(fields[0].to_string()),
                None,
            ));
        }
        debug!(patch = %self.patch_link(), count = deps.len(), "resolved commit-graph dependencies");
        Ok(deps)
    }

    /// Dependencies declared with CQ-DEPEND lines in the commit message.
    pub fn paladin_dependencies(&mut self, git_repo: &Path) -> Result<Vec<PatchQuery>> {
        if self.commit_message.is_none() {
            self.fetch(git_repo)?;
        }
        let message = self.commit_message.as_deref().unwrap_or_default();
        crate::format::get_paladin_deps(message).map_err(|e| match e {
            PatchError::MalformedDep { text, .. } => PatchError::BrokenCqDepends {
                patch: self.patch_link(),
                text,
            },
            other => other,
        })
    }

    /// Cherry-pick this patch onto the current branch of `git_repo`.
    ///
    /// Exit-code protocol: 0 applied; 1 is a content conflict unless the
    /// tree came out pristine, which means the change is already committed;
    /// 2 means the trivial strategy rejected the pick, so one non-trivial
    /// retry distinguishes "only trivial was the problem" from a real
    /// conflict. Whatever happens, nothing dirty is left behind.
    pub fn cherry_pick(
        &self,
        git_repo: &Path,
        trivial: bool,
        inflight: bool,
    ) -> std::result::Result<(), PatchApplyError> {
        let sha1 = self
            .query
            .sha1
            .as_deref()
            .expect("cherry_pick runs after fetch");

        // --ff so the sha1 only changes when it has to.
        let mut cmd = vec!["cherry-pick", "--strategy", "resolve", "--ff"];
        if trivial {
            cmd.extend(["-X", "trivial"]);
        }
        cmd.push(sha1);

        let out = git::run_git_unchecked(git_repo, &cmd)?;
        match out.code {
            0 => Ok(()),
            1 => {
                let diff =
                    git::run_git(git_repo, &["diff", "--name-only", "--diff-filter=U"])?;
                let conflicts: Vec<String> =
                    diff.stdout.lines().map(|l| l.to_string()).collect();
                if conflicts.is_empty() {
                    // Merge resolution was fine and nothing conflicted: the
                    // change is already in. Tree is pristine, no reset.
                    return Err(PatchApplyError::AlreadyApplied {
                        patch: self.patch_link(),
                        inflight,
                    });
                }
                git::run_git_unchecked(git_repo, &["reset", "--hard", "HEAD"])?;
                debug_assert!(!trivial, "trivial mode reports conflicts as exit code 2");
                Err(PatchApplyError::Conflict {
                    patch: self.patch_link(),
                    inflight,
                    trivial: false,
                    files: conflicts,
                })
            }
            2 => {
                // Trivial conflicts can mask content conflicts, and the
                // content conflict is the one worth reporting: solving it
                // solves the trivial one too. The tree is unmodified after a
                // trivial rejection, so retry in place.
                self.cherry_pick(git_repo, false, inflight)?;
                // The non-trivial retry succeeded; rewind it and report the
                // trivial rejection.
                git::run_git_unchecked(git_repo, &["reset", "--hard", "HEAD^"])?;
                Err(PatchApplyError::Conflict {
                    patch: self.patch_link(),
                    inflight,
                    trivial: true,
                    files: Vec::new(),
                })
            }
            code => {
                git::run_git_unchecked(git_repo, &["reset", "--hard", "HEAD"])?;
                Err(PatchApplyError::Fatal {
                    patch: self.patch_link(),
                    code,
                    stderr: out.stderr,
                })
            }
        }
    }

    /// Apply this patch onto a standalone git repo, stacking onto the
    /// dedicated patch branch based on `upstream`.
    pub fn apply(&mut self, git_repo: &Path, upstream: &str, trivial: bool) -> Result<()> {
        self.fetch(git_repo)?;
        info!(patch = %self.patch_link(), "attempting to cherry-pick change");

        if git::local_branch_exists(git_repo, PATCH_BRANCH)? {
            git::run_git(git_repo, &["checkout", "-f", PATCH_BRANCH])?;
        } else {
            git::run_git(git_repo, &["checkout", "-b", PATCH_BRANCH, "-t", upstream])?;
        }

        // If HEAD differs from upstream, other patches are already stacked
        // on the branch.
        let upstream_sha = git::rev_list_one(git_repo, upstream)?;
        let head = git::rev_list_one(git_repo, "HEAD")?;
        let inflight = head != upstream_sha;

        self.find_delete_conflicts(git_repo, upstream, inflight)?;

        match self.cherry_pick(git_repo, trivial, inflight) {
            Ok(()) => Ok(()),
            Err(original) if inflight => {
                // Retry against the bare upstream purely to sharpen the
                // diagnostic; the inflight failure is still the answer.
                git::run_git(git_repo, &["checkout", "-f", "--detach", &upstream_sha])?;
                match self.cherry_pick(git_repo, trivial, false) {
                    Ok(()) => debug!(
                        patch = %self.patch_link(),
                        "applies cleanly against upstream; conflict is with the current series"
                    ),
                    Err(e) => debug!(
                        patch = %self.patch_link(),
                        error = %e,
                        "also fails against bare upstream"
                    ),
                }
                git::run_git_unchecked(git_repo, &["checkout", "-f", PATCH_BRANCH])?;
                Err(original.into())
            }
            Err(original) => {
                git::run_git_unchecked(git_repo, &["checkout", "-f", PATCH_BRANCH])?;
                Err(original.into())
            }
        }
    }

    /// Pre-check for the double-delete class git will not flag: files this
    /// patch deletes that are already gone from the tree.
    fn find_delete_conflicts(
        &mut self,
        git_repo: &Path,
        upstream: &str,
        inflight: bool,
    ) -> Result<()> {
        let deleted: Vec<String> = self
            .get_diff_status(git_repo)?
            .into_iter()
            .filter(|(_, kind)| kind == "D")
            .map(|(path, _)| path)
            .collect();

        let mut conflicts = missing_files(git_repo, "HEAD", &deleted)?;
        if conflicts.is_empty() {
            return Ok(());
        }

        let mut inflight = inflight;
        if inflight {
            // Re-check against the upstream tip so the diagnostic blames the
            // right thing.
            let tot_conflicts = missing_files(git_repo, upstream, &deleted)?;
            if !tot_conflicts.is_empty() {
                inflight = false;
                conflicts = tot_conflicts;
            }
        }

        Err(PatchApplyError::DeletedFileConflict {
            patch: self.patch_link(),
            inflight,
            files: conflicts,
        }
        .into())
    }
}

impl fmt::Display for GitRepoPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            PatchSource::UploadedLocal {
                original_branch,
                original_sha1,
            } => {
                write!(f, "{}:{}", self.query.project.as_deref().unwrap_or("?"), original_branch)?;
                if let Some(sha1) = original_sha1 {
                    write!(f, ":{}", &sha1[..8.min(sha1.len())])?;
                }
            }
            _ => {
                write!(
                    f,
                    "{}:{}",
                    self.query.project.as_deref().unwrap_or("?"),
                    self.ref_name
                )?;
                if let Some(sha1) = &self.query.sha1 {
                    write!(
                        f,
                        ":{}{}",
                        self.query.remote.change_prefix(),
                        &sha1[..8.min(sha1.len())]
                    )?;
                }
            }
        }
        if let Some(subject) = &self.subject {
            write!(f, " \"{subject}\"")?;
        }
        Ok(())
    }
}

/// Deterministic, deliberately unusable Change-Id for commits lacking one.
pub(crate) fn synthesize_change_id(sha1: &str) -> String {
    let digest = Sha256::digest(sha1.as_bytes());
    format!("I{}", &hex::encode(digest)[..GERRIT_CHANGE_ID_LENGTH])
}

/// `(sha1, subject, body)` of a revision, `None` when it is unknown to the
/// repo.
fn pull_data(git_repo: &Path, rev: &str) -> Result<Option<(String, String, String)>> {
    let out = git::run_git_unchecked(
        git_repo,
        &["log", "--pretty=format:%H%x00%s%x00%B", "-n1", rev],
    )?;
    if !out.success() {
        return Ok(None);
    }
    let fields: Vec<&str> = out.stdout.splitn(3, '\0').collect();
    if fields.len() != 3 {
        return Ok(None);
    }
    Ok(Some((
        fields[0].trim().to_string(),
        fields[1].trim().to_string(),
        fields[2].trim().to_string(),
    )))
}

/// Subset of `files` absent from `tree_revision`.
fn missing_files(git_repo: &Path, tree_revision: &str, files: &[String]) -> Result<Vec<String>> {
    if files.is_empty() {
        return Ok(Vec::new());
    }
    let mut args = vec![
        "ls-tree".to_string(),
        "--full-name".to_string(),
        "--name-only".to_string(),
        "-z".to_string(),
        tree_revision.to_string(),
        "--".to_string(),
    ];
    args.extend(files.iter().cloned());
    let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
    let out = git::run_git_unchecked(git_repo, &arg_refs)?;
    let existing: HashSet<&str> = out.stdout.split('\0').filter(|s| !s.is_empty()).collect();
    Ok(files
        .iter()
        .filter(|f| !existing.contains(f.as_str()))
        .cloned()
        .collect())
}

fn normalize_repo(git_repo: &Path) -> PathBuf {
    git_repo
        .canonicalize()
        .unwrap_or_else(|_| git_repo.to_path_buf())
}
