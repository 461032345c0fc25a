//! Synchronous git subprocess wrapper.
//!
//! All durable coordination state lives in git repositories, so every layer
//! above funnels through this module. Commands run synchronously via
//! `std::process::Command`; transient network/server failures are retried a
//! bounded number of times, while merge conflicts and malformed input never
//! retry.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

/// Errors from running git commands.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("failed to run git {args:?}: {source}")]
    Spawn {
        args: Vec<String>,
        source: std::io::Error,
    },

    #[error("git {args:?} exited with code {code}: {stderr}")]
    Command {
        args: Vec<String>,
        code: i32,
        stdout: String,
        stderr: String,
    },
}

impl GitError {
    /// Exit code of a failed command, if it ran at all.
    pub fn code(&self) -> Option<i32> {
        match self {
            GitError::Spawn { .. } => None,
            GitError::Command { code, .. } => Some(*code),
        }
    }

    /// Stderr of a failed command, if it ran at all.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            GitError::Spawn { .. } => None,
            GitError::Command { stderr, .. } => Some(stderr),
        }
    }
}

pub type Result<T> = std::result::Result<T, GitError>;

/// Captured output of a completed git command.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: i32,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Stderr signatures that identify a transient network/server failure.
///
/// Only these retry; a conflict or malformed ref always surfaces on the
/// first attempt.
const TRANSIENT_SIGNATURES: &[&str] = &[
    "Connection timed out",
    "Connection refused",
    "Connection reset",
    "The remote end hung up unexpectedly",
    "500 Internal Server Error",
    "502 Bad Gateway",
    "503 Service Unavailable",
];

const TRANSIENT_RETRIES: u32 = 3;
const TRANSIENT_BACKOFF: Duration = Duration::from_secs(2);

fn is_transient(stderr: &str) -> bool {
    TRANSIENT_SIGNATURES.iter().any(|sig| stderr.contains(sig))
}

fn run_once(
    repo_dir: &Path,
    args: &[&str],
    env: &HashMap<String, String>,
    input: Option<&str>,
) -> Result<GitOutput> {
    let owned_args: Vec<String> = args.iter().map(|s| s.to_string()).collect();

    let mut cmd = Command::new("git");
    cmd.args(args).current_dir(repo_dir).envs(env);
    if input.is_some() {
        cmd.stdin(Stdio::piped());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| GitError::Spawn {
        args: owned_args.clone(),
        source: e,
    })?;

    if let Some(data) = input {
        // Dropping stdin closes the pipe so git sees EOF.
        let mut stdin = child.stdin.take().expect("stdin was piped");
        stdin
            .write_all(data.as_bytes())
            .map_err(|e| GitError::Spawn {
                args: owned_args.clone(),
                source: e,
            })?;
    }

    let output = child.wait_with_output().map_err(|e| GitError::Spawn {
        args: owned_args,
        source: e,
    })?;

    Ok(GitOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        code: output.status.code().unwrap_or(-1),
    })
}

fn run_with_retry(
    repo_dir: &Path,
    args: &[&str],
    env: &HashMap<String, String>,
    input: Option<&str>,
) -> Result<GitOutput> {
    let mut attempt = 0;
    loop {
        let out = run_once(repo_dir, args, env, input)?;
        if out.success() || !is_transient(&out.stderr) || attempt + 1 >= TRANSIENT_RETRIES {
            return Ok(out);
        }
        attempt += 1;
        warn!(
            args = ?args,
            attempt,
            stderr = %out.stderr.trim(),
            "transient git failure, retrying"
        );
        std::thread::sleep(TRANSIENT_BACKOFF);
    }
}

/// Run a git command in `repo_dir`, failing on non-zero exit.
pub fn run_git(repo_dir: &Path, args: &[&str]) -> Result<GitOutput> {
    let out = run_with_retry(repo_dir, args, &HashMap::new(), None)?;
    if !out.success() {
        return Err(GitError::Command {
            args: args.iter().map(|s| s.to_string()).collect(),
            code: out.code,
            stdout: out.stdout,
            stderr: out.stderr,
        });
    }
    Ok(out)
}

/// Run a git command, returning the output whatever the exit code.
///
/// Used by callers that classify exit codes themselves (cherry-pick, probe
/// lookups). Only a spawn failure is an error.
pub fn run_git_unchecked(repo_dir: &Path, args: &[&str]) -> Result<GitOutput> {
    run_with_retry(repo_dir, args, &HashMap::new(), None)
}

/// Run a git command with extra environment variables and optional stdin.
///
/// Needed by commit-object surgery (`commit-tree` reads the message from
/// stdin and author/committer identity from the environment).
pub fn run_git_with_env(
    repo_dir: &Path,
    args: &[&str],
    env: &HashMap<String, String>,
    input: Option<&str>,
) -> Result<GitOutput> {
    let out = run_with_retry(repo_dir, args, env, input)?;
    if !out.success() {
        return Err(GitError::Command {
            args: args.iter().map(|s| s.to_string()).collect(),
            code: out.code,
            stdout: out.stdout,
            stderr: out.stderr,
        });
    }
    Ok(out)
}

/// Clone `url` into `dest`.
pub fn clone(parent_dir: &Path, url: &str, dest: &Path) -> Result<()> {
    let dest_str = dest.to_string_lossy();
    run_git(parent_dir, &["clone", url, &dest_str])?;
    Ok(())
}

/// Resolve a single revision expression to a sha1.
pub fn rev_list_one(repo_dir: &Path, rev: &str) -> Result<String> {
    let out = run_git(repo_dir, &["rev-list", "-n1", rev])?;
    Ok(out.stdout.trim().to_string())
}

/// Whether the work tree has no uncommitted changes.
pub fn work_tree_clean(repo_dir: &Path) -> Result<bool> {
    let out = run_git(repo_dir, &["status", "--porcelain"])?;
    Ok(out.stdout.trim().is_empty())
}

/// Whether a local branch with the given name exists.
pub fn local_branch_exists(repo_dir: &Path, branch: &str) -> Result<bool> {
    let refname = format!("refs/heads/{branch}");
    let out = run_git_unchecked(repo_dir, &["show-ref", "--verify", "--quiet", &refname])?;
    Ok(out.success())
}

/// Read a single config value, `None` if unset.
pub fn config_get(repo_dir: &Path, key: &str) -> Result<Option<String>> {
    let out = run_git_unchecked(repo_dir, &["config", "--get", key])?;
    if out.success() {
        Ok(Some(out.stdout.trim().to_string()))
    } else {
        Ok(None)
    }
}

/// Whether `text` is a valid 40-character hex sha1.
pub fn is_sha1(text: &str) -> bool {
    text.len() == 40 && text.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
pub mod testutil {
    //! Git fixture helpers shared by tests across the workspace.

    use std::path::Path;
    use std::process::Command;

    pub fn run(repo_dir: &Path, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(repo_dir)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    pub fn make_git_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        run(dir.path(), &["init", "-b", "master"]);
        run(dir.path(), &["config", "user.name", "test-user"]);
        run(dir.path(), &["config", "user.email", "test@example.com"]);
        run(dir.path(), &["commit", "--allow-empty", "-m", "initial"]);
        dir
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::{make_git_repo, run};
    use super::*;

    #[test]
    fn run_git_captures_stdout() {
        let repo = make_git_repo();
        let out = run_git(repo.path(), &["rev-parse", "HEAD"]).unwrap();
        assert!(is_sha1(out.stdout.trim()));
    }

    #[test]
    fn run_git_fails_with_stderr() {
        let repo = make_git_repo();
        let err = run_git(repo.path(), &["rev-parse", "no-such-rev"]).unwrap_err();
        assert!(err.code().is_some());
        assert!(err.stderr().is_some());
    }

    #[test]
    fn run_git_unchecked_reports_exit_code() {
        let repo = make_git_repo();
        let out = run_git_unchecked(repo.path(), &["rev-parse", "no-such-rev"]).unwrap();
        assert_ne!(out.code, 0);
    }

    #[test]
    fn work_tree_clean_detects_dirt() {
        let repo = make_git_repo();
        assert!(work_tree_clean(repo.path()).unwrap());
        std::fs::write(repo.path().join("junk.txt"), "dirt").unwrap();
        run(repo.path(), &["add", "junk.txt"]);
        assert!(!work_tree_clean(repo.path()).unwrap());
    }

    #[test]
    fn local_branch_exists_checks_refs() {
        let repo = make_git_repo();
        assert!(local_branch_exists(repo.path(), "master").unwrap());
        assert!(!local_branch_exists(repo.path(), "no-such-branch").unwrap());
    }

    #[test]
    fn config_get_missing_key_is_none() {
        let repo = make_git_repo();
        assert_eq!(config_get(repo.path(), "conveyor.nothing").unwrap(), None);
        assert_eq!(
            config_get(repo.path(), "user.name").unwrap().as_deref(),
            Some("test-user")
        );
    }

    #[test]
    fn transient_signature_detection() {
        assert!(is_transient("fatal: The remote end hung up unexpectedly"));
        assert!(is_transient("error: 503 Service Unavailable"));
        assert!(!is_transient("CONFLICT (content): merge conflict in a.txt"));
    }
}
