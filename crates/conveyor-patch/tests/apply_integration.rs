//! End-to-end patch application against real git repositories.

use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

use conveyor_patch::{
    GitRepoPatch, PatchApplyError, PatchError, PatchQuery, PatchSource, Remote, PATCH_BRANCH,
};

fn run(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_AUTHOR_NAME", "Test Author")
        .env("GIT_AUTHOR_EMAIL", "author@example.com")
        .env("GIT_COMMITTER_NAME", "Test Committer")
        .env("GIT_COMMITTER_EMAIL", "committer@example.com")
        .output()
        .expect("git spawns");
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

fn commit_file(repo: &Path, name: &str, contents: &str, message: &str) -> String {
    std::fs::write(repo.join(name), contents).unwrap();
    run(repo, &["add", name]);
    run(repo, &["commit", "-m", message]);
    run(repo, &["rev-parse", "HEAD"])
}

/// An origin repo with one base commit, plus two clones: one to author
/// patches in and one to apply them to.
struct Fixture {
    _root: TempDir,
    origin: PathBuf,
    source: PathBuf,
    target: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let root = TempDir::new().unwrap();
        let origin = root.path().join("origin");
        std::fs::create_dir(&origin).unwrap();
        run(&origin, &["init", "-b", "master"]);
        commit_file(&origin, "base.txt", "base\n", "initial commit");

        let source = root.path().join("source");
        let target = root.path().join("target");
        run(root.path(), &["clone", origin.to_str().unwrap(), "source"]);
        run(root.path(), &["clone", origin.to_str().unwrap(), "target"]);

        Fixture {
            _root: root,
            origin,
            source,
            target,
        }
    }

    /// Author a commit on a feature branch in the source clone and wrap it
    /// as a patch.
    fn feature_patch(&self, name: &str, contents: &str, message: &str) -> GitRepoPatch {
        run(&self.source, &["checkout", "-B", "feature", "origin/master"]);
        let sha1 = commit_file(&self.source, name, contents, message);
        self.patch_for(&sha1)
    }

    fn patch_for(&self, sha1: &str) -> GitRepoPatch {
        GitRepoPatch::new(
            self.source.to_string_lossy().into_owned(),
            "refs/heads/feature".to_string(),
            PatchQuery::new(
                Remote::External,
                Some("test/project".to_string()),
                Some("master".to_string()),
                None,
                Some(sha1.to_string()),
                None,
            ),
            PatchSource::Local,
        )
    }

    /// Advance origin's master and sync the target clone to it.
    fn advance_target(&self, name: &str, contents: &str, message: &str) {
        commit_file(&self.origin, name, contents, message);
        run(&self.target, &["fetch", "origin"]);
        run(&self.target, &["checkout", "master"]);
        run(&self.target, &["reset", "--hard", "origin/master"]);
    }
}

#[test]
fn fetch_completes_identity_and_memoizes() {
    let fx = Fixture::new();
    let mut patch = fx.feature_patch(
        "widget.txt",
        "widget\n",
        "Add a widget\n\nChange-Id: I47ea30385af60ae4cc2acc5d1a283a46423bc6e1\n",
    );

    let sha1 = patch.fetch(&fx.target).unwrap();
    assert_eq!(Some(sha1.clone()), patch.query.sha1);
    assert_eq!(patch.subject.as_deref(), Some("Add a widget"));
    assert_eq!(
        patch.query.change_id.as_deref(),
        Some("I47ea30385af60ae4cc2acc5d1a283a46423bc6e1")
    );
    // Second fetch answers from the memo even if the source disappears.
    assert_eq!(patch.fetch(&fx.target).unwrap(), sha1);
}

#[test]
fn fetch_synthesizes_change_id_when_absent() {
    let fx = Fixture::new();
    let mut patch = fx.feature_patch("widget.txt", "widget\n", "Add a widget");
    patch.fetch(&fx.target).unwrap();
    let id = patch.query.change_id.clone().unwrap();
    assert!(id.starts_with('I'));
    assert_eq!(id.len(), 41);
}

#[test]
fn apply_clean_patch_lands_on_patch_branch() {
    let fx = Fixture::new();
    let mut patch = fx.feature_patch("widget.txt", "widget\n", "Add a widget");

    patch.apply(&fx.target, "origin/master", false).unwrap();

    let branch = run(&fx.target, &["rev-parse", "--abbrev-ref", "HEAD"]);
    assert_eq!(branch, PATCH_BRANCH);
    assert_eq!(
        std::fs::read_to_string(fx.target.join("widget.txt")).unwrap(),
        "widget\n"
    );
}

#[test]
fn stacked_patches_share_the_branch() {
    let fx = Fixture::new();
    let mut first = fx.feature_patch("one.txt", "one\n", "Add one");
    first.apply(&fx.target, "origin/master", false).unwrap();

    run(&fx.source, &["checkout", "-B", "feature", "origin/master"]);
    let sha1 = commit_file(&fx.source, "two.txt", "two\n", "Add two");
    let mut second = fx.patch_for(&sha1);
    second.apply(&fx.target, "origin/master", false).unwrap();

    assert!(fx.target.join("one.txt").exists());
    assert!(fx.target.join("two.txt").exists());
}

#[test]
fn already_committed_patch_is_reported_as_such() {
    let fx = Fixture::new();
    let mut patch = fx.feature_patch("base.txt", "changed\n", "Change base");

    // The same change lands upstream before we apply.
    fx.advance_target("base.txt", "changed\n", "Change base upstream");

    let err = patch.apply(&fx.target, "origin/master", false).unwrap_err();
    assert!(matches!(
        err,
        PatchError::Apply(PatchApplyError::AlreadyApplied { inflight: false, .. })
    ));
}

#[test]
fn conflicting_patch_names_files_and_leaves_tree_clean() {
    let fx = Fixture::new();
    let mut patch = fx.feature_patch("base.txt", "feature version\n", "Change base");

    fx.advance_target("base.txt", "upstream version\n", "Diverge base");

    let err = patch.apply(&fx.target, "origin/master", false).unwrap_err();
    match err {
        PatchError::Apply(PatchApplyError::Conflict {
            files,
            trivial: false,
            inflight: false,
            ..
        }) => assert_eq!(files, vec!["base.txt".to_string()]),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(run(&fx.target, &["status", "--porcelain"]), "");
}

#[test]
fn content_merge_rejection_is_a_trivial_conflict() {
    let fx = Fixture::new();
    // Both sides touch base.txt in non-overlapping hunks: an ordinary merge
    // would take the patch, but trivial mode refuses content-level merging.
    let mut patch = fx.feature_patch("base.txt", "base\nfeature line\n", "Append feature line");
    fx.advance_target("base.txt", "upstream line\nbase\n", "Prepend upstream line");

    let err = patch.apply(&fx.target, "origin/master", true).unwrap_err();
    assert!(matches!(
        err,
        PatchError::Apply(PatchApplyError::Conflict {
            trivial: true,
            inflight: false,
            ..
        })
    ));
    // The second, full-merge pass is rewound, leaving the branch at the
    // upstream tip with a clean tree.
    assert_eq!(run(&fx.target, &["status", "--porcelain"]), "");
    assert_eq!(
        run(&fx.target, &["rev-parse", "HEAD"]),
        run(&fx.target, &["rev-parse", "origin/master"])
    );
}

#[test]
fn deleting_an_already_deleted_file_is_a_conflict() {
    let fx = Fixture::new();
    // Seed an extra file everyone starts from.
    commit_file(&fx.origin, "extra.txt", "extra\n", "Add extra");
    run(&fx.source, &["fetch", "origin"]);
    run(&fx.target, &["fetch", "origin"]);
    run(&fx.target, &["reset", "--hard", "origin/master"]);

    run(&fx.source, &["checkout", "-B", "feature", "origin/master"]);
    run(&fx.source, &["rm", "extra.txt"]);
    run(&fx.source, &["commit", "-m", "Remove extra"]);
    let sha1 = run(&fx.source, &["rev-parse", "HEAD"]);
    let mut patch = fx.patch_for(&sha1);

    // Upstream deletes it first.
    run(&fx.origin, &["rm", "extra.txt"]);
    run(&fx.origin, &["commit", "-m", "Remove extra upstream"]);
    run(&fx.target, &["fetch", "origin"]);
    run(&fx.target, &["reset", "--hard", "origin/master"]);

    let err = patch.apply(&fx.target, "origin/master", false).unwrap_err();
    match err {
        PatchError::Apply(PatchApplyError::DeletedFileConflict { files, .. }) => {
            assert_eq!(files, vec!["extra.txt".to_string()])
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn diff_status_maps_paths_to_kinds() {
    let fx = Fixture::new();
    run(&fx.source, &["checkout", "-B", "feature", "origin/master"]);
    std::fs::write(fx.source.join("base.txt"), "modified\n").unwrap();
    std::fs::write(fx.source.join("new.txt"), "new\n").unwrap();
    run(&fx.source, &["add", "base.txt", "new.txt"]);
    run(&fx.source, &["commit", "-m", "Touch two files"]);
    let sha1 = run(&fx.source, &["rev-parse", "HEAD"]);

    let mut patch = fx.patch_for(&sha1);
    let status = patch.get_diff_status(&fx.target).unwrap();
    assert_eq!(status.get("base.txt").map(String::as_str), Some("M"));
    assert_eq!(status.get("new.txt").map(String::as_str), Some("A"));
}

#[test]
fn commit_graph_dependencies_are_the_commits_below() {
    let fx = Fixture::new();
    run(&fx.source, &["checkout", "-B", "feature", "origin/master"]);
    let dep1 = commit_file(&fx.source, "one.txt", "one\n", "Add one");
    let dep2 = commit_file(&fx.source, "two.txt", "two\n", "Add two");
    let top = commit_file(&fx.source, "three.txt", "three\n", "Add three");

    let mut patch = fx.patch_for(&top);
    let deps = patch
        .gerrit_dependencies(&fx.target, "origin/master")
        .unwrap();
    let sha1s: Vec<&str> = deps.iter().filter_map(|d| d.sha1.as_deref()).collect();
    // rev-list order: newest first.
    assert_eq!(sha1s, vec![dep2.as_str(), dep1.as_str()]);
}

#[test]
fn first_commit_has_no_dependencies() {
    let fx = Fixture::new();
    let root = run(&fx.source, &["rev-list", "--max-parents=0", "HEAD"]);
    let mut patch = fx.patch_for(&root);
    patch.ref_name = "refs/heads/master".to_string();
    let deps = patch
        .gerrit_dependencies(&fx.target, "origin/master")
        .unwrap();
    assert!(deps.is_empty());
}

#[test]
fn carbon_copy_preserves_tree_and_author() {
    let fx = Fixture::new();
    run(&fx.source, &["checkout", "-B", "feature", "origin/master"]);
    let sha1 = commit_file(&fx.source, "widget.txt", "widget\n", "Add a widget");

    let mut patch = GitRepoPatch::new(
        fx.source.to_string_lossy().into_owned(),
        "refs/heads/feature".to_string(),
        PatchQuery::new(Remote::External, Some("test/project".to_string()),
            Some("master".to_string()), None, Some(sha1.clone()), None),
        PatchSource::Local,
    );
    let copy = patch.carbon_copy().unwrap();
    assert_ne!(copy, sha1);

    let tree = |rev: &str| run(&fx.source, &["rev-parse", &format!("{rev}^{{tree}}")]);
    assert_eq!(tree(&copy), tree(&sha1));
    let author = |rev: &str| run(&fx.source, &["log", "--format=%an <%ae> %ad", "-n1", rev]);
    assert_eq!(author(&copy), author(&sha1));
}
