//! Local-commit operations: carbon copies and uploads for review.

use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

use conveyor_core::git;

use crate::error::{PatchError, Result};
use crate::format::add_prefix;
use crate::patch::{GitRepoPatch, PatchSource};

/// Knobs for `GitRepoPatch::upload`.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Push a carbon copy instead of the original sha1.
    pub carbon_copy: bool,
    pub dry_run: bool,
    pub reviewers: Vec<String>,
    pub cc: Vec<String>,
}

impl Default for UploadOptions {
    fn default() -> Self {
        UploadOptions {
            carbon_copy: true,
            dry_run: false,
            reviewers: Vec::new(),
            cc: Vec::new(),
        }
    }
}

const HASH_FIELD_COUNT: usize = 2;
const TRANSFER_FIELDS: [&str; 5] = [
    "GIT_AUTHOR_NAME",
    "GIT_AUTHOR_EMAIL",
    "GIT_AUTHOR_DATE",
    "GIT_COMMITTER_NAME",
    "GIT_COMMITTER_EMAIL",
];

impl GitRepoPatch {
    fn require_local(&self, op: &'static str) -> Result<&Path> {
        match self.source {
            PatchSource::Local => Ok(Path::new(&self.project_url)),
            _ => Err(PatchError::UnsupportedVariant { op }),
        }
    }

    /// Rebuild this commit as a new object with the same tree and author
    /// but a different sha1.
    ///
    /// Review servers refuse to create a change for a commit object that an
    /// existing ref already points at; pushing a copy sidesteps that. The
    /// committer date is backdated one second, otherwise rapid
    /// commit-upload cycles can land in the same second and reproduce the
    /// original sha1 exactly.
    pub fn carbon_copy(&mut self) -> Result<String> {
        let repo = self.require_local("carbon_copy")?.to_path_buf();
        let sha1 = self.fetch(&repo)?;

        // Tree and parent hashes, then the author/committer identity fields
        // in TRANSFER_FIELDS order, then the raw body.
        let out = git::run_git(
            &repo,
            &[
                "log",
                "--format=%T%n%P%n%an%n%ae%n%ad%n%cn%n%ce%n%ct%n%B",
                "-n1",
                &sha1,
            ],
        )?;
        let lines: Vec<&str> = out.stdout.lines().collect();
        let header_len = HASH_FIELD_COUNT + TRANSFER_FIELDS.len() + 1;
        if lines.len() < header_len {
            return Err(PatchError::Internal {
                patch: self.patch_link(),
                message: format!("malformed log output for {sha1}"),
            });
        }
        let tree_hash = lines[0].trim();
        let parent_hash = lines[1].trim();
        if parent_hash.split_whitespace().count() != 1 {
            return Err(PatchError::Internal {
                patch: self.patch_link(),
                message: format!("{sha1} is a merge commit; refusing to copy it"),
            });
        }

        let mut env: HashMap<String, String> = TRANSFER_FIELDS
            .iter()
            .zip(&lines[HASH_FIELD_COUNT..])
            .map(|(name, value)| (name.to_string(), value.trim().to_string()))
            .collect();
        let committer_ts: i64 = lines[header_len - 1]
            .trim()
            .parse()
            .map_err(|_| PatchError::Internal {
                patch: self.patch_link(),
                message: format!("unparseable committer timestamp for {sha1}"),
            })?;
        env.insert(
            "GIT_COMMITTER_DATE".to_string(),
            (committer_ts - 1).to_string(),
        );

        let body = lines[header_len..].join("\n");
        let out = git::run_git_with_env(
            &repo,
            &["commit-tree", tree_hash, "-p", parent_hash],
            &env,
            Some(&body),
        )?;
        let new_sha1 = out.stdout.trim().to_string();
        if new_sha1 == sha1 {
            return Err(PatchError::Internal {
                patch: self.patch_link(),
                message: format!("carbon copy of {sha1} produced the same object"),
            });
        }
        debug!(patch = %self.patch_link(), %new_sha1, "created carbon copy");
        Ok(new_sha1)
    }

    /// Push this commit (or its carbon copy) to `remote_ref` on `push_url`.
    ///
    /// Returns the change URLs the server announced under `New Changes:` in
    /// the push output.
    pub fn upload(
        &mut self,
        push_url: &str,
        remote_ref: &str,
        options: &UploadOptions,
    ) -> Result<Vec<String>> {
        self.require_local("upload")?;
        let ref_to_upload = if options.carbon_copy {
            self.carbon_copy()?
        } else {
            let repo = Path::new(&self.project_url).to_path_buf();
            self.fetch(&repo)?
        };
        let repo = Path::new(&self.project_url);

        let mut cmd: Vec<String> = vec!["push".to_string()];
        if !options.reviewers.is_empty() || !options.cc.is_empty() {
            let people = options
                .reviewers
                .iter()
                .map(|r| format!("--reviewer={r}"))
                .chain(options.cc.iter().map(|c| format!("--cc={c}")))
                .collect::<Vec<_>>()
                .join(" ");
            cmd.push(format!("--receive-pack=git receive-pack {people}"));
        }
        cmd.push(push_url.to_string());
        cmd.push(format!("{ref_to_upload}:{remote_ref}"));
        if options.dry_run {
            cmd.push("--dry-run".to_string());
        }

        let args: Vec<&str> = cmd.iter().map(|s| s.as_str()).collect();
        let out = git::run_git(repo, &args)?;
        Ok(scrape_change_urls(&out.stderr))
    }

    /// Wrap a local commit that was re-pushed to a temporary remote ref.
    pub fn new_uploaded_local(
        project_url: String,
        ref_name: String,
        query: crate::query::PatchQuery,
        original_branch: String,
        original_sha1: Option<String>,
    ) -> Self {
        GitRepoPatch::new(
            project_url,
            ref_name,
            query,
            PatchSource::UploadedLocal {
                original_branch,
                original_sha1,
            },
        )
    }

    /// Lookup keys this change answers to; uploaded local patches also
    /// answer to their pre-upload sha1.
    pub fn lookup_aliases(&self) -> Vec<String> {
        let mut aliases = self.query.lookup_aliases();
        if let PatchSource::UploadedLocal {
            original_sha1: Some(sha1),
            ..
        } = &self.source
        {
            aliases.push(add_prefix(self.query.remote, sha1));
        }
        aliases
    }
}

/// Pull change URLs out of push output shaped like:
///
/// ```text
/// remote: New Changes:
/// remote:   https://review.example.com/36756
/// ```
fn scrape_change_urls(push_stderr: &str) -> Vec<String> {
    let lines: Vec<&str> = push_stderr.lines().collect();
    for (num, line) in lines.iter().enumerate() {
        if !line.contains("New Changes:") {
            continue;
        }
        let mut urls = Vec::new();
        for line in &lines[num + 1..] {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 2 || !fields[1].starts_with("http") {
                break;
            }
            urls.push(fields[1].to_string());
        }
        return urls;
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Remote;
    use crate::query::PatchQuery;

    #[test]
    fn scrapes_urls_after_new_changes_marker() {
        let stderr = "remote: Resolving deltas\n\
                      remote: New Changes:\n\
                      remote:   https://review.example.com/36756\n\
                      remote:   https://review.example.com/36757\n\
                      To https://example.com/repo\n";
        assert_eq!(
            scrape_change_urls(stderr),
            vec![
                "https://review.example.com/36756",
                "https://review.example.com/36757"
            ]
        );
    }

    #[test]
    fn no_marker_means_no_urls() {
        assert!(scrape_change_urls("Everything up-to-date\n").is_empty());
    }

    #[test]
    fn uploaded_local_aliases_include_original_sha1() {
        let original = "0043acd4765d7e4bf56531b6c3b285c42e3bee1b";
        let patch = GitRepoPatch::new_uploaded_local(
            "https://example.com/repo".to_string(),
            "refs/tryjobs/a/1".to_string(),
            PatchQuery::new(
                Remote::Internal,
                Some("chromiumos/chromite".to_string()),
                Some("master".to_string()),
                None,
                Some("1f0222dca61a6870131f2e7e48e0961c0c867bf2".to_string()),
                None,
            ),
            "feature".to_string(),
            Some(original.to_string()),
        );
        let aliases = patch.lookup_aliases();
        assert!(aliases.contains(&format!("*{original}")));
        assert!(aliases.contains(&"*1f0222dca61a6870131f2e7e48e0961c0c867bf2".to_string()));
    }

    #[test]
    fn carbon_copy_rejected_for_gerrit_patch() {
        let mut patch = GitRepoPatch::new(
            "https://example.com/repo".to_string(),
            "refs/changes/45/12345/2".to_string(),
            PatchQuery::new(Remote::External, None, None, None, None, None),
            PatchSource::UploadedLocal {
                original_branch: "feature".to_string(),
                original_sha1: None,
            },
        );
        assert!(matches!(
            patch.carbon_copy(),
            Err(PatchError::UnsupportedVariant { op: "carbon_copy" })
        ));
    }
}
