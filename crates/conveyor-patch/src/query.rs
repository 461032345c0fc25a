//! Patch identity queries and the lookup cache.
//!
//! A `PatchQuery` is a partially known identity used to look a change up in
//! a pool or in Gerrit. Identity starts partial (a bare Gerrit number, a
//! sha1) and gets completed by fetching; the canonical `id` prefers the
//! full change id and falls back to the sha1.

use std::collections::HashMap;

use crate::format::{add_prefix, Remote};
use crate::patch::GitRepoPatch;

/// Stored identity of one change, across the three identifier spaces.
#[derive(Debug, Clone, Default)]
pub struct PatchQuery {
    pub remote: Remote,
    pub project: Option<String>,
    /// Remote branch of the project, stored as its basename.
    pub tracking_branch: Option<String>,
    pub change_id: Option<String>,
    pub sha1: Option<String>,
    pub gerrit_number: Option<String>,
}

impl PatchQuery {
    pub fn new(
        remote: Remote,
        project: Option<String>,
        tracking_branch: Option<String>,
        change_id: Option<String>,
        sha1: Option<String>,
        gerrit_number: Option<String>,
    ) -> Self {
        // Stored as the branch basename; `rsplit` always yields at least
        // one piece.
        let tracking_branch =
            tracking_branch.map(|b| b.rsplit('/').next().unwrap_or("").to_string());
        PatchQuery {
            remote,
            project,
            tracking_branch,
            change_id,
            sha1,
            gerrit_number,
        }
    }

    /// `project~branch~change-id`, when all three parts are known.
    pub fn full_change_id(&self) -> Option<String> {
        match (&self.project, &self.tracking_branch, &self.change_id) {
            (Some(p), Some(b), Some(c)) => Some(format!("{p}~{b}~{c}")),
            _ => None,
        }
    }

    /// Canonical internal id: prefixed full change id, else prefixed sha1.
    pub fn id(&self) -> Option<String> {
        if let Some(full) = self.full_change_id() {
            return Some(add_prefix(self.remote, &full));
        }
        self.sha1
            .as_deref()
            .map(|sha1| add_prefix(self.remote, sha1))
    }

    /// Every unique key this change can be found under in a `PatchCache`.
    ///
    /// A bare Change-Id is deliberately absent: it is not unique across
    /// branches, so only the full change id is a safe key.
    pub fn lookup_aliases(&self) -> Vec<String> {
        let mut aliases = Vec::new();
        if let Some(number) = &self.gerrit_number {
            aliases.push(number.clone());
        }
        if let Some(full) = self.full_change_id() {
            aliases.push(full);
        }
        if let Some(sha1) = &self.sha1 {
            aliases.push(sha1.clone());
        }
        aliases
            .into_iter()
            .map(|a| add_prefix(self.remote, &a))
            .collect()
    }

    /// Best identifier for a Gerrit query, most unique first.
    pub fn to_gerrit_query_text(&self) -> Option<String> {
        self.gerrit_number
            .clone()
            .or_else(|| self.full_change_id())
            .or_else(|| self.sha1.clone())
            .or_else(|| self.change_id.clone())
    }
}

impl PartialEq for PatchQuery {
    fn eq(&self, other: &Self) -> bool {
        if let (Some(a), Some(b)) = (self.id(), other.id()) {
            return a == b;
        }
        (
            self.remote,
            &self.project,
            &self.tracking_branch,
            &self.gerrit_number,
            &self.change_id,
            &self.sha1,
        ) == (
            other.remote,
            &other.project,
            &other.tracking_branch,
            &other.gerrit_number,
            &other.change_id,
            &other.sha1,
        )
    }
}

impl Eq for PatchQuery {}

/// Pool of patches indexed by every lookup alias.
///
/// Owns its patches; slots are stable handles, so callers track indices
/// and fetch mutable access on demand. Removal tombstones the slot rather
/// than shifting later handles.
#[derive(Debug, Default)]
pub struct PatchCache {
    patches: Vec<Option<GitRepoPatch>>,
    aliases: HashMap<String, usize>,
}

impl PatchCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a patch, indexing all its current aliases. Returns its handle.
    pub fn inject(&mut self, patch: GitRepoPatch) -> usize {
        let idx = self.patches.len();
        self.patches.push(Some(patch));
        self.reindex(idx);
        idx
    }

    /// Refresh the alias index for a patch whose identity was completed
    /// (e.g. by a fetch).
    pub fn reindex(&mut self, idx: usize) {
        let aliases = self.patches[idx]
            .as_ref()
            .map(|p| p.lookup_aliases())
            .unwrap_or_default();
        for alias in aliases {
            self.aliases.insert(alias, idx);
        }
    }

    /// Drop a patch and all aliases pointing at it.
    pub fn remove(&mut self, idx: usize) -> Option<GitRepoPatch> {
        let patch = self.patches[idx].take()?;
        self.aliases.retain(|_, target| *target != idx);
        Some(patch)
    }

    /// Find a patch by any alias of `query`.
    pub fn lookup(&self, query: &PatchQuery) -> Option<usize> {
        query
            .lookup_aliases()
            .iter()
            .find_map(|alias| self.aliases.get(alias).copied())
    }

    /// Find a patch by a raw alias string.
    pub fn lookup_alias(&self, alias: &str) -> Option<usize> {
        self.aliases.get(alias).copied()
    }

    pub fn get(&self, idx: usize) -> &GitRepoPatch {
        self.patches[idx].as_ref().expect("live patch handle")
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut GitRepoPatch {
        self.patches[idx].as_mut().expect("live patch handle")
    }

    pub fn len(&self) -> usize {
        self.patches.iter().filter(|p| p.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &GitRepoPatch> {
        self.patches.iter().filter_map(|p| p.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::PatchSource;

    const SHA1: &str = "1f0222dca61a6870131f2e7e48e0961c0c867bf2";
    const CHANGE_ID: &str = "I47ea30385af60ae4cc2acc5d1a283a46423bc6e1";

    fn full_query() -> PatchQuery {
        PatchQuery::new(
            Remote::External,
            Some("chromiumos/chromite".to_string()),
            Some("refs/heads/master".to_string()),
            Some(CHANGE_ID.to_string()),
            Some(SHA1.to_string()),
            Some("10001".to_string()),
        )
    }

    #[test]
    fn tracking_branch_normalized_to_basename() {
        let q = full_query();
        assert_eq!(q.tracking_branch.as_deref(), Some("master"));
    }

    #[test]
    fn id_prefers_full_change_id() {
        let q = full_query();
        assert_eq!(
            q.id().unwrap(),
            format!("chromiumos/chromite~master~{CHANGE_ID}")
        );

        let sha_only = PatchQuery::new(
            Remote::Internal,
            None,
            None,
            None,
            Some(SHA1.to_string()),
            None,
        );
        assert_eq!(sha_only.id().unwrap(), format!("*{SHA1}"));
    }

    #[test]
    fn aliases_cover_all_unique_identifiers() {
        let q = full_query();
        let aliases = q.lookup_aliases();
        assert!(aliases.contains(&"10001".to_string()));
        assert!(aliases.contains(&format!("chromiumos/chromite~master~{CHANGE_ID}")));
        assert!(aliases.contains(&SHA1.to_string()));
        // Bare change id is not a unique key.
        assert!(!aliases.contains(&CHANGE_ID.to_string()));
    }

    #[test]
    fn internal_aliases_are_prefixed() {
        let q = PatchQuery::new(
            Remote::Internal,
            None,
            None,
            None,
            None,
            Some("42".to_string()),
        );
        assert_eq!(q.lookup_aliases(), vec!["*42".to_string()]);
    }

    #[test]
    fn gerrit_query_text_prefers_number() {
        let q = full_query();
        assert_eq!(q.to_gerrit_query_text().as_deref(), Some("10001"));

        let empty = PatchQuery::default();
        assert_eq!(empty.to_gerrit_query_text(), None);
    }

    #[test]
    fn cache_lookup_by_any_alias() {
        let mut cache = PatchCache::new();
        let patch = GitRepoPatch::new(
            "https://example.com/repo".to_string(),
            "refs/changes/01/10001/1".to_string(),
            full_query(),
            PatchSource::Local,
        );
        let idx = cache.inject(patch);

        let by_number = PatchQuery::new(
            Remote::External,
            None,
            None,
            None,
            None,
            Some("10001".to_string()),
        );
        assert_eq!(cache.lookup(&by_number), Some(idx));

        let by_sha1 = PatchQuery::new(
            Remote::External,
            None,
            None,
            None,
            Some(SHA1.to_string()),
            None,
        );
        assert_eq!(cache.lookup(&by_sha1), Some(idx));

        let wrong_remote = PatchQuery::new(
            Remote::Internal,
            None,
            None,
            None,
            None,
            Some("10001".to_string()),
        );
        assert_eq!(cache.lookup(&wrong_remote), None);
    }

    #[test]
    fn removal_drops_patch_and_aliases() {
        let mut cache = PatchCache::new();
        let idx = cache.inject(GitRepoPatch::new(
            "https://example.com/repo".to_string(),
            "refs/changes/01/10001/1".to_string(),
            full_query(),
            PatchSource::Local,
        ));
        assert_eq!(cache.len(), 1);

        assert!(cache.remove(idx).is_some());
        assert!(cache.is_empty());
        assert_eq!(cache.lookup_alias("10001"), None);
        assert!(cache.remove(idx).is_none());
    }
}
