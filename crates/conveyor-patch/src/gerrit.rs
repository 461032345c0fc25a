//! Gerrit review metadata, decoded from the query JSON schema.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{PatchError, Result};
use crate::format::{
    add_prefix, parse_change_id, parse_gerrit_number, parse_sha1, Remote,
};
use crate::patch::{GitRepoPatch, PatchSource};
use crate::query::PatchQuery;

/// Lifecycle state of a change on the review server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewStatus {
    New,
    Submitted,
    Merged,
    Abandoned,
}

/// One label vote on the current patch set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
    #[serde(rename = "grantedOn", default)]
    pub granted_on: i64,
}

/// A `dependsOn` entry as Gerrit reports it. At least one of the three
/// identifier keys must be present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawDependency {
    #[serde(default, deserialize_with = "de_opt_number")]
    pub number: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub revision: Option<String>,
}

/// Review-server state attached to a Gerrit patch.
#[derive(Debug, Clone)]
pub struct GerritMeta {
    pub gerrit_number: String,
    /// Patch set number within the change.
    pub patch_number: Option<String>,
    pub owner: Option<String>,
    pub owner_email: Option<String>,
    pub url: String,
    pub review_status: ReviewStatus,
    pub approvals: Vec<Approval>,
    /// Most recent vote timestamp, 0 when unvoted.
    pub approval_timestamp: i64,
    pub depends_on: Vec<RawDependency>,
}

impl GerritMeta {
    pub fn is_already_merged(&self) -> bool {
        self.review_status == ReviewStatus::Merged
    }

    /// Whether any vote on `field` is one of `values`. Absent labels count
    /// as a "0" vote, so asking for "0" matches an unvoted change.
    pub fn has_approval(&self, field: &str, values: &[&str]) -> bool {
        let votes: Vec<&str> = self
            .approvals
            .iter()
            .filter(|a| a.kind == field)
            .map(|a| a.value.as_str())
            .collect();
        if votes.is_empty() {
            return values.contains(&"0");
        }
        votes.iter().any(|v| values.contains(v))
    }

    /// The most recent vote value for `field`, "0" when unvoted.
    pub fn latest_approval(&self, field: &str) -> String {
        self.approvals
            .iter()
            .filter(|a| a.kind == field)
            .next_back()
            .map(|a| a.value.clone())
            .unwrap_or_else(|| "0".to_string())
    }

    /// Dependencies reported by the review server for this change.
    pub(crate) fn dependency_queries(
        &self,
        query: &PatchQuery,
        patch: &str,
    ) -> Result<Vec<PatchQuery>> {
        let mut results = Vec::new();
        for dep in &self.depends_on {
            let gerrit_number = dep
                .number
                .as_deref()
                .map(|n| require(patch, n, "gerrit number", parse_gerrit_number(n)))
                .transpose()?;
            let change_id = dep
                .id
                .as_deref()
                .map(|i| require(patch, i, "change-id", parse_change_id(i)))
                .transpose()?;
            let sha1 = dep
                .revision
                .as_deref()
                .map(|r| require(patch, r, "sha1", parse_sha1(r)))
                .transpose()?;
            if gerrit_number.is_none() && change_id.is_none() && sha1.is_none() {
                return Err(PatchError::Internal {
                    patch: patch.to_string(),
                    message: "dependency entry has none of the number, id, or revision keys"
                        .to_string(),
                });
            }
            results.push(PatchQuery::new(
                query.remote,
                query.project.clone(),
                query.tracking_branch.clone(),
                change_id,
                sha1,
                gerrit_number,
            ));
        }
        Ok(results)
    }
}

fn require(patch: &str, text: &str, what: &str, parsed: Option<&str>) -> Result<String> {
    parsed.map(|s| s.to_string()).ok_or_else(|| PatchError::Dependency {
        patch: patch.to_string(),
        dep: text.to_string(),
        reason: format!("is not a valid {what}"),
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryChange {
    project: String,
    branch: String,
    id: String,
    #[serde(deserialize_with = "de_number")]
    number: String,
    owner: QueryOwner,
    url: String,
    status: ReviewStatus,
    #[serde(default)]
    commit_message: Option<String>,
    #[serde(default)]
    current_patch_set: Option<CurrentPatchSet>,
    #[serde(default)]
    depends_on: Vec<RawDependency>,
}

#[derive(Debug, Deserialize)]
struct QueryOwner {
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CurrentPatchSet {
    #[serde(rename = "ref", default)]
    ref_name: Option<String>,
    #[serde(default)]
    revision: Option<String>,
    #[serde(default, deserialize_with = "de_opt_number")]
    number: Option<String>,
    #[serde(default)]
    approvals: Vec<Approval>,
}

// Gerrit emits change and patch-set numbers as JSON numbers or strings
// depending on the endpoint.
fn de_number<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    match Value::deserialize(d)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a number or string, got {other}"
        ))),
    }
}

fn de_opt_number<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<Option<String>, D::Error> {
    match Value::deserialize(d)? {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(serde::de::Error::custom(format!(
            "expected a number or string, got {other}"
        ))),
    }
}

impl GitRepoPatch {
    /// Build a patch from one entry of a Gerrit query result.
    ///
    /// `url_prefix` is the review server's clone base; the project name is
    /// appended to it to form the fetch url.
    pub fn from_gerrit_query(json: Value, remote: Remote, url_prefix: &str) -> Result<Self> {
        let change: QueryChange =
            serde_json::from_value(json).map_err(|e| PatchError::Internal {
                patch: "gerrit query result".to_string(),
                message: format!("cannot decode change: {e}"),
            })?;

        let gerrit_number = parse_gerrit_number(&change.number)
            .ok_or_else(|| PatchError::Internal {
                patch: add_prefix(remote, &change.number),
                message: format!("{:?} is not a valid gerrit number", change.number),
            })?
            .to_string();

        let patch_set = change.current_patch_set.unwrap_or(CurrentPatchSet {
            ref_name: None,
            revision: None,
            number: None,
            approvals: Vec::new(),
        });

        let owner_email = change.owner.email;
        let owner = owner_email
            .as_deref()
            .map(|e| e.split('@').next().unwrap_or(e).to_string());

        let meta = GerritMeta {
            gerrit_number: gerrit_number.clone(),
            patch_number: patch_set.number,
            owner,
            owner_email,
            url: change.url,
            review_status: change.status,
            approval_timestamp: patch_set
                .approvals
                .iter()
                .map(|a| a.granted_on)
                .max()
                .unwrap_or(0),
            approvals: patch_set.approvals,
            depends_on: change.depends_on,
        };

        let query = PatchQuery::new(
            remote,
            Some(change.project.clone()),
            Some(change.branch),
            parse_change_id(&change.id).map(|s| s.to_string()),
            patch_set.revision.clone(),
            Some(gerrit_number),
        );

        let mut patch = GitRepoPatch::new(
            format!("{}/{}", url_prefix.trim_end_matches('/'), change.project),
            patch_set.ref_name.unwrap_or_default(),
            query,
            PatchSource::Gerrit(meta),
        );
        patch.subject = change
            .commit_message
            .as_deref()
            .and_then(|m| m.lines().next())
            .map(|s| s.to_string());
        patch.commit_message = change.commit_message;
        Ok(patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_change() -> Value {
        json!({
            "project": "chromiumos/chromite",
            "branch": "master",
            "id": "I47ea30385af60ae4cc2acc5d1a283a46423bc6e1",
            "number": 12345,
            "owner": {"email": "dev@chromium.org"},
            "url": "https://review.example.com/12345",
            "status": "NEW",
            "commitMessage": "Add a widget\n\nChange-Id: I47ea30385af60ae4cc2acc5d1a283a46423bc6e1\n",
            "currentPatchSet": {
                "ref": "refs/changes/45/12345/2",
                "revision": "1f0222dca61a6870131f2e7e48e0961c0c867bf2",
                "number": "2",
                "approvals": [
                    {"type": "CRVW", "value": "1", "grantedOn": 100},
                    {"type": "CRVW", "value": "2", "grantedOn": 200},
                    {"type": "VRIF", "value": "-1", "grantedOn": 150}
                ]
            },
            "dependsOn": [{"number": "12344"}]
        })
    }

    fn sample_meta(patch: &GitRepoPatch) -> &GerritMeta {
        match &patch.source {
            PatchSource::Gerrit(meta) => meta,
            _ => panic!("expected a gerrit patch"),
        }
    }

    #[test]
    fn decodes_query_json() {
        let patch =
            GitRepoPatch::from_gerrit_query(sample_change(), Remote::External, "https://chromium.googlesource.com")
                .unwrap();
        assert_eq!(
            patch.project_url,
            "https://chromium.googlesource.com/chromiumos/chromite"
        );
        assert_eq!(patch.ref_name, "refs/changes/45/12345/2");
        assert_eq!(
            patch.query.sha1.as_deref(),
            Some("1f0222dca61a6870131f2e7e48e0961c0c867bf2")
        );
        assert_eq!(patch.subject.as_deref(), Some("Add a widget"));

        let meta = sample_meta(&patch);
        assert_eq!(meta.gerrit_number, "12345");
        assert_eq!(meta.owner.as_deref(), Some("dev"));
        assert_eq!(meta.review_status, ReviewStatus::New);
        assert_eq!(meta.approval_timestamp, 200);
        assert_eq!(patch.patch_link(), "CL:12345");
    }

    #[test]
    fn approval_queries_default_to_zero() {
        let patch =
            GitRepoPatch::from_gerrit_query(sample_change(), Remote::External, "https://host")
                .unwrap();
        let meta = sample_meta(&patch);
        assert!(meta.has_approval("CRVW", &["2"]));
        assert!(!meta.has_approval("CRVW", &["-2"]));
        assert!(meta.has_approval("COMR", &["0"]));
        assert_eq!(meta.latest_approval("CRVW"), "2");
        assert_eq!(meta.latest_approval("COMR"), "0");
        assert!(!meta.is_already_merged());
    }

    #[test]
    fn depends_on_becomes_queries() {
        let mut patch =
            GitRepoPatch::from_gerrit_query(sample_change(), Remote::External, "https://host")
                .unwrap();
        let deps = patch
            .gerrit_dependencies(std::path::Path::new("/nonexistent"), "origin/master")
            .unwrap();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].gerrit_number.as_deref(), Some("12344"));
        assert_eq!(deps[0].project.as_deref(), Some("chromiumos/chromite"));
    }

    #[test]
    fn empty_depends_on_entry_is_an_error() {
        let mut change = sample_change();
        change["dependsOn"] = json!([{}]);
        let mut patch =
            GitRepoPatch::from_gerrit_query(change, Remote::External, "https://host").unwrap();
        let err = patch
            .gerrit_dependencies(std::path::Path::new("/nonexistent"), "origin/master")
            .unwrap_err();
        assert!(matches!(err, PatchError::Internal { .. }));
    }

    #[test]
    fn merged_status_detected() {
        let mut change = sample_change();
        change["status"] = json!("MERGED");
        let patch =
            GitRepoPatch::from_gerrit_query(change, Remote::Internal, "https://host").unwrap();
        assert!(sample_meta(&patch).is_already_merged());
        assert_eq!(patch.patch_link(), "CL:*12345");
    }
}
