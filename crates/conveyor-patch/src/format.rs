//! Patch identifier parsing and normalization.
//!
//! Changes are referenced in three identifier spaces: Gerrit Change-Id
//! (`I` + 40 hex), commit sha1 (40 hex) and Gerrit number (up to 6 digits).
//! Internal changes carry a leading `*` marker wherever users write
//! identifiers; the parsed forms are always unprefixed with the remote
//! carried separately.

use regex::Regex;

use crate::error::{PatchError, Result};
use crate::query::PatchQuery;

pub const GERRIT_CHANGE_ID_PREFIX: char = 'I';
pub const GERRIT_CHANGE_ID_LENGTH: usize = 40;
pub const MAX_GERRIT_NUMBER_LENGTH: usize = 6;

const INTERNAL_CHANGE_PREFIX: &str = "*";

/// Which remote a change lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Remote {
    #[default]
    External,
    Internal,
}

impl Remote {
    /// Marker users prepend to identifiers for this remote.
    pub fn change_prefix(&self) -> &'static str {
        match self {
            Remote::External => "",
            Remote::Internal => INTERNAL_CHANGE_PREFIX,
        }
    }
}

/// Strip the internal `*` marker; returns the remote it implied.
pub fn strip_prefix(text: &str) -> (Remote, &str) {
    match text.strip_prefix(INTERNAL_CHANGE_PREFIX) {
        Some(rest) => (Remote::Internal, rest),
        None => (Remote::External, text),
    }
}

/// Prepend the remote's marker to an identifier.
pub fn add_prefix(remote: Remote, text: &str) -> String {
    format!("{}{}", remote.change_prefix(), text)
}

fn is_hex(text: &str) -> bool {
    !text.is_empty() && text.chars().all(|c| c.is_ascii_hexdigit())
}

/// Parse a 40-hex sha1, `None` when `text` has another shape.
pub fn parse_sha1(text: &str) -> Option<&str> {
    (text.len() == 40 && is_hex(text)).then_some(text)
}

/// Parse a Gerrit change number: all digits, at most 6 of them.
pub fn parse_gerrit_number(text: &str) -> Option<&str> {
    (!text.is_empty()
        && text.len() <= MAX_GERRIT_NUMBER_LENGTH
        && text.chars().all(|c| c.is_ascii_digit()))
    .then_some(text)
}

/// Parse a Change-Id: `I` followed by exactly 40 hex characters.
pub fn parse_change_id(text: &str) -> Option<&str> {
    let rest = text.strip_prefix(GERRIT_CHANGE_ID_PREFIX)?;
    (rest.len() == GERRIT_CHANGE_ID_LENGTH && is_hex(rest)).then_some(text)
}

/// Parse a full change id `project~branch~Ixxxx…`.
pub fn parse_full_change_id(text: &str) -> Option<(&str, &str, &str)> {
    let fields: Vec<&str> = text.split('~').collect();
    if fields.len() != 3 {
        return None;
    }
    let (project, branch, change_id) = (fields[0], fields[1], fields[2]);

    let project_re = Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_\-]*(/[a-zA-Z0-9_-]+)*$").unwrap();
    let branch_re = Regex::new(r"^(refs/heads/)?[a-zA-Z0-9_][a-zA-Z0-9_\-]*$").unwrap();
    if !project_re.is_match(project) || !branch_re.is_match(branch) {
        return None;
    }
    parse_change_id(change_id)?;
    Some((project, branch, change_id))
}

/// A normalized patch dependency identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormattedDep {
    ChangeId { remote: Remote, id: String },
    Sha1 { remote: Remote, sha1: String },
    GerritNumber { remote: Remote, number: String },
}

impl FormattedDep {
    /// The user-facing form, remote marker included.
    pub fn to_dep_string(&self) -> String {
        match self {
            FormattedDep::ChangeId { remote, id } => add_prefix(*remote, id),
            FormattedDep::Sha1 { remote, sha1 } => add_prefix(*remote, sha1),
            FormattedDep::GerritNumber { remote, number } => add_prefix(*remote, number),
        }
    }
}

/// Normalize a user-written dependency, auto-detecting its identifier space
/// from its shape. `CL:123` forms are only accepted with `allow_cl`.
pub fn format_patch_dep(text: &str, allow_cl: bool) -> Result<FormattedDep> {
    let malformed = |reason: &str| PatchError::MalformedDep {
        text: text.to_string(),
        reason: reason.to_string(),
    };

    if text.is_empty() {
        return Err(malformed("empty identifier"));
    }

    let mut rest = text;
    if rest.to_uppercase().starts_with("CL:") {
        if !allow_cl {
            return Err(malformed("CL: prefix is not allowed here"));
        }
        if !rest.starts_with("CL:") {
            return Err(malformed("the CL: prefix must be upper case"));
        }
        rest = &rest[3..];
    }

    let (remote, rest) = strip_prefix(rest);

    if let Some(id) = parse_change_id(rest) {
        return Ok(FormattedDep::ChangeId {
            remote,
            id: id.to_string(),
        });
    }
    if let Some(number) = parse_gerrit_number(rest) {
        return Ok(FormattedDep::GerritNumber {
            remote,
            number: number.to_string(),
        });
    }
    if let Some(sha1) = parse_sha1(rest) {
        return Ok(FormattedDep::Sha1 {
            remote,
            sha1: sha1.to_string(),
        });
    }
    Err(malformed(
        "not a Change-Id, Gerrit number, or sha1",
    ))
}

/// Which identifier spaces `parse_patch_dep` should accept.
#[derive(Debug, Clone, Copy, Default)]
pub struct DepConstraints {
    pub no_change_id: bool,
    pub no_full_change_id: bool,
    pub no_gerrit_number: bool,
    pub no_sha1: bool,
}

/// Parse a user-given dependency into a `PatchQuery`.
pub fn parse_patch_dep(text: &str, constraints: DepConstraints) -> Result<PatchQuery> {
    let malformed = |reason: &str| PatchError::MalformedDep {
        text: text.to_string(),
        reason: reason.to_string(),
    };

    if text.is_empty() {
        return Err(malformed("empty identifier"));
    }

    let (remote, rest) = strip_prefix(text);

    if let Some((project, branch, change_id)) = parse_full_change_id(rest) {
        if constraints.no_full_change_id {
            return Err(malformed("full Change-Id is not allowed here"));
        }
        return Ok(PatchQuery::new(
            remote,
            Some(project.to_string()),
            Some(branch.to_string()),
            Some(change_id.to_string()),
            None,
            None,
        ));
    }
    if let Some(change_id) = parse_change_id(rest) {
        if constraints.no_change_id {
            return Err(malformed("Change-Id is not allowed here"));
        }
        return Ok(PatchQuery::new(
            remote,
            None,
            None,
            Some(change_id.to_string()),
            None,
            None,
        ));
    }
    if let Some(number) = parse_gerrit_number(rest) {
        if constraints.no_gerrit_number {
            return Err(malformed("Gerrit number is not allowed here"));
        }
        return Ok(PatchQuery::new(
            remote,
            None,
            None,
            None,
            None,
            Some(number.to_string()),
        ));
    }
    if let Some(sha1) = parse_sha1(rest) {
        if constraints.no_sha1 {
            return Err(malformed("sha1 is not allowed here"));
        }
        return Ok(PatchQuery::new(
            remote,
            None,
            None,
            None,
            Some(sha1.to_string()),
            None,
        ));
    }
    Err(malformed("not a recognized change identifier"))
}

/// Extract the ordered, de-duplicated CQ-DEPEND dependency list from a
/// commit message.
///
/// Only the exact `CQ-DEPEND=` spelling is accepted; near misses such as
/// `CQ_DEPEND:` are errors rather than silently ignored lines.
pub fn get_paladin_deps(commit_message: &str) -> Result<Vec<PatchQuery>> {
    let dependency_re = Regex::new(r"(?im)^(CQ.?DEPEND.)(.*)$").unwrap();
    let chunk_re = Regex::new(r"[^, ]+").unwrap();
    const EXPECTED_PREFIX: &str = "CQ-DEPEND=";

    let mut dependencies: Vec<PatchQuery> = Vec::new();
    for caps in dependency_re.captures_iter(commit_message) {
        let prefix = &caps[1];
        if prefix != EXPECTED_PREFIX {
            return Err(PatchError::MalformedDep {
                text: caps[0].to_string(),
                reason: format!("expected {EXPECTED_PREFIX:?}, but got {prefix:?}"),
            });
        }
        for chunk in chunk_re.find_iter(&caps[2]) {
            let dep = parse_patch_dep(
                chunk.as_str(),
                DepConstraints {
                    no_sha1: true,
                    ..Default::default()
                },
            )?;
            if !dependencies.contains(&dep) {
                dependencies.push(dep);
            }
        }
    }
    Ok(dependencies)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA1: &str = "1f0222dca61a6870131f2e7e48e0961c0c867bf2";

    #[test]
    fn sha1_shapes() {
        assert!(parse_sha1(SHA1).is_some());
        assert!(parse_sha1(&SHA1[..39]).is_none());
        assert!(parse_sha1("not-hex-at-all-not-hex-at-all-not-hex-at").is_none());
    }

    #[test]
    fn gerrit_number_shapes() {
        assert!(parse_gerrit_number("123456").is_some());
        assert!(parse_gerrit_number("1").is_some());
        assert!(parse_gerrit_number("1234567").is_none());
        assert!(parse_gerrit_number("12a4").is_none());
        assert!(parse_gerrit_number("").is_none());
    }

    #[test]
    fn change_id_shapes() {
        let id = format!("I{SHA1}");
        assert!(parse_change_id(&id).is_some());
        assert!(parse_change_id(SHA1).is_none());
        assert!(parse_change_id("I1234").is_none());
    }

    #[test]
    fn full_change_id_shapes() {
        let full = format!("chromiumos/chromite~master~I{SHA1}");
        let (project, branch, change_id) = parse_full_change_id(&full).unwrap();
        assert_eq!(project, "chromiumos/chromite");
        assert_eq!(branch, "master");
        assert!(change_id.starts_with('I'));

        assert!(parse_full_change_id("a~b").is_none());
        assert!(parse_full_change_id(&format!("~master~I{SHA1}")).is_none());
    }

    #[test]
    fn format_patch_dep_detects_kind_by_shape() {
        assert!(matches!(
            format_patch_dep("123", false).unwrap(),
            FormattedDep::GerritNumber { remote: Remote::External, .. }
        ));
        assert!(matches!(
            format_patch_dep(&format!("I{SHA1}"), false).unwrap(),
            FormattedDep::ChangeId { .. }
        ));
        assert!(matches!(
            format_patch_dep(SHA1, false).unwrap(),
            FormattedDep::Sha1 { .. }
        ));
    }

    #[test]
    fn format_patch_dep_internal_marker() {
        let dep = format_patch_dep("*123", false).unwrap();
        assert_eq!(
            dep,
            FormattedDep::GerritNumber {
                remote: Remote::Internal,
                number: "123".to_string()
            }
        );
        assert_eq!(dep.to_dep_string(), "*123");
    }

    #[test]
    fn cl_prefix_needs_permission() {
        assert!(format_patch_dep("CL:123", false).is_err());
        assert!(matches!(
            format_patch_dep("CL:123", true).unwrap(),
            FormattedDep::GerritNumber { .. }
        ));
        // Lower-case prefix is a typo, not a valid form.
        assert!(format_patch_dep("cl:123", true).is_err());
    }

    #[test]
    fn parse_patch_dep_respects_constraints() {
        let no_sha1 = DepConstraints {
            no_sha1: true,
            ..Default::default()
        };
        assert!(parse_patch_dep(SHA1, no_sha1).is_err());
        assert!(parse_patch_dep("123", no_sha1).is_ok());
    }

    #[test]
    fn paladin_deps_ordered_and_deduped() {
        let message = "Add the frobnicator\n\nBUG=chromium:1234\nCQ-DEPEND=10001,10002, *10003 10001\n";
        let deps = get_paladin_deps(message).unwrap();
        let numbers: Vec<String> = deps
            .iter()
            .map(|d| add_prefix(d.remote, d.gerrit_number.as_deref().unwrap()))
            .collect();
        assert_eq!(numbers, ["10001", "10002", "*10003"]);
    }

    #[test]
    fn paladin_deps_rejects_near_miss_prefix() {
        let err = get_paladin_deps("CQ_DEPEND:10001\n").unwrap_err();
        assert!(matches!(err, PatchError::MalformedDep { .. }));
    }

    #[test]
    fn paladin_deps_rejects_sha1_targets() {
        let message = format!("Subject\n\nCQ-DEPEND={SHA1}\n");
        assert!(get_paladin_deps(&message).is_err());
    }

    #[test]
    fn paladin_deps_absent_is_empty() {
        assert!(get_paladin_deps("Just a subject\n").unwrap().is_empty());
    }
}
