//! Manifest filtering.
//!
//! A buildspec is an XML manifest enumerating `<remote>`, `<project>` and
//! `<pending_commit>` elements. External consumers only get the allowlisted
//! remotes. Filtering is line-based on purpose: surviving elements must be
//! byte-identical to the input, which a parse/re-serialize round trip would
//! not guarantee.

use std::collections::HashSet;

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FilterManifestError {
    #[error(
        "default remote {remote:?} is filtered out but {count} project(s) rely on it"
    )]
    AmbiguousDefaultRemote { remote: String, count: usize },
}

fn attr(line: &str, name: &str) -> Option<String> {
    // Attribute values in repo manifests are double-quoted.
    let re = Regex::new(&format!(r#"{name}="([^"]*)""#)).expect("static attr pattern");
    re.captures(line).map(|c| c[1].to_string())
}

fn element_name(line: &str) -> Option<&str> {
    let start = line.find('<')?;
    let rest = &line[start + 1..];
    if rest.starts_with('/') || rest.starts_with('!') || rest.starts_with('?') {
        return None;
    }
    let end = rest.find(|c: char| c.is_whitespace() || c == '>' || c == '/')?;
    Some(&rest[..end])
}

/// Remove all `<remote>`/`<project>`/`<pending_commit>` elements that do not
/// belong to `allowed_remotes`, dropping any blank lines the removals leave
/// behind. Surviving lines are preserved byte-for-byte.
pub fn filter_manifest(
    contents: &str,
    allowed_remotes: &[&str],
) -> Result<String, FilterManifestError> {
    let allowed: HashSet<&str> = allowed_remotes.iter().copied().collect();

    // First pass: default remote and the projects that will be removed.
    let mut default_remote: Option<String> = None;
    let mut defaulted_projects = 0usize;
    let mut removed_projects: HashSet<String> = HashSet::new();

    for line in contents.lines() {
        match element_name(line) {
            Some("default") => {
                default_remote = attr(line, "remote");
            }
            Some("project") => {
                let explicit = attr(line, "remote");
                if explicit.is_none() {
                    defaulted_projects += 1;
                }
                let effective = explicit.or_else(|| default_remote.clone());
                let keep = effective.as_deref().is_some_and(|r| allowed.contains(r));
                if !keep {
                    if let Some(name) = attr(line, "name") {
                        removed_projects.insert(name);
                    }
                }
            }
            _ => {}
        }
    }

    if let Some(ref remote) = default_remote {
        if !allowed.contains(remote.as_str()) && defaulted_projects > 0 {
            return Err(FilterManifestError::AmbiguousDefaultRemote {
                remote: remote.clone(),
                count: defaulted_projects,
            });
        }
    }

    // Second pass: drop the offending elements. A removed `<project>` with
    // child elements spans until its close tag.
    let mut out = String::with_capacity(contents.len());
    let mut skipping_until: Option<&'static str> = None;
    let mut last_removed = false;

    for line in contents.lines() {
        if let Some(close) = skipping_until {
            if line.contains(close) {
                skipping_until = None;
            }
            continue;
        }

        // Blank lines directly after a removal are debris of the removal.
        if line.trim().is_empty() {
            if !last_removed {
                out.push_str(line);
                out.push('\n');
            }
            continue;
        }

        let remove = match element_name(line) {
            Some("remote") => attr(line, "name")
                .map(|n| !allowed.contains(n.as_str()))
                .unwrap_or(true),
            Some("project") => {
                let effective = attr(line, "remote").or_else(|| default_remote.clone());
                let removed = !effective.as_deref().is_some_and(|r| allowed.contains(r));
                if removed && !line.trim_end().ends_with("/>") {
                    skipping_until = Some("</project>");
                }
                removed
            }
            Some("pending_commit") => attr(line, "project")
                .map(|p| removed_projects.contains(&p))
                .unwrap_or(false),
            _ => false,
        };

        last_removed = remove;
        if !remove {
            out.push_str(line);
            out.push('\n');
        }
    }

    Ok(out)
}
