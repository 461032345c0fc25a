//! Transitive dependency resolution over a pool of candidate patches.

use std::collections::HashSet;
use std::path::Path;

use tracing::debug;

use crate::error::{PatchError, Result};
use crate::query::{PatchCache, PatchQuery};

/// Resolve the ordered transitive closure of `seed`'s dependencies.
///
/// Dependencies come from both the declared CQ-DEPEND lines and the commit
/// graph or review-server parent list, restricted to the patches present in
/// `pool`. The walk is depth-first, each change visited once, dependencies
/// preceding their dependents; the seed itself closes the list. A
/// dependency outside the pool is not ours to apply and is skipped; a
/// dependency whose own resolution fails poisons the seed.
pub fn resolve_transitive_deps(
    seed: usize,
    pool: &mut PatchCache,
    git_repo: &Path,
    upstream: &str,
) -> Result<Vec<usize>> {
    let mut order = Vec::new();
    let mut visited = HashSet::new();
    visit(seed, pool, git_repo, upstream, &mut visited, &mut order)?;
    Ok(order)
}

fn visit(
    idx: usize,
    pool: &mut PatchCache,
    git_repo: &Path,
    upstream: &str,
    visited: &mut HashSet<usize>,
    order: &mut Vec<usize>,
) -> Result<()> {
    if !visited.insert(idx) {
        return Ok(());
    }

    let (patch_link, deps) = gather_deps(idx, pool, git_repo, upstream)?;

    for dep in deps {
        let Some(dep_idx) = pool.lookup(&dep) else {
            debug!(
                patch = %patch_link,
                dep = %dep.id().unwrap_or_else(|| format!("{dep:?}")),
                "dependency is not part of this series, skipping"
            );
            continue;
        };
        if let Err(e) = visit(dep_idx, pool, git_repo, upstream, visited, order) {
            let dep_link = pool.get(dep_idx).patch_link();
            return Err(PatchError::dependency(patch_link, dep_link, &e));
        }
    }

    order.push(idx);
    Ok(())
}

fn gather_deps(
    idx: usize,
    pool: &mut PatchCache,
    git_repo: &Path,
    upstream: &str,
) -> Result<(String, Vec<PatchQuery>)> {
    let patch = pool.get_mut(idx);
    let link = patch.patch_link();
    let mut deps = patch.gerrit_dependencies(git_repo, upstream)?;
    for dep in patch.paladin_dependencies(git_repo)? {
        if !deps.contains(&dep) {
            deps.push(dep);
        }
    }
    // Fetch may have learned the sha1 and change-id; keep the alias index
    // in step.
    pool.reindex(idx);
    Ok((link, deps))
}
