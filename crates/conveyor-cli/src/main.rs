//! Conveyor - continuous-build coordination CLI
//!
//! The `conveyor` command drives the buildspec lifecycle for a master
//! builder and its slaves.
//!
//! ## Commands
//!
//! - `next-spec`: Resolve (publishing if needed) the buildspec to build
//! - `set-inflight`: Atomically claim a version as being built
//! - `update-status`: Record pass/fail for a finished build
//! - `wait-slaves`: Block until every slave builder completes
//! - `apply-patches`: Cherry-pick changes and their dependencies onto a repo
//! - `filter-manifest`: Strip a manifest down to an allowed set of remotes

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, Level};

use conveyor_core::{filter_manifest, FsBlobStore, IncrType};
use conveyor_manifest::{
    BuildDatabase, BuildDbError, BuildSpecsManager, BuildState, ManagerConfig,
};
use conveyor_patch::{
    parse_sha1, resolve_transitive_deps, GitRepoPatch, PatchApplyError, PatchCache,
    PatchError, PatchQuery, PatchSource, Remote,
};

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Buildspec and patch coordination for continuous builds", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve the buildspec version this run should build, publishing a
    /// new one when the master has new work
    NextSpec {
        #[command(flatten)]
        manager: ManagerArgs,

        /// Build a specific existing version instead of resolving one
        #[arg(long)]
        version: Option<String>,

        /// Attempts before giving up on a contended push
        #[arg(long, default_value_t = 3)]
        retries: u32,
    },

    /// Claim a version for this build, failing if any of our builders
    /// already has a status recorded for it
    SetInflight {
        #[command(flatten)]
        manager: ManagerArgs,

        /// Version to claim
        version: String,
    },

    /// Record the outcome of a finished build and its sub-builds
    UpdateStatus {
        #[command(flatten)]
        manager: ManagerArgs,

        /// Version the outcome applies to
        version: String,

        /// Per-builder outcome, repeated: `NAME=pass` or `NAME=fail`
        #[arg(long = "result", required = true)]
        results: Vec<String>,

        /// Dashboard URL to attach to the aggregate status
        #[arg(long)]
        dashboard_url: Option<String>,

        /// Attempts before giving up on a contended push
        #[arg(long, default_value_t = 3)]
        retries: u32,
    },

    /// Wait for slave builders to complete, then print their statuses
    WaitSlaves {
        #[command(flatten)]
        manager: ManagerArgs,

        /// Version the slaves are building
        version: String,

        /// Build id of the master build in the completions file
        #[arg(long)]
        master_build_id: i64,

        /// Slave builder to wait for, repeated
        #[arg(long = "builder", required = true)]
        builders: Vec<String>,

        /// JSON file mapping master build ids to per-builder states
        #[arg(long)]
        completions_file: PathBuf,

        /// Give up after this many seconds
        #[arg(long, default_value_t = 3600)]
        timeout_secs: u64,
    },

    /// Cherry-pick changes (and their declared dependencies) onto the
    /// dedicated patch branch of a repo
    ApplyPatches {
        /// Git repo to apply onto
        #[arg(long)]
        repo: PathBuf,

        /// Upstream ref the patch branch tracks
        #[arg(long)]
        upstream: String,

        /// Accept changes already present upstream instead of conflicting
        #[arg(long)]
        trivial: bool,

        /// Patch to apply, repeated: `URL|REF` or `URL|REF|SHA1`
        #[arg(required = true)]
        patches: Vec<String>,
    },

    /// Remove projects on disallowed remotes from a manifest
    FilterManifest {
        /// Manifest to read
        #[arg(long)]
        input: PathBuf,

        /// Where to write the result (stdout when omitted)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Remote to keep, repeated
        #[arg(long = "remote", required = true)]
        remotes: Vec<String>,
    },
}

/// Everything needed to construct a `BuildSpecsManager`.
#[derive(Args)]
struct ManagerArgs {
    /// Checkout holding the version descriptor and manifest
    #[arg(long)]
    source_dir: PathBuf,

    /// Version descriptor, relative to the source checkout
    #[arg(long, default_value = "VERSION")]
    version_file: String,

    /// Manifest snapshot, relative to the source checkout
    #[arg(long, default_value = "default.xml")]
    manifest_file: String,

    /// Scratch directory holding the versions-repo mirror
    #[arg(long)]
    working_dir: PathBuf,

    /// URL of the repo that records published buildspecs
    #[arg(long)]
    versions_repo: String,

    /// Mirror into the internal flavor of the versions repo
    #[arg(long)]
    internal: bool,

    /// This build's name first, then each sub-build, repeated
    #[arg(long = "build-name", required = true)]
    build_names: Vec<String>,

    /// Version field a new spec advances
    #[arg(long, value_enum, default_value = "build")]
    incr_type: IncrTypeArg,

    /// Run as the master: mint new specs instead of reusing the latest
    #[arg(long)]
    master: bool,

    /// Build even when the identical checkout already passed
    #[arg(long)]
    force: bool,

    /// Blob-store prefix for builder statuses
    #[arg(long, default_value = "builder-status")]
    status_root: String,

    /// Root directory of the filesystem blob store
    #[arg(long)]
    store_dir: PathBuf,

    /// Go through the motions without pushing or uploading
    #[arg(long)]
    dry_run: bool,
}

impl ManagerArgs {
    fn build(self) -> Result<BuildSpecsManager<FsBlobStore>> {
        let store = FsBlobStore::new(&self.store_dir)
            .with_context(|| format!("opening blob store at {}", self.store_dir.display()))?;
        let config = ManagerConfig {
            source_dir: self.source_dir,
            version_file: self.version_file,
            manifest_file: self.manifest_file,
            working_dir: self.working_dir,
            manifest_repo_url: self.versions_repo,
            internal: self.internal,
            build_names: self.build_names,
            incr_type: self.incr_type.into(),
            master: self.master,
            force: self.force,
            status_root: self.status_root,
            dry_run: self.dry_run,
        };
        Ok(BuildSpecsManager::new(config, store))
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum IncrTypeArg {
    ChromeBranch,
    Build,
    Branch,
    Patch,
}

impl From<IncrTypeArg> for IncrType {
    fn from(value: IncrTypeArg) -> Self {
        match value {
            IncrTypeArg::ChromeBranch => IncrType::ChromeBranch,
            IncrTypeArg::Build => IncrType::Build,
            IncrTypeArg::Branch => IncrType::Branch,
            IncrTypeArg::Patch => IncrType::Patch,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    conveyor_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::NextSpec {
            manager,
            version,
            retries,
        } => cmd_next_spec(manager, version.as_deref(), retries),
        Commands::SetInflight { manager, version } => cmd_set_inflight(manager, &version),
        Commands::UpdateStatus {
            manager,
            version,
            results,
            dashboard_url,
            retries,
        } => cmd_update_status(manager, &version, &results, dashboard_url.as_deref(), retries),
        Commands::WaitSlaves {
            manager,
            version,
            master_build_id,
            builders,
            completions_file,
            timeout_secs,
        } => cmd_wait_slaves(
            manager,
            &version,
            master_build_id,
            &builders,
            completions_file,
            timeout_secs,
        ),
        Commands::ApplyPatches {
            repo,
            upstream,
            trivial,
            patches,
        } => cmd_apply_patches(&repo, &upstream, trivial, &patches),
        Commands::FilterManifest {
            input,
            output,
            remotes,
        } => cmd_filter_manifest(&input, output.as_deref(), &remotes),
    }
}

fn cmd_next_spec(manager: ManagerArgs, version: Option<&str>, retries: u32) -> Result<()> {
    let mut manager = manager.build()?;
    let version = match version {
        Some(explicit) => {
            manager
                .refresh_manifest_checkout()
                .context("refreshing the versions-repo mirror")?;
            manager
                .initialize_manifest_variables(Some(explicit))
                .with_context(|| format!("locating buildspec {explicit}"))?;
            explicit.to_string()
        }
        None => manager
            .get_next_build_spec(retries)
            .context("resolving the next buildspec")?,
    };
    println!("{version}");
    Ok(())
}

fn cmd_set_inflight(manager: ManagerArgs, version: &str) -> Result<()> {
    let manager = manager.build()?;
    manager
        .set_inflight(version)
        .with_context(|| format!("claiming version {version}"))?;
    Ok(())
}

/// Parse repeated `NAME=pass|fail` arguments into a success map.
fn parse_results(results: &[String]) -> Result<HashMap<String, bool>> {
    let mut success_map = HashMap::new();
    for result in results {
        let (builder, outcome) = result
            .split_once('=')
            .with_context(|| format!("malformed result {result:?}, want NAME=pass|fail"))?;
        let success = match outcome {
            "pass" => true,
            "fail" => false,
            other => bail!("unknown outcome {other:?} for builder {builder}"),
        };
        success_map.insert(builder.to_string(), success);
    }
    Ok(success_map)
}

fn cmd_update_status(
    manager: ManagerArgs,
    version: &str,
    results: &[String],
    dashboard_url: Option<&str>,
    retries: u32,
) -> Result<()> {
    let success_map = parse_results(results)?;
    let mut manager = manager.build()?;
    manager
        .update_status(version, &success_map, dashboard_url, retries)
        .with_context(|| format!("recording status for {version}"))?;
    Ok(())
}

/// Build database backed by a JSON file mapping master build ids to the
/// coarse state of every builder that has reported, e.g.
/// `{"1042": {"amd64": "completed", "arm": "inflight"}}`.
///
/// The file is re-read on every query so an external process can update it
/// while we poll.
struct JsonFileBuildDatabase {
    path: PathBuf,
}

impl BuildDatabase for JsonFileBuildDatabase {
    fn builder_states(
        &self,
        master_build_id: i64,
    ) -> Result<HashMap<String, BuildState>, BuildDbError> {
        let data = std::fs::read_to_string(&self.path)
            .map_err(|e| BuildDbError::Unavailable(format!("{}: {e}", self.path.display())))?;
        let map: HashMap<String, HashMap<String, String>> = serde_json::from_str(&data)
            .map_err(|e| BuildDbError::Unavailable(format!("{}: {e}", self.path.display())))?;
        let Some(entries) = map.get(&master_build_id.to_string()) else {
            return Ok(HashMap::new());
        };
        let mut states = HashMap::new();
        for (builder, state) in entries {
            let state = match state.as_str() {
                "inflight" => BuildState::Inflight,
                "completed" => BuildState::Completed,
                other => {
                    return Err(BuildDbError::Unavailable(format!(
                        "{}: unknown state {other:?} for builder {builder}",
                        self.path.display()
                    )))
                }
            };
            states.insert(builder.clone(), state);
        }
        Ok(states)
    }
}

fn cmd_wait_slaves(
    manager: ManagerArgs,
    version: &str,
    master_build_id: i64,
    builders: &[String],
    completions_file: PathBuf,
    timeout_secs: u64,
) -> Result<()> {
    let manager = manager.build()?;
    let db = JsonFileBuildDatabase {
        path: completions_file,
    };
    let statuses = manager
        .get_builders_status(
            master_build_id,
            builders,
            &db,
            version,
            Duration::from_secs(timeout_secs),
        )
        .with_context(|| format!("waiting for slaves of {version}"))?;

    println!("{}", serde_json::to_string_pretty(&statuses)?);

    let incomplete: Vec<&str> = builders
        .iter()
        .filter(|b| !statuses[b.as_str()].completed())
        .map(String::as_str)
        .collect();
    if !incomplete.is_empty() {
        bail!("builders never completed: {}", incomplete.join(", "));
    }
    Ok(())
}

/// Turn a `URL|REF` or `URL|REF|SHA1` argument into a local patch.
fn parse_patch_arg(text: &str) -> Result<GitRepoPatch> {
    let mut fields = text.split('|');
    let url = fields.next().filter(|u| !u.is_empty());
    let ref_name = fields.next().filter(|r| !r.is_empty());
    let sha1 = fields.next();
    let (Some(url), Some(ref_name)) = (url, ref_name) else {
        bail!("malformed patch {text:?}, want URL|REF or URL|REF|SHA1");
    };
    if fields.next().is_some() {
        bail!("malformed patch {text:?}: too many fields");
    }
    let sha1 = match sha1 {
        Some(s) => Some(
            parse_sha1(s)
                .with_context(|| format!("{s:?} is not a 40-hex sha1"))?
                .to_string(),
        ),
        None => None,
    };
    let query = PatchQuery::new(Remote::External, None, None, None, sha1, None);
    Ok(GitRepoPatch::new(
        url.to_string(),
        ref_name.to_string(),
        query,
        PatchSource::Local,
    ))
}

fn cmd_apply_patches(
    repo: &Path,
    upstream: &str,
    trivial: bool,
    patches: &[String],
) -> Result<()> {
    let mut pool = PatchCache::new();
    let mut seeds = Vec::new();
    for text in patches {
        let patch = parse_patch_arg(text)?;
        seeds.push(pool.inject(patch));
    }

    let mut applied = Vec::new();
    for seed in seeds {
        let order = resolve_transitive_deps(seed, &mut pool, repo, upstream)
            .with_context(|| format!("resolving dependencies of {}", pool.get(seed)))?;
        for idx in order {
            if applied.contains(&idx) {
                continue;
            }
            let link = pool.get(idx).patch_link();
            match pool.get_mut(idx).apply(repo, upstream, trivial) {
                Ok(()) => info!(patch = %link, "applied"),
                Err(PatchError::Apply(PatchApplyError::AlreadyApplied { .. })) => {
                    info!(patch = %link, "already applied upstream")
                }
                Err(e) => return Err(e).with_context(|| format!("applying {link}")),
            }
            applied.push(idx);
        }
    }

    for idx in &applied {
        println!("{}", pool.get(*idx).patch_link());
    }
    Ok(())
}

fn cmd_filter_manifest(input: &Path, output: Option<&Path>, remotes: &[String]) -> Result<()> {
    let contents = std::fs::read_to_string(input)
        .with_context(|| format!("reading {}", input.display()))?;
    let allowed: Vec<&str> = remotes.iter().map(String::as_str).collect();
    let filtered = filter_manifest(&contents, &allowed)?;
    match output {
        Some(path) => std::fs::write(path, filtered)
            .with_context(|| format!("writing {}", path.display()))?,
        None => print!("{filtered}"),
    }
    Ok(())
}
