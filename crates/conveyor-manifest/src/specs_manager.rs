//! The buildspec manager: mints, publishes and tracks versioned manifest
//! snapshots in a shared versions repository.
//!
//! The versions repository and the blob store are eventually observed, not
//! transactional. Every mutating operation runs inside
//! `retry_with_reload`: re-sync the local mirror, recompute the version
//! index, attempt the write, and loop when a concurrent writer's push beat
//! ours. Exhaustion restores the mirror to its clean tracked state before
//! the typed error surfaces.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use conveyor_core::{
    git, poll_until, retry_with_reload, BlobStore, BlobStoreError, BuildStatus, BuilderStatus,
    IncrType, PollOutcome, RetryDecision, VersionInfo, WritePrecondition,
};

use crate::build_db::{BuildDatabase, BuildState};
use crate::error::{SpecsError, SpecsResult};
use crate::slave_status::SlaveStatus;

/// Scratch branch buildspec commits are staged on before the push.
pub const PUSH_BRANCH: &str = "temp_auto_checkin_branch";

const SPECS_DIR: &str = "buildspecs";
const STATUS_LINKS_DIR: &str = "build-name";
const PASS_DIR: &str = "pass";
const FAIL_DIR: &str = "fail";

const POLL_PERIOD: Duration = Duration::from_secs(30);
const POLL_PROGRESS_EVERY: Duration = Duration::from_secs(5 * 60);

/// Construction parameters for a `BuildSpecsManager`.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Source checkout holding the version descriptor and current manifest.
    pub source_dir: PathBuf,
    /// Version descriptor path, relative to `source_dir`.
    pub version_file: String,
    /// Revision-pinned manifest snapshot path, relative to `source_dir`.
    pub manifest_file: String,
    /// Parent directory for the local versions-repo mirror.
    pub working_dir: PathBuf,
    pub manifest_repo_url: String,
    /// Internal and external versions repos get distinct mirror dirs so one
    /// manager never clobbers the other's checkout.
    pub internal: bool,
    /// This build plus its sub-builds; the first name is this build's own.
    pub build_names: Vec<String>,
    pub incr_type: IncrType,
    pub master: bool,
    pub force: bool,
    /// Blob-store root for builder status keys.
    pub status_root: String,
    pub dry_run: bool,
}

/// Per-initialization index of the versions repository.
#[derive(Debug, Clone)]
struct SpecsIndex {
    version_info: VersionInfo,
    /// Branch directory name under `buildspecs/`.
    branch_dir: String,
    /// Version stems in scope for this increment type.
    all: Vec<String>,
    latest: Option<String>,
    /// Latest spec no builder has recorded any status for.
    latest_unprocessed: Option<String>,
}

pub struct BuildSpecsManager<S: BlobStore> {
    config: ManagerConfig,
    manifests_dir: PathBuf,
    store: S,
    index: Option<SpecsIndex>,
    current_version: Option<String>,
}

impl<S: BlobStore> BuildSpecsManager<S> {
    pub fn new(config: ManagerConfig, store: S) -> Self {
        let mirror_name = if config.internal {
            "manifest-versions-internal"
        } else {
            "manifest-versions"
        };
        let manifests_dir = config.working_dir.join(mirror_name);
        BuildSpecsManager {
            config,
            manifests_dir,
            store,
            index: None,
            current_version: None,
        }
    }

    /// Local mirror of the versions repository.
    pub fn manifests_dir(&self) -> &Path {
        &self.manifests_dir
    }

    /// Version chosen by the last successful `get_next_build_spec`.
    pub fn current_version(&self) -> Option<&str> {
        self.current_version.as_deref()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn index(&self) -> SpecsResult<&SpecsIndex> {
        self.index.as_ref().ok_or_else(|| {
            SpecsError::Value("initialize_manifest_variables has not been run".to_string())
        })
    }

    /// Bring the mirror to a clean, current state. Idempotent: a mirror
    /// tracking the right remote is reset and fast-forwarded; anything else
    /// is deleted and re-cloned.
    pub fn refresh_manifest_checkout(&self) -> SpecsResult<()> {
        let dir = &self.manifests_dir;
        if dir.join(".git").exists() {
            let tracked = git::config_get(dir, "remote.origin.url")?;
            if tracked.as_deref() == Some(self.config.manifest_repo_url.as_str()) {
                debug!(dir = %dir.display(), "reusing existing versions mirror");
                git::run_git(dir, &["checkout", "-f", "master"])?;
                git::run_git(dir, &["fetch", "origin"])?;
                git::run_git(dir, &["reset", "--hard", "origin/master"])?;
                return Ok(());
            }
            warn!(
                dir = %dir.display(),
                tracked = tracked.as_deref().unwrap_or(""),
                "versions mirror tracks the wrong remote, recloning"
            );
        }
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        let parent = dir.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;
        git::clone(parent, &self.config.manifest_repo_url, dir)?;
        Ok(())
    }

    /// Best-effort return of the mirror to a clean tracked state.
    fn restore_mirror(&self) {
        let dir = &self.manifests_dir;
        let _ = git::run_git_unchecked(dir, &["checkout", "-f", "master"]);
        let _ = git::run_git_unchecked(dir, &["reset", "--hard", "origin/master"]);
        let _ = git::run_git_unchecked(dir, &["branch", "-D", PUSH_BRANCH]);
    }

    /// Recompute the version index from the source checkout and the mirror.
    ///
    /// With an explicit `version` its branch directory is discovered by
    /// searching every branch dir; one version appearing under several
    /// branches is an invariant violation. Without one, this build's
    /// chrome-branch directory is indexed: all spec stems in scope for the
    /// increment type, the numeric-tuple latest, and whether that latest is
    /// still unprocessed.
    pub fn initialize_manifest_variables(&mut self, version: Option<&str>) -> SpecsResult<()> {
        let descriptor =
            std::fs::read_to_string(self.config.source_dir.join(&self.config.version_file))?;
        let version_info = VersionInfo::from_descriptor(&descriptor, self.config.incr_type)?;
        let specs_root = self.manifests_dir.join(SPECS_DIR);

        let branch_dir = match version {
            Some(version) => {
                let mut matches = Vec::new();
                if specs_root.is_dir() {
                    for entry in std::fs::read_dir(&specs_root)? {
                        let entry = entry?;
                        let spec = entry.path().join(format!("{version}.xml"));
                        if entry.path().is_dir() && spec.exists() {
                            matches.push(entry.file_name().to_string_lossy().into_owned());
                        }
                    }
                }
                matches.sort();
                match matches.len() {
                    0 => {
                        return Err(SpecsError::Value(format!(
                            "no buildspec found for version {version}"
                        )))
                    }
                    1 => matches.remove(0),
                    n => {
                        return Err(SpecsError::Value(format!(
                            "version {version} appears under {n} branches"
                        )))
                    }
                }
            }
            None => version_info.chrome_branch.to_string(),
        };

        let prefix = version_info.build_prefix();
        let branch_path = specs_root.join(&branch_dir);
        let mut in_scope: Vec<(VersionInfo, String)> = Vec::new();
        if branch_path.is_dir() {
            for entry in std::fs::read_dir(&branch_path)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("xml") {
                    continue;
                }
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                if !stem.starts_with(&prefix) {
                    continue;
                }
                if let Ok(parsed) = VersionInfo::from_version_string(
                    stem,
                    version_info.chrome_branch,
                    version_info.incr_type,
                ) {
                    in_scope.push((parsed, stem.to_string()));
                }
            }
        }
        in_scope.sort();
        let all: Vec<String> = in_scope.into_iter().map(|(_, stem)| stem).collect();
        let latest = all.last().cloned();

        let latest_unprocessed = match &latest {
            Some(v) if !self.spec_processed(&branch_dir, v)? => Some(v.clone()),
            _ => None,
        };

        debug!(
            branch = %branch_dir,
            specs = all.len(),
            latest = latest.as_deref().unwrap_or("none"),
            unprocessed = latest_unprocessed.is_some(),
            "indexed versions repository"
        );

        if let Some(version) = version {
            self.current_version = Some(version.to_string());
        }
        self.index = Some(SpecsIndex {
            version_info,
            branch_dir,
            all,
            latest,
            latest_unprocessed,
        });
        Ok(())
    }

    /// Path of a canonical spec inside the mirror.
    pub fn spec_path(&self, branch_dir: &str, version: &str) -> PathBuf {
        self.manifests_dir
            .join(SPECS_DIR)
            .join(branch_dir)
            .join(format!("{version}.xml"))
    }

    fn status_link_path(
        &self,
        builder: &str,
        outcome: &str,
        branch_dir: &str,
        version: &str,
    ) -> PathBuf {
        self.manifests_dir
            .join(STATUS_LINKS_DIR)
            .join(builder)
            .join(outcome)
            .join(branch_dir)
            .join(format!("{version}.xml"))
    }

    /// Whether any builder of this build has recorded an outcome or an
    /// inflight marker for `version`.
    fn spec_processed(&self, branch_dir: &str, version: &str) -> SpecsResult<bool> {
        for builder in &self.config.build_names {
            for outcome in [PASS_DIR, FAIL_DIR] {
                if self
                    .status_link_path(builder, outcome, branch_dir, version)
                    .symlink_metadata()
                    .is_ok()
                {
                    return Ok(true);
                }
            }
            let key = BuilderStatus::store_key(&self.config.status_root, version, builder);
            if self.store.exists(&key)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// The latest spec's version when it already passed for this build and
    /// its manifest content is identical to the current checkout's.
    fn has_checkout_been_built(&self) -> SpecsResult<Option<String>> {
        let index = self.index()?;
        let Some(latest) = index.latest.clone() else {
            return Ok(None);
        };
        let own_name = &self.config.build_names[0];
        let passed = self
            .status_link_path(own_name, PASS_DIR, &index.branch_dir, &latest)
            .symlink_metadata()
            .is_ok();
        if !passed {
            return Ok(None);
        }
        let current =
            std::fs::read(self.config.source_dir.join(&self.config.manifest_file))?;
        let published = match std::fs::read(self.spec_path(&index.branch_dir, &latest)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok((current == published).then_some(latest))
    }

    /// Obtain the version of the buildspec this run should build,
    /// publishing a new one when necessary.
    ///
    /// A concurrent master racing us to publish the same version makes our
    /// push fail; the retry reloads the mirror, re-resolves "latest" and
    /// converges on the next free version.
    pub fn get_next_build_spec(&mut self, retries: u32) -> SpecsResult<String> {
        let attempts = retries.max(1);
        let result = retry_with_reload(
            attempts,
            self,
            |m| {
                m.refresh_manifest_checkout()?;
                m.initialize_manifest_variables(None)
            },
            |m| m.try_next_build_spec(),
            |e| match e {
                SpecsError::Git(_) => RetryDecision::Retry,
                _ => RetryDecision::Fail,
            },
        );
        match result {
            Ok(version) => {
                self.current_version = Some(version.clone());
                Ok(version)
            }
            Err(e) => {
                self.restore_mirror();
                match e {
                    e @ SpecsError::Git(_) => Err(SpecsError::Generation {
                        attempts,
                        source: Box::new(e),
                    }),
                    other => Err(other),
                }
            }
        }
    }

    fn try_next_build_spec(&mut self) -> SpecsResult<String> {
        if !self.config.force {
            if let Some(version) = self.has_checkout_been_built()? {
                info!(%version, "checkout already built and passed, reusing its spec");
                return Ok(version);
            }
        }
        if !self.config.master {
            if let Some(version) = self.index()?.latest_unprocessed.clone() {
                info!(%version, "reusing the master's unprocessed buildspec");
                return Ok(version);
            }
        }
        self.create_new_build_spec()
    }

    /// Mint and publish a new spec from the current checkout.
    fn create_new_build_spec(&mut self) -> SpecsResult<String> {
        let (mut version, collides, branch_dir) = {
            let index = self.index()?;
            let version = index.version_info.version_string();
            let collides = index.all.contains(&version);
            (version, collides, index.branch_dir.clone())
        };

        if collides {
            let index = self.index.as_mut().expect("index checked above");
            version = index.version_info.increment_version();
            info!(%version, "current version already published, bumped");
            let bumped = index.version_info.clone();
            if !self.config.dry_run {
                bumped.update_version_file(
                    &self.config.source_dir,
                    &self.config.version_file,
                    "origin",
                    "master",
                    &format!("Automatic: bump version to {version}"),
                )?;
            }
        }

        let manifest =
            std::fs::read(self.config.source_dir.join(&self.config.manifest_file))?;
        let rel_spec = format!("{SPECS_DIR}/{branch_dir}/{version}.xml");
        let path = self.manifests_dir.join(&rel_spec);
        std::fs::create_dir_all(path.parent().expect("spec path has a parent"))?;
        std::fs::write(&path, &manifest)?;

        self.commit_and_push(
            &[rel_spec],
            &format!(
                "Automatic: start {} {version}",
                self.config.build_names[0]
            ),
        )?;
        info!(%version, "published new buildspec");
        Ok(version)
    }

    /// Stage `paths` on the scratch branch, commit, and push to master.
    /// The mirror always comes back on a clean `master` afterwards.
    fn commit_and_push(&self, paths: &[String], message: &str) -> SpecsResult<()> {
        let result = self.commit_and_push_inner(paths, message);
        self.restore_mirror();
        result
    }

    fn commit_and_push_inner(&self, paths: &[String], message: &str) -> SpecsResult<()> {
        let dir = &self.manifests_dir;
        git::run_git(dir, &["checkout", "-B", PUSH_BRANCH, "-t", "origin/master"])?;
        let mut add = vec!["add", "--"];
        add.extend(paths.iter().map(|p| p.as_str()));
        git::run_git(dir, &add)?;
        git::run_git(dir, &["commit", "-m", message])?;

        let refspec = format!("{PUSH_BRANCH}:master");
        let mut push = vec!["push", "origin", refspec.as_str()];
        if self.config.dry_run {
            push.push("--dry-run");
        }
        git::run_git(dir, &push)?;
        Ok(())
    }

    /// Mark `version` inflight for this build. The marker is an atomic
    /// create-if-absent; losing the race is the typed `AlreadyInflight`.
    pub fn set_inflight(&self, version: &str) -> SpecsResult<()> {
        let status = BuilderStatus::new(BuildStatus::Inflight);
        for builder in &self.config.build_names {
            let result = status.upload(
                &self.store,
                &self.config.status_root,
                version,
                builder,
                WritePrecondition::FailIfExists,
            );
            match result {
                Ok(()) => {}
                Err(BlobStoreError::PreconditionFailed(_)) => {
                    return Err(SpecsError::AlreadyInflight {
                        version: version.to_string(),
                    })
                }
                Err(e) => return Err(e.into()),
            }
        }
        info!(%version, "marked inflight");
        Ok(())
    }

    /// Record the outcome of this build and its sub-builds.
    ///
    /// Creates one pass/fail symlink per sub-build pointing at the
    /// canonical spec and pushes them (retried with full reload), then
    /// uploads the aggregate status blob: passed only when every sub-build
    /// succeeded.
    pub fn update_status(
        &mut self,
        version: &str,
        success_map: &HashMap<String, bool>,
        dashboard_url: Option<&str>,
        retries: u32,
    ) -> SpecsResult<()> {
        let version = version.to_string();
        let attempts = retries.max(1);
        let result = retry_with_reload(
            attempts,
            self,
            |m| m.refresh_manifest_checkout(),
            |m| m.push_status_links(&version, success_map),
            |e| match e {
                SpecsError::Git(_) => RetryDecision::Retry,
                _ => RetryDecision::Fail,
            },
        );
        if let Err(e) = result {
            self.restore_mirror();
            return match e {
                e @ SpecsError::Git(_) => Err(SpecsError::StatusUpdate {
                    attempts,
                    source: Box::new(e),
                }),
                other => Err(other),
            };
        }

        let success = success_map.values().all(|s| *s);
        let mut status = BuilderStatus::new(BuildStatus::completed_status(success));
        if let Some(url) = dashboard_url {
            status = status.with_dashboard_url(url);
        }
        status.upload(
            &self.store,
            &self.config.status_root,
            &version,
            &self.config.build_names[0],
            WritePrecondition::None,
        )?;
        info!(%version, success, "recorded build status");
        Ok(())
    }

    fn push_status_links(
        &mut self,
        version: &str,
        success_map: &HashMap<String, bool>,
    ) -> SpecsResult<()> {
        let branch_dir = match &self.index {
            Some(index) => index.branch_dir.clone(),
            None => {
                self.initialize_manifest_variables(Some(version))?;
                self.index()?.branch_dir.clone()
            }
        };

        let mut builders: Vec<&String> = success_map.keys().collect();
        builders.sort();

        let mut rel_links = Vec::new();
        for builder in builders {
            let outcome = if success_map[builder] { PASS_DIR } else { FAIL_DIR };
            let link = self.status_link_path(builder, outcome, &branch_dir, version);
            std::fs::create_dir_all(link.parent().expect("link path has a parent"))?;
            // Relative so the link survives the repo being cloned elsewhere.
            let target = format!("../../../../{SPECS_DIR}/{branch_dir}/{version}.xml");
            if link.symlink_metadata().is_ok() {
                std::fs::remove_file(&link)?;
            }
            std::os::unix::fs::symlink(&target, &link)?;
            rel_links.push(format!(
                "{STATUS_LINKS_DIR}/{builder}/{outcome}/{branch_dir}/{version}.xml"
            ));
        }

        self.commit_and_push(
            &rel_links,
            &format!(
                "Automatic checkin: status for {version} by {}",
                self.config.build_names[0]
            ),
        )
    }

    /// One tick of the tiered status read: coarse per-builder states come
    /// from the build database; detail blobs are fetched only for builders
    /// it reports complete. A builder the database calls inflight shows up
    /// as `Inflight` here, so presence in the map tracks "has reported",
    /// not "has finished".
    pub fn fetch_slave_statuses(
        &self,
        master_build_id: i64,
        builders: &[String],
        db: &dyn BuildDatabase,
        version: &str,
    ) -> SpecsResult<HashMap<String, BuilderStatus>> {
        let mut status = HashMap::new();
        for (builder, state) in db.builder_states(master_build_id)? {
            if !builders.contains(&builder) {
                continue;
            }
            let detail = match state {
                BuildState::Completed => BuilderStatus::fetch(
                    &self.store,
                    &self.config.status_root,
                    version,
                    &builder,
                )?,
                BuildState::Inflight => BuilderStatus::new(BuildStatus::Inflight),
            };
            status.insert(builder, detail);
        }
        Ok(status)
    }

    /// Poll until every expected sub-build completes or the deadline hits.
    ///
    /// Each tick folds one `fetch_slave_statuses` read into the slave
    /// tracker; the start deadline only gives up on builders the database
    /// has never seen.
    pub fn get_builders_status(
        &self,
        master_build_id: i64,
        builders: &[String],
        db: &dyn BuildDatabase,
        version: &str,
        timeout: Duration,
    ) -> SpecsResult<HashMap<String, BuilderStatus>> {
        let mut slaves = SlaveStatus::new(builders.iter().cloned());
        let start = Instant::now();

        let outcome = poll_until(
            POLL_PERIOD,
            timeout,
            POLL_PROGRESS_EVERY,
            || -> SpecsResult<bool> {
                let status =
                    self.fetch_slave_statuses(master_build_id, builders, db, version)?;
                slaves.update(status);
                Ok(slaves.should_wait(start.elapsed()))
            },
            |elapsed| {
                info!(
                    elapsed_secs = elapsed.as_secs(),
                    "still waiting for slave builders"
                )
            },
        )?;
        if outcome == PollOutcome::DeadlineExceeded {
            warn!(%version, "timed out waiting for slave builders");
        }

        let mut result = HashMap::new();
        for builder in builders {
            let detail =
                BuilderStatus::fetch(&self.store, &self.config.status_root, version, builder)?;
            result.insert(builder.clone(), detail);
        }
        Ok(result)
    }
}
