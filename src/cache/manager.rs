//! On-disk package repository cache.
//!
//! Each package is a Git repository cloned under `{cache_root}/{name}`. A
//! repository is materialized lazily on first request: primary clone from
//! the index, validation, mirror fallback, then the `core.bare` flag is
//! flipped while the working tree (and thus the `PKGBUILD`) stays on disk.
//! Subsequent requests validate and, when the TTL has elapsed, refresh via
//! `git pull`.
//!
//! This type is the only owner of package directory creation and deletion.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::git::commands;
use crate::store::MetadataStore;

/// Name of the build recipe file expected at every repository root.
pub const RECIPE_FILE: &str = "PKGBUILD";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A located, validated package repository.
#[derive(Debug, Clone)]
pub struct RepositoryInfo {
    pub name: String,
    /// Repository root under the cache directory.
    pub path: PathBuf,
    /// Directory holding the Git object database and refs.
    pub git_dir: PathBuf,
    pub bare: bool,
}

/// How `ensure_package` satisfied the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Materialized by a fresh clone.
    Cloned,
    /// Existing repository whose TTL had elapsed; refreshed from upstream.
    Refreshed,
    /// Existing repository served as-is.
    Hit,
}

/// Result of a successful `ensure_package`.
#[derive(Debug, Clone)]
pub struct EnsuredRepo {
    pub info: RepositoryInfo,
    pub freshness: Freshness,
}

// ---------------------------------------------------------------------------
// PackageCache
// ---------------------------------------------------------------------------

/// Owns the cache root and coordinates materialization and refresh.
pub struct PackageCache {
    cache_root: PathBuf,
    index_url: String,
    mirror_url: String,
    ttl_hours: i64,
    store: Arc<MetadataStore>,
    /// Per-name materialization locks. Entries are created on demand and
    /// kept for the process lifetime; the package universe is bounded by
    /// what clients actually request.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PackageCache {
    pub fn new(config: &Config, store: Arc<MetadataStore>) -> Self {
        Self {
            cache_root: PathBuf::from(&config.cache.path),
            index_url: config.upstream.index_url.trim_end_matches('/').to_string(),
            mirror_url: config.upstream.mirror_url.clone(),
            ttl_hours: config.cache.ttl_hours,
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The on-disk path for a package name.
    pub fn repo_path(&self, name: &str) -> PathBuf {
        self.cache_root.join(name)
    }

    /// Root of the cache directory.
    pub fn root(&self) -> &Path {
        &self.cache_root
    }

    /// List the names of all validated repositories currently on disk.
    pub fn list_cached(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        if !self.cache_root.exists() {
            return Ok(names);
        }

        let entries = std::fs::read_dir(&self.cache_root).with_context(|| {
            format!("failed to read cache directory: {}", self.cache_root.display())
        })?;

        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if validate_repo(&entry.path()) {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }

        names.sort();
        Ok(names)
    }

    /// Materialize (or locate and possibly refresh) the repository for
    /// `name`.
    ///
    /// Returns `None` when the package cannot be obtained from either the
    /// index or the mirror; the partial directory is removed so a later
    /// attempt starts clean. Concurrent calls for the same name serialize on
    /// a per-name mutex; different names proceed in parallel.
    #[instrument(skip(self), fields(%name))]
    pub async fn ensure_package(&self, name: &str) -> Result<Option<EnsuredRepo>> {
        if !valid_package_name(name) {
            warn!(name, "rejected invalid package name");
            return Ok(None);
        }

        let lock = self.name_lock(name).await;
        let _guard = lock.lock().await;

        let repo_path = self.repo_path(name);

        if repo_path.exists() && validate_repo(&repo_path) {
            let freshness = self.refresh_if_stale(name, &repo_path).await;
            return Ok(Some(EnsuredRepo {
                info: repo_info(name, repo_path),
                freshness,
            }));
        }

        match self.materialize(name, &repo_path).await? {
            true => Ok(Some(EnsuredRepo {
                info: repo_info(name, repo_path),
                freshness: Freshness::Cloned,
            })),
            false => Ok(None),
        }
    }

    async fn name_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // -- materialization ----------------------------------------------------

    /// Clone `name` from the index, falling back to the mirror. Returns
    /// whether a validated repository now exists at `repo_path`.
    async fn materialize(&self, name: &str, repo_path: &Path) -> Result<bool> {
        // A leftover directory here failed validation above: a partial
        // clone from a crashed attempt. Start clean.
        self.remove_partial(repo_path).await?;

        tokio::fs::create_dir_all(&self.cache_root)
            .await
            .with_context(|| {
                format!("failed to create cache root: {}", self.cache_root.display())
            })?;

        let primary_url = format!("{}/{}.git", self.index_url, name);
        info!(%primary_url, "cloning package from index");

        let primary_ok = match commands::clone(&primary_url, repo_path).await {
            Ok(output) => output.ok && validate_repo(repo_path),
            Err(e) => {
                warn!(error = %e, "primary clone did not run");
                false
            }
        };

        if primary_ok {
            self.finish_clone(name, repo_path).await?;
            return Ok(true);
        }

        warn!(name, "primary clone failed or produced an invalid repository; trying mirror");
        self.remove_partial(repo_path).await?;

        let mirror_ok = match commands::clone_branch(&self.mirror_url, name, repo_path).await {
            Ok(output) => output.ok && validate_repo(repo_path),
            Err(e) => {
                warn!(error = %e, "mirror clone did not run");
                false
            }
        };

        if mirror_ok {
            self.finish_clone(name, repo_path).await?;
            return Ok(true);
        }

        warn!(name, "mirror clone failed; package is unavailable");
        self.remove_partial(repo_path).await?;
        Ok(false)
    }

    /// Flip the bare flag and record the fetch. The directory layout is
    /// preserved so the recipe stays readable.
    async fn finish_clone(&self, name: &str, repo_path: &Path) -> Result<()> {
        commands::set_config(repo_path, "core.bare", "true")
            .await
            .with_context(|| format!("failed to mark {name} bare"))?;

        if let Err(e) = self.store.record_fetch(name, self.ttl_hours) {
            warn!(name, error = %e, "failed to record fetch");
        }

        info!(name, path = %repo_path.display(), "package materialized");
        Ok(())
    }

    async fn remove_partial(&self, repo_path: &Path) -> Result<()> {
        if repo_path.exists() {
            debug!(path = %repo_path.display(), "removing partial repository");
            tokio::fs::remove_dir_all(repo_path)
                .await
                .with_context(|| format!("failed to remove {}", repo_path.display()))?;
        }
        Ok(())
    }

    // -- refresh ------------------------------------------------------------

    /// Pull from upstream when the TTL has elapsed. Pull failures are logged
    /// and swallowed: stale data beats no data.
    async fn refresh_if_stale(&self, name: &str, repo_path: &Path) -> Freshness {
        let stale = match self.store.should_refresh(name) {
            Ok(stale) => stale,
            Err(e) => {
                warn!(name, error = %e, "should_refresh query failed; serving cached copy");
                false
            }
        };

        if !stale {
            return Freshness::Hit;
        }

        info!(name, "TTL elapsed; refreshing from upstream");
        match commands::pull(repo_path).await {
            Ok(output) if output.ok => {
                if let Err(e) = self.store.record_fetch(name, self.ttl_hours) {
                    warn!(name, error = %e, "failed to record refresh");
                }
                Freshness::Refreshed
            }
            Ok(output) => {
                warn!(name, stderr = %output.stderr_text(), "git pull failed; serving stale copy");
                Freshness::Hit
            }
            Err(e) => {
                warn!(name, error = %e, "git pull did not run; serving stale copy");
                Freshness::Hit
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Path discipline
// ---------------------------------------------------------------------------

/// A repository is bare when its root carries a `HEAD` file and no `.git`
/// directory; otherwise the Git directory is `root/.git`.
fn git_dir_for(repo_path: &Path) -> (PathBuf, bool) {
    let dotgit = repo_path.join(".git");
    if repo_path.join("HEAD").is_file() && !dotgit.is_dir() {
        (repo_path.to_path_buf(), true)
    } else {
        (dotgit, false)
    }
}

fn repo_info(name: &str, path: PathBuf) -> RepositoryInfo {
    let (git_dir, bare) = git_dir_for(&path);
    RepositoryInfo {
        name: name.to_string(),
        path,
        git_dir,
        bare,
    }
}

/// A successful materialization leaves both the Git directory and the
/// recipe file in place; anything else is a partial clone.
pub fn validate_repo(repo_path: &Path) -> bool {
    let (git_dir, bare) = git_dir_for(repo_path);
    let git_present = if bare {
        repo_path.join("HEAD").is_file()
    } else {
        git_dir.is_dir()
    };
    git_present && repo_path.join(RECIPE_FILE).is_file()
}

/// Package names become path components and clone URLs; reject anything
/// that could escape the cache root or smuggle options.
fn valid_package_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+' | '@'))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_checkout(root: &Path, name: &str) -> PathBuf {
        let repo = root.join(name);
        std::fs::create_dir_all(repo.join(".git")).unwrap();
        std::fs::write(repo.join(".git").join("HEAD"), "ref: refs/heads/master\n").unwrap();
        std::fs::write(repo.join(RECIPE_FILE), format!("pkgname={name}\n")).unwrap();
        repo
    }

    #[test]
    fn validate_requires_recipe_and_git_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = fake_checkout(tmp.path(), "yay");
        assert!(validate_repo(&repo));

        std::fs::remove_file(repo.join(RECIPE_FILE)).unwrap();
        assert!(!validate_repo(&repo));
    }

    #[test]
    fn validate_rejects_missing_git_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("partial");
        std::fs::create_dir_all(&repo).unwrap();
        std::fs::write(repo.join(RECIPE_FILE), "pkgname=partial\n").unwrap();
        assert!(!validate_repo(&repo));
    }

    #[test]
    fn git_dir_for_checkout_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = fake_checkout(tmp.path(), "yay");
        let (git_dir, bare) = git_dir_for(&repo);
        assert!(!bare);
        assert_eq!(git_dir, repo.join(".git"));
    }

    #[test]
    fn git_dir_for_bare_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("bare");
        std::fs::create_dir_all(&repo).unwrap();
        std::fs::write(repo.join("HEAD"), "ref: refs/heads/master\n").unwrap();

        let (git_dir, bare) = git_dir_for(&repo);
        assert!(bare);
        assert_eq!(git_dir, repo);
    }

    #[test]
    fn package_name_validation() {
        assert!(valid_package_name("ripgrep-git"));
        assert!(valid_package_name("libc++"));
        assert!(valid_package_name("python3.12"));
        assert!(!valid_package_name(""));
        assert!(!valid_package_name(".."));
        assert!(!valid_package_name("a/b"));
        assert!(!valid_package_name("--upload-pack=/bin/sh"));
    }

    fn test_cache(root: &Path) -> (Arc<MetadataStore>, PackageCache) {
        let store = Arc::new(MetadataStore::open(root).unwrap());
        let mut config = Config::default();
        config.cache.path = root.to_string_lossy().into_owned();
        // Point upstreams at paths that fail fast instead of the network.
        config.upstream.index_url = "file:///nonexistent-index".to_string();
        config.upstream.mirror_url = "file:///nonexistent-mirror".to_string();
        let cache = PackageCache::new(&config, Arc::clone(&store));
        (store, cache)
    }

    #[tokio::test]
    async fn ensure_existing_repo_is_a_hit() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, cache) = test_cache(tmp.path());
        fake_checkout(tmp.path(), "yay");
        store.record_fetch("yay", 12).unwrap();

        let ensured = cache.ensure_package("yay").await.unwrap().unwrap();
        assert_eq!(ensured.freshness, Freshness::Hit);
        assert_eq!(ensured.info.name, "yay");
        assert_eq!(ensured.info.git_dir, tmp.path().join("yay").join(".git"));
        assert_eq!(ensured.info.path, tmp.path().join("yay"));
        assert!(!ensured.info.bare);
    }

    #[tokio::test]
    async fn ensure_unreachable_upstream_cleans_up() {
        let tmp = tempfile::tempdir().unwrap();
        let (_store, cache) = test_cache(tmp.path());

        let ensured = cache.ensure_package("pkgnope").await.unwrap();
        assert!(ensured.is_none());
        // Materialization atomicity: no half-built directory survives.
        assert!(!tmp.path().join("pkgnope").exists());
    }

    #[tokio::test]
    async fn ensure_removes_partial_before_cloning() {
        let tmp = tempfile::tempdir().unwrap();
        let (_store, cache) = test_cache(tmp.path());

        // A partial directory without recipe or git dir, as left by a crash.
        let partial = tmp.path().join("crashed");
        std::fs::create_dir_all(partial.join("objects")).unwrap();

        let ensured = cache.ensure_package("crashed").await.unwrap();
        assert!(ensured.is_none());
        assert!(!partial.exists());
    }

    #[tokio::test]
    async fn ensure_rejects_traversal_names() {
        let tmp = tempfile::tempdir().unwrap();
        let (_store, cache) = test_cache(tmp.path());
        assert!(cache.ensure_package("..").await.unwrap().is_none());
        assert!(cache.ensure_package("").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_cached_skips_invalid_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let (_store, cache) = test_cache(tmp.path());
        fake_checkout(tmp.path(), "valid-one");
        std::fs::create_dir_all(tmp.path().join("partial")).unwrap();

        let names = cache.list_cached().unwrap();
        assert_eq!(names, vec!["valid-one"]);
    }

    #[tokio::test]
    async fn concurrent_ensure_same_name_is_serialized() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, cache) = test_cache(tmp.path());
        fake_checkout(tmp.path(), "busy");
        store.record_fetch("busy", 12).unwrap();

        let cache = Arc::new(cache);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache.ensure_package("busy").await.unwrap().unwrap()
            }));
        }
        for handle in handles {
            let ensured = handle.await.unwrap();
            assert_eq!(ensured.freshness, Freshness::Hit);
        }
    }
}
