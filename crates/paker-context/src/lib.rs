//! Owns cache/resolver/graph/installer state for one run of the tool.
//!
//! Replaces the source's global singletons with a single
//! value constructed once per invocation and passed explicitly; tests build
//! isolated contexts over a temp cache root, so there is no process-wide
//! state. Grounded on `gust/src/install.rs`'s `Installer` pipeline for the
//! install path and `gust/src/commands/core.rs` for the command surface.

use paker_cache::{CacheEntry, GlobalCache};
use paker_fetch::FetchError;
use paker_graph::Graph;
use paker_installer::{InstallReport, Installer};
use paker_lockfile::Lockfile;
use paker_manifest::ManifestError;
use paker_resolver::{ProviderError, ResolutionProvider, ResolveError, Resolver};
use paker_types::{ChosenVersion, Manifest, PackageId};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Cache(#[from] paker_cache::CacheError),
    #[error(transparent)]
    Lockfile(#[from] paker_lockfile::LockfileError),
    #[error("project already initialized at {0}")]
    AlreadyInitialized(PathBuf),
    #[error("package `{0}` is not declared in the manifest")]
    NotDeclared(PackageId),
}

fn lockfile_path(project_dir: &Path) -> PathBuf {
    project_dir.join(".paker").join("lock").join("Paker.lock")
}

/// Resolves against real git remotes and the global cache: `source_url`
/// from the manifest's builtin-repo map, `available_versions`/`default_tag`
/// via `git ls-remote`, `dependencies` via a cache-backed fetch of the
/// chosen revision's child manifest.
struct GitProvider<'a> {
    manifest: &'a Manifest,
    cache: &'a GlobalCache,
}

impl<'a> ResolutionProvider for GitProvider<'a> {
    fn source_url(&self, package: &str) -> Option<String> {
        paker_types::resolve_source_url(self.manifest, package)
    }

    fn available_versions(
        &self,
        package: &str,
        source_url: &str,
    ) -> Result<Vec<semver::Version>, ProviderError> {
        let tags = paker_fetch::list_remote_tags(source_url).map_err(|e| fetch_to_provider(package, e))?;
        Ok(tags.into_iter().filter_map(|t| t.version).collect())
    }

    fn default_tag(&self, package: &str, source_url: &str) -> Result<String, ProviderError> {
        paker_fetch::remote_default_branch(source_url).map_err(|e| fetch_to_provider(package, e))
    }

    fn dependencies(
        &self,
        package: &str,
        chosen: &ChosenVersion,
        source_url: &str,
    ) -> Result<HashMap<PackageId, String>, ProviderError> {
        let revision = chosen.to_string();
        let entry_dir = self
            .cache
            .acquire(package, &revision, source_url)
            .map_err(|e| ProviderError::NetworkError {
                package: package.to_string(),
                message: e.to_string(),
            })?;
        let (child_manifest, warning) = paker_manifest::load_child(&entry_dir);
        if let Some(warning) = warning {
            tracing::warn!(package, path = %warning.path.display(), "{}", warning.message);
        }
        Ok(child_manifest.dependencies)
    }
}

fn fetch_to_provider(package: &str, err: FetchError) -> ProviderError {
    match err {
        FetchError::RevisionNotFound { revision, .. } => ProviderError::RevisionNotFound {
            package: package.to_string(),
            revision,
        },
        other => ProviderError::NetworkError {
            package: package.to_string(),
            message: other.to_string(),
        },
    }
}

pub struct Context {
    pub project_dir: PathBuf,
    pub cache: GlobalCache,
    pub parallelism: usize,
}

impl Context {
    pub fn new(project_dir: PathBuf, cache: GlobalCache, parallelism: usize) -> Self {
        Self {
            project_dir,
            cache,
            parallelism,
        }
    }

    /// Construct a context for `project_dir`, honoring `PAKER_CACHE_ROOT`
    /// and `PAKER_PARALLELISM`.
    pub fn from_env(project_dir: PathBuf) -> Result<Self, ContextError> {
        let cache = GlobalCache::open_default()?;
        let parallelism = std::env::var("PAKER_PARALLELISM")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(paker_installer::default_parallelism);
        Ok(Self::new(project_dir, cache, parallelism))
    }

    pub fn init(&self) -> Result<(), ContextError> {
        if paker_manifest::project_manifest_exists(&self.project_dir) {
            return Err(ContextError::AlreadyInitialized(self.project_dir.clone()));
        }
        let mut manifest = Manifest::default();
        manifest.name = self
            .project_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "myproject".to_string());
        paker_manifest::save_project(&self.project_dir, &manifest)?;
        Ok(())
    }

    fn load_manifest(&self) -> Result<Manifest, ContextError> {
        Ok(paker_manifest::load_project(&self.project_dir)?)
    }

    pub fn add(&self, package: &str, constraint: &str) -> Result<Graph, ContextError> {
        let mut manifest = self.load_manifest()?;
        paker_manifest::set_dependency(&mut manifest, package, constraint);
        let graph = self.resolve(&manifest)?;
        paker_manifest::save_project(&self.project_dir, &manifest)?;
        Ok(graph)
    }

    pub fn remove(&self, package: &str) -> Result<bool, ContextError> {
        let mut manifest = self.load_manifest()?;
        let removed = paker_manifest::remove_dependency(&mut manifest, package);
        paker_manifest::save_project(&self.project_dir, &manifest)?;
        self.cache.unlink(&self.project_dir, package).ok();
        Ok(removed)
    }

    pub fn list(&self) -> Result<Vec<(PackageId, String)>, ContextError> {
        let manifest = self.load_manifest()?;
        let mut deps: Vec<(PackageId, String)> = manifest.dependencies.into_iter().collect();
        deps.sort();
        Ok(deps)
    }

    fn resolve(&self, manifest: &Manifest) -> Result<Graph, ContextError> {
        let provider = GitProvider {
            manifest,
            cache: &self.cache,
        };
        let resolver = Resolver::new(&provider);
        Ok(resolver.resolve(manifest)?)
    }

    pub fn lock(&self) -> Result<Lockfile, ContextError> {
        let manifest = self.load_manifest()?;
        let graph = self.resolve(&manifest)?;
        let digests = BTreeMap::new();
        let lockfile = Lockfile::from_graph(&graph, &digests);
        lockfile.write(&lockfile_path(&self.project_dir))?;
        Ok(lockfile)
    }

    /// Replay the lockfile (if `frozen`) or resolve fresh, then install.
    pub async fn install(&self, frozen: bool) -> Result<InstallReport, ContextError> {
        let manifest = self.load_manifest()?;
        let mut graph = if frozen {
            let lockfile = Lockfile::read(&lockfile_path(&self.project_dir))?;
            let mut top_level = BTreeMap::new();
            for (package, raw) in &manifest.dependencies {
                let constraint = paker_types::parse_constraint(raw).unwrap_or(paker_types::Constraint::Any);
                top_level.insert(package.clone(), constraint);
            }
            lockfile.replay(&top_level)?
        } else {
            self.resolve(&manifest)?
        };

        let installer = Installer::new(
            GlobalCache::open_at(self.cache.root().to_path_buf())?,
            self.parallelism,
        );
        let report = installer.install(&mut graph, &self.project_dir).await;

        let mut digests = BTreeMap::new();
        for outcome in &report.linked {
            if let Ok(digest) = paker_fetch::compute_dir_hash(&outcome.path) {
                digests.insert(outcome.package.clone(), digest);
            }
        }
        let lockfile = Lockfile::from_graph(&graph, &digests);
        lockfile.write(&lockfile_path(&self.project_dir))?;

        Ok(report)
    }

    /// Loosen the named package (or every top-level package) to `*`,
    /// re-resolve the whole graph, and install the result.
    pub async fn upgrade(&self, package: Option<&str>) -> Result<InstallReport, ContextError> {
        let mut manifest = self.load_manifest()?;
        if let Some(pkg) = package {
            if !manifest.dependencies.contains_key(pkg) {
                return Err(ContextError::NotDeclared(pkg.to_string()));
            }
        }
        paker_resolver::loosen_for_upgrade(&mut manifest, package);
        paker_manifest::save_project(&self.project_dir, &manifest)?;
        self.install(false).await
    }

    pub fn tree(&self) -> Result<String, ContextError> {
        let manifest = self.load_manifest()?;
        let graph = self.resolve(&manifest)?;
        let mut out = String::new();
        let mut roots: Vec<&str> = graph
            .edges()
            .iter()
            .filter(|e| e.parent.is_none())
            .map(|e| e.child.as_str())
            .collect();
        roots.sort_unstable();
        roots.dedup();
        for root in roots {
            render_tree(&graph, root, 0, &mut out);
        }
        Ok(out)
    }

    /// Unlink every link no longer declared, then evict cache entries idle
    /// for longer than `ttl_secs`.
    pub fn clean(&self, ttl_secs: u64) -> Result<Vec<CacheEntry>, ContextError> {
        let manifest = self.load_manifest()?;
        let links_dir = self.project_dir.join(".paker").join("links");
        if let Ok(entries) = std::fs::read_dir(&links_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if !manifest.dependencies.contains_key(&name) {
                    self.cache.unlink(&self.project_dir, &name).ok();
                }
            }
        }
        Ok(self.cache.gc(ttl_secs)?)
    }
}

fn render_tree(graph: &Graph, pkg: &str, depth: usize, out: &mut String) {
    out.push_str(&"  ".repeat(depth));
    out.push_str("- ");
    out.push_str(pkg);
    out.push('\n');
    let mut children: Vec<&str> = graph
        .edges()
        .iter()
        .filter(|e| e.parent.as_deref() == Some(pkg))
        .map(|e| e.child.as_str())
        .collect();
    children.sort_unstable();
    children.dedup();
    for child in children {
        render_tree(graph, child, depth + 1, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn init_creates_manifest_and_rejects_second_call() {
        let tmp = TempDir::new().unwrap();
        let project_dir = tmp.path().join("widgets");
        std::fs::create_dir_all(&project_dir).unwrap();
        let cache = GlobalCache::open_at(tmp.path().join("cache")).unwrap();
        let ctx = Context::new(project_dir.clone(), cache, 2);

        ctx.init().unwrap();
        assert!(paker_manifest::project_manifest_exists(&project_dir));

        let err = ctx.init().unwrap_err();
        assert!(matches!(err, ContextError::AlreadyInitialized(_)));
    }

    #[test]
    fn list_reflects_manifest_dependencies() {
        let tmp = TempDir::new().unwrap();
        let project_dir = tmp.path().join("widgets");
        std::fs::create_dir_all(&project_dir).unwrap();
        let cache = GlobalCache::open_at(tmp.path().join("cache")).unwrap();
        let ctx = Context::new(project_dir.clone(), cache, 2);
        ctx.init().unwrap();

        let mut manifest = paker_manifest::load_project(&project_dir).unwrap();
        paker_manifest::set_dependency(&mut manifest, "fmt", "=10.0.0");
        paker_manifest::save_project(&project_dir, &manifest).unwrap();

        let deps = ctx.list().unwrap();
        assert_eq!(deps, vec![("fmt".to_string(), "=10.0.0".to_string())]);
    }
}
