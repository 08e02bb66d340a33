//! Parallel installer: brings every `resolved` node in a graph to
//! `linked`, bounded by a worker pool of size `P`.
//!
//! Grounded on `gust/src/install.rs`'s `Installer`, minus its progress-bar
//! reporting and Swift-specific manifest regeneration step.

use paker_cache::{CacheError, GlobalCache};
use paker_graph::{Graph, NodeStatus};
use paker_types::PackageId;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("package {package} has no source url")]
    MissingSourceUrl { package: PackageId },
    #[error("package {package} has no chosen version")]
    Unresolved { package: PackageId },
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Outcome of linking a single node.
#[derive(Debug, Clone)]
pub struct NodeOutcome {
    pub package: PackageId,
    pub path: PathBuf,
}

/// Outcome of a full installation run: partial success is preserved, so
/// `linked` always holds every node that made it, even if `failures` is
/// non-empty.
#[derive(Debug, Default)]
pub struct InstallReport {
    pub linked: Vec<NodeOutcome>,
    pub failures: Vec<(PackageId, InstallError)>,
}

impl InstallReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Default worker pool size: available parallelism capped at 8.
pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(8)
}

pub struct Installer {
    cache: Arc<GlobalCache>,
    parallelism: usize,
    cancelled: Arc<AtomicBool>,
}

impl Installer {
    pub fn new(cache: GlobalCache, parallelism: usize) -> Self {
        Self {
            cache: Arc::new(cache),
            parallelism: parallelism.max(1),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A cooperative cancel handle: setting this stops new work from
    /// starting, but in-flight fetches are allowed to finish, since they
    /// write into a locked, resumable temp location.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    /// Fetch, cache, and link every `resolved` node in `graph` into
    /// `project_dir`. Mutates node statuses in place as work completes.
    pub async fn install(&self, graph: &mut Graph, project_dir: &Path) -> InstallReport {
        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let package_ids: Vec<PackageId> = {
            let mut ids: Vec<PackageId> = graph
                .nodes()
                .filter(|n| n.status == NodeStatus::Resolved)
                .map(|n| n.package.clone())
                .collect();
            ids.sort();
            ids
        };

        let mut tasks = Vec::new();
        for package in package_ids {
            let Some(node) = graph.node(&package) else {
                continue;
            };
            let Some(chosen) = node.chosen.clone() else {
                tasks.push((package, Err(InstallError::Unresolved { package: node.package.clone() })));
                continue;
            };
            let Some(source_url) = node.source_url.clone() else {
                tasks.push((package.clone(), Err(InstallError::MissingSourceUrl { package })));
                continue;
            };

            let cache = Arc::clone(&self.cache);
            let cancelled = Arc::clone(&self.cancelled);
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .expect("semaphore is never closed");
            let project_dir = project_dir.to_path_buf();
            let revision = chosen.to_string();
            let pkg_for_task = package.clone();

            let handle = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                if cancelled.load(Ordering::Relaxed) {
                    return (pkg_for_task, None);
                }
                let result = link_one(&cache, &project_dir, &pkg_for_task, &revision, &source_url);
                (pkg_for_task, Some(result))
            });
            tasks.push((package, Ok(handle)));
        }

        let mut report = InstallReport::default();
        for (package, outcome) in tasks {
            match outcome {
                Err(err) => {
                    if let Some(node) = graph.node_mut(&package) {
                        node.status = NodeStatus::Failed;
                    }
                    report.failures.push((package, err));
                }
                Ok(handle) => match handle.await {
                    Ok((pkg, Some(Ok(path)))) => {
                        if let Some(node) = graph.node_mut(&pkg) {
                            node.status = NodeStatus::Linked;
                        }
                        tracing::info!(package = %pkg, "linked");
                        report.linked.push(NodeOutcome { package: pkg, path });
                    }
                    Ok((pkg, Some(Err(err)))) => {
                        if let Some(node) = graph.node_mut(&pkg) {
                            node.status = NodeStatus::Failed;
                        }
                        tracing::warn!(package = %pkg, error = %err, "failed to link");
                        report.failures.push((pkg, err));
                    }
                    Ok((_pkg, None)) => {
                        // cancelled before starting; node stays in its prior state
                    }
                    Err(join_err) => {
                        tracing::warn!(error = %join_err, "installer worker task panicked");
                    }
                },
            }
        }

        report
    }
}

fn link_one(
    cache: &GlobalCache,
    project_dir: &Path,
    package: &PackageId,
    revision: &str,
    source_url: &str,
) -> Result<PathBuf, InstallError> {
    let entry_path = cache.acquire(package, revision, source_url)?;
    cache.link(project_dir, package, &entry_path)?;
    Ok(entry_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use paker_types::{ChosenVersion, Constraint};
    use tempfile::TempDir;

    fn local_repo(dir: &Path) {
        std::process::Command::new("git")
            .arg("init")
            .arg("-q")
            .arg(dir)
            .status()
            .unwrap();
        std::fs::write(dir.join("README.md"), b"hello").unwrap();
        std::process::Command::new("git")
            .args(["-C"])
            .arg(dir)
            .args(["add", "."])
            .status()
            .unwrap();
        std::process::Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(["-c", "user.email=a@b.c", "-c", "user.name=a", "commit", "-q", "-m", "init"])
            .status()
            .unwrap();
    }

    #[tokio::test]
    async fn missing_source_url_is_reported_as_failure_not_panic() {
        let tmp = TempDir::new().unwrap();
        let cache = GlobalCache::open_at(tmp.path().join("cache")).unwrap();
        let mut graph = Graph::new();
        let id = graph.upsert_node("fmt");
        graph.add_edge(None, &id, Constraint::Any).unwrap();
        {
            let node = graph.node_mut(&id).unwrap();
            node.chosen = Some(ChosenVersion::Tag("main".into()));
            node.status = NodeStatus::Resolved;
        }

        let installer = Installer::new(cache, 2);
        let project_dir = tmp.path().join("project");
        std::fs::create_dir_all(&project_dir).unwrap();
        let report = installer.install(&mut graph, &project_dir).await;

        assert!(!report.is_success());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(graph.node(&id).unwrap().status, NodeStatus::Failed);
    }

    #[tokio::test]
    async fn links_a_resolved_local_git_source() {
        let tmp = TempDir::new().unwrap();
        let source_dir = tmp.path().join("source");
        std::fs::create_dir_all(&source_dir).unwrap();
        local_repo(&source_dir);

        let cache = GlobalCache::open_at(tmp.path().join("cache")).unwrap();
        let mut graph = Graph::new();
        let id = graph.upsert_node("fmt");
        graph.add_edge(None, &id, Constraint::Any).unwrap();
        {
            let node = graph.node_mut(&id).unwrap();
            node.chosen = Some(ChosenVersion::Tag("main".into()));
            node.source_url = Some(source_dir.to_string_lossy().into_owned());
            node.status = NodeStatus::Resolved;
        }

        let installer = Installer::new(cache, 2);
        let project_dir = tmp.path().join("project");
        std::fs::create_dir_all(&project_dir).unwrap();
        let report = installer.install(&mut graph, &project_dir).await;

        assert!(report.is_success(), "failures: {:?}", report.failures);
        assert_eq!(report.linked.len(), 1);
        assert_eq!(graph.node(&id).unwrap().status, NodeStatus::Linked);
        assert!(project_dir.join(".paker/links/fmt").exists());
    }
}
