//! Lockfile protocol: a canonical, byte-stable record of a resolved
//! graph, with replay-into-graph and diff support.
//!
//! `gust-lockfile`'s own source never survived retrieval (only its
//! `Cargo.toml` did); its contract is reconstructed here from its caller
//! (`gust/src/install.rs`'s `Lockfile::load`/`needs_update`/`merge`), but
//! storage switches to a `BTreeMap` keyed by package id, so serde's derived
//! `Serialize` produces the sorted-key canonical form for free.

use paker_graph::{Graph, NodeStatus};
use paker_types::{satisfies, satisfies_tag, ChosenVersion, Constraint, PackageId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

pub const CURRENT_FORMAT: u32 = 1;

#[derive(Debug, Error)]
pub enum LockfileError {
    #[error("io error at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed lockfile at {path}: {source}")]
    ParseError {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("lockfile format version {found} is not supported (expected {expected})")]
    UnsupportedFormat { found: u32, expected: u32 },
    #[error("lockfile disagrees with the current manifest for `{package}`: locked {locked}, required {required}")]
    StaleLockfile {
        package: PackageId,
        locked: String,
        required: String,
    },
}

/// One locked package. `version` and `revision` are deliberately distinct
/// fields: `revision` is always the fetcher's
/// concrete answer; `version` is the semver when one was resolved, and
/// otherwise mirrors `revision`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedEntry {
    pub version: String,
    pub revision: String,
    pub source: String,
    pub digest: Option<String>,
    pub parents: Vec<PackageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lockfile {
    pub format: u32,
    pub dependencies: BTreeMap<PackageId, LockedEntry>,
}

impl Default for Lockfile {
    fn default() -> Self {
        Self {
            format: CURRENT_FORMAT,
            dependencies: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Added(PackageId),
    Removed(PackageId),
    Upgraded {
        package: PackageId,
        from: String,
        to: String,
    },
    Downgraded {
        package: PackageId,
        from: String,
        to: String,
    },
}

impl Lockfile {
    /// Build a lockfile from a fully resolved graph. `digests` supplies the
    /// content digest for packages that have already been fetched (lock
    /// without install may leave some entries without one).
    pub fn from_graph(graph: &Graph, digests: &BTreeMap<PackageId, String>) -> Self {
        let mut dependencies = BTreeMap::new();
        for node in graph.nodes() {
            let Some(chosen) = &node.chosen else { continue };
            let Some(source_url) = &node.source_url else { continue };
            let revision = chosen.to_string();
            let version = match chosen {
                ChosenVersion::Semver(v) => v.to_string(),
                ChosenVersion::Tag(t) => t.clone(),
            };
            let parents = graph
                .edges()
                .iter()
                .filter(|e| e.child == node.package)
                .filter_map(|e| e.parent.clone())
                .collect();
            dependencies.insert(
                node.package.clone(),
                LockedEntry {
                    version,
                    revision,
                    source: source_url.clone(),
                    digest: digests.get(&node.package).cloned(),
                    parents,
                },
            );
        }
        Self {
            format: CURRENT_FORMAT,
            dependencies,
        }
    }

    pub fn write(&self, path: &Path) -> Result<(), LockfileError> {
        let content = serde_json::to_string_pretty(self).expect("Lockfile always serializes");
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        let tmp = parent.join(format!(
            ".{}.tmp",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("lockfile")
        ));
        fs::write(&tmp, &content).map_err(|e| LockfileError::Io {
            path: tmp.clone(),
            source: e,
        })?;
        fs::rename(&tmp, path).map_err(|e| LockfileError::Io {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn read(path: &Path) -> Result<Self, LockfileError> {
        let content = fs::read_to_string(path).map_err(|e| LockfileError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let lockfile: Lockfile = serde_json::from_str(&content).map_err(|e| LockfileError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        if lockfile.format != CURRENT_FORMAT {
            return Err(LockfileError::UnsupportedFormat {
                found: lockfile.format,
                expected: CURRENT_FORMAT,
            });
        }
        Ok(lockfile)
    }

    /// Build a graph with every locked entry already `resolved`. No
    /// resolution is performed; each top-level constraint declared in
    /// `top_level` is checked against the locked version/tag, and the first
    /// mismatch is reported as `StaleLockfile`.
    pub fn replay(
        &self,
        top_level: &BTreeMap<PackageId, Constraint>,
    ) -> Result<Graph, LockfileError> {
        for (package, constraint) in top_level {
            let Some(entry) = self.dependencies.get(package) else {
                return Err(LockfileError::StaleLockfile {
                    package: package.clone(),
                    locked: "<absent>".to_string(),
                    required: constraint.to_string(),
                });
            };
            let satisfied = match semver::Version::parse(&entry.version) {
                Ok(v) => satisfies(&v, constraint),
                Err(_) => satisfies_tag(&entry.version, constraint),
            };
            if !satisfied {
                return Err(LockfileError::StaleLockfile {
                    package: package.clone(),
                    locked: entry.version.clone(),
                    required: constraint.to_string(),
                });
            }
        }

        let mut graph = Graph::new();
        for (package, entry) in &self.dependencies {
            graph.upsert_node(package);
            for parent in &entry.parents {
                let _ = graph.add_edge(Some(parent), package, Constraint::Any);
            }
            if entry.parents.is_empty() {
                let _ = graph.add_edge(None, package, Constraint::Any);
            }
            let node = graph.node_mut(package).expect("just upserted");
            node.chosen = Some(
                semver::Version::parse(&entry.version)
                    .map(ChosenVersion::Semver)
                    .unwrap_or_else(|_| ChosenVersion::Tag(entry.version.clone())),
            );
            node.source_url = Some(entry.source.clone());
            node.status = NodeStatus::Resolved;
        }
        Ok(graph)
    }

    /// Classify every entry as added/removed/upgraded/downgraded between two
    /// lockfiles.
    pub fn diff(old: &Lockfile, new: &Lockfile) -> Vec<Change> {
        let mut changes = Vec::new();
        for (package, new_entry) in &new.dependencies {
            match old.dependencies.get(package) {
                None => changes.push(Change::Added(package.clone())),
                Some(old_entry) if old_entry.version != new_entry.version => {
                    let is_upgrade = match (
                        semver::Version::parse(&old_entry.version),
                        semver::Version::parse(&new_entry.version),
                    ) {
                        (Ok(a), Ok(b)) => b > a,
                        _ => new_entry.version > old_entry.version,
                    };
                    if is_upgrade {
                        changes.push(Change::Upgraded {
                            package: package.clone(),
                            from: old_entry.version.clone(),
                            to: new_entry.version.clone(),
                        });
                    } else {
                        changes.push(Change::Downgraded {
                            package: package.clone(),
                            from: old_entry.version.clone(),
                            to: new_entry.version.clone(),
                        });
                    }
                }
                Some(_) => {}
            }
        }
        for package in old.dependencies.keys() {
            if !new.dependencies.contains_key(package) {
                changes.push(Change::Removed(package.clone()));
            }
        }
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paker_types::parse_constraint;
    use tempfile::TempDir;

    fn sample_lockfile() -> Lockfile {
        let mut dependencies = BTreeMap::new();
        dependencies.insert(
            "fmt".to_string(),
            LockedEntry {
                version: "10.0.0".to_string(),
                revision: "10.0.0".to_string(),
                source: "https://github.com/fmtlib/fmt.git".to_string(),
                digest: Some("abc123".to_string()),
                parents: vec![],
            },
        );
        Lockfile {
            format: CURRENT_FORMAT,
            dependencies,
        }
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Paker.lock");
        let lockfile = sample_lockfile();
        lockfile.write(&path).unwrap();
        let loaded = Lockfile::read(&path).unwrap();
        assert_eq!(loaded.dependencies["fmt"].version, "10.0.0");
    }

    #[test]
    fn write_produces_sorted_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Paker.lock");
        let mut lockfile = sample_lockfile();
        lockfile.dependencies.insert(
            "catch2".to_string(),
            LockedEntry {
                version: "3.0.0".to_string(),
                revision: "3.0.0".to_string(),
                source: "https://github.com/catchorg/Catch2.git".to_string(),
                digest: None,
                parents: vec![],
            },
        );
        lockfile.write(&path).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        let catch_pos = content.find("catch2").unwrap();
        let fmt_pos = content.find("fmt").unwrap();
        assert!(catch_pos < fmt_pos);
    }

    #[test]
    fn replay_builds_resolved_graph_without_fetching() {
        let lockfile = sample_lockfile();
        let mut top_level = BTreeMap::new();
        top_level.insert("fmt".to_string(), parse_constraint("^10.0.0").unwrap());
        let graph = lockfile.replay(&top_level).unwrap();
        let node = graph.node("fmt").unwrap();
        assert_eq!(node.status, NodeStatus::Resolved);
        assert!(node.chosen.is_some());
    }

    #[test]
    fn replay_detects_stale_lockfile() {
        let lockfile = sample_lockfile();
        let mut top_level = BTreeMap::new();
        top_level.insert("fmt".to_string(), parse_constraint("^11.0.0").unwrap());
        let err = lockfile.replay(&top_level).unwrap_err();
        assert!(matches!(err, LockfileError::StaleLockfile { .. }));
    }

    #[test]
    fn diff_classifies_added_removed_and_upgraded() {
        let old = sample_lockfile();
        let mut new = sample_lockfile();
        new.dependencies.get_mut("fmt").unwrap().version = "11.0.0".to_string();
        new.dependencies.get_mut("fmt").unwrap().revision = "11.0.0".to_string();
        new.dependencies.insert(
            "spdlog".to_string(),
            LockedEntry {
                version: "1.12.0".to_string(),
                revision: "1.12.0".to_string(),
                source: "https://github.com/gabime/spdlog.git".to_string(),
                digest: None,
                parents: vec![],
            },
        );

        let changes = Lockfile::diff(&old, &new);
        assert!(changes.contains(&Change::Added("spdlog".to_string())));
        assert!(changes.contains(&Change::Upgraded {
            package: "fmt".to_string(),
            from: "10.0.0".to_string(),
            to: "11.0.0".to_string(),
        }));
    }
}
