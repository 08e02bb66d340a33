//! First-fit-with-backtrack dependency resolution.
//!
//! The resolver is deliberately not a CDCL/PubGrub-style solver: it walks a
//! worklist in `(depth, package_id)` order, picks the greatest version that
//! satisfies the currently known constraints, and downgrades a subtree when
//! a later, tighter constraint invalidates an earlier choice.

use paker_graph::{Graph, GraphError};
use paker_types::{intersect, max_satisfying, satisfies, satisfies_tag, ChosenVersion, Constraint, Manifest, PackageId};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("package `{0}` has no known source url")]
    UnknownPackage(PackageId),

    #[error("no version of `{package}` satisfies `{constraint}`")]
    NoMatchingVersion {
        package: PackageId,
        constraint: String,
    },

    #[error("conflicting requirements on `{package}`: {}", format_conflicts(.conflicts))]
    ConflictSet {
        package: PackageId,
        conflicts: Vec<ConflictingRequirement>,
    },

    #[error("cycle detected: {}", .0.join(" -> "))]
    CycleDetected(Vec<PackageId>),

    #[error("oscillating resolution for `{0}`: same constraint set seen twice on backtrack")]
    UnresolvableConflict(PackageId),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

fn format_conflicts(conflicts: &[ConflictingRequirement]) -> String {
    conflicts
        .iter()
        .map(|c| format!("{} requires {}", c.parent.as_deref().unwrap_or("<root>"), c.constraint))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone)]
pub struct ConflictingRequirement {
    pub parent: Option<PackageId>,
    pub constraint: Constraint,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("network error fetching `{package}`: {message}")]
    NetworkError { package: PackageId, message: String },
    #[error("revision not found for `{package}`: {revision}")]
    RevisionNotFound { package: PackageId, revision: String },
}

/// Supplies the resolver with everything it needs beyond pure constraint
/// algebra: where a package lives, what revisions exist, and what a
/// revision's own manifest declares.
pub trait ResolutionProvider {
    fn source_url(&self, package: &str) -> Option<String>;

    /// Available semver versions, greatest-first not required (the resolver
    /// sorts).
    fn available_versions(&self, package: &str, source_url: &str) -> Result<Vec<semver::Version>, ProviderError>;

    /// The default branch/tag to use when no semantic version has been
    /// declared anywhere for this package.
    fn default_tag(&self, package: &str, source_url: &str) -> Result<String, ProviderError>;

    /// Raw (unparsed) dependency map of the child manifest for a chosen
    /// version. Parse failures are the provider's concern; an empty
    /// map here just means "no further dependencies".
    fn dependencies(
        &self,
        package: &str,
        chosen: &ChosenVersion,
        source_url: &str,
    ) -> Result<HashMap<PackageId, String>, ProviderError>;
}

struct PendingRequirement {
    package: PackageId,
    constraint: Constraint,
    parent: Option<PackageId>,
    depth: usize,
}

pub struct Resolver<'a, P: ResolutionProvider> {
    provider: &'a P,
}

impl<'a, P: ResolutionProvider> Resolver<'a, P> {
    pub fn new(provider: &'a P) -> Self {
        Self { provider }
    }

    pub fn resolve(&self, manifest: &Manifest) -> Result<Graph, ResolveError> {
        let mut graph = Graph::new();
        let mut worklist: Vec<PendingRequirement> = Vec::new();
        let mut seen_on_backtrack: HashSet<(PackageId, String)> = HashSet::new();

        let mut names: Vec<&String> = manifest.dependencies.keys().collect();
        names.sort();
        for name in names {
            let raw = &manifest.dependencies[name];
            let constraint = paker_types::parse_constraint(raw)
                .map_err(|_| ResolveError::NoMatchingVersion {
                    package: name.clone(),
                    constraint: raw.clone(),
                })?;
            worklist.push(PendingRequirement {
                package: name.clone(),
                constraint,
                parent: None,
                depth: 0,
            });
        }

        while !worklist.is_empty() {
            worklist.sort_by(|a, b| a.depth.cmp(&b.depth).then_with(|| a.package.cmp(&b.package)));
            let req = worklist.remove(0);

            if req.parent.as_deref() == Some(req.package.as_str()) {
                return Err(ResolveError::CycleDetected(vec![req.package.clone()]));
            }

            graph
                .add_edge(req.parent.as_deref(), &req.package, req.constraint.clone())
                .map_err(|e| match e {
                    GraphError::SelfDependency(p) => ResolveError::CycleDetected(vec![p]),
                    GraphError::CycleDetected(c) => ResolveError::CycleDetected(c),
                })?;

            if let Some(cycle) = graph.detect_cycle() {
                let compatible = self.back_edge_compatible(&graph, &req.package);
                if !compatible {
                    return Err(ResolveError::CycleDetected(cycle));
                }
            }

            let intersected = graph.intersected_constraint(&req.package);
            if intersected == Constraint::Empty {
                let conflicts = graph
                    .constraints_on(&req.package)
                    .into_iter()
                    .cloned()
                    .zip(graph.edges().iter().filter(|e| e.child == req.package).map(|e| e.parent.clone()))
                    .map(|(constraint, parent)| ConflictingRequirement { parent, constraint })
                    .collect();
                return Err(ResolveError::ConflictSet {
                    package: req.package.clone(),
                    conflicts,
                });
            }

            let source_url = self
                .provider
                .source_url(&req.package)
                .ok_or_else(|| ResolveError::UnknownPackage(req.package.clone()))?;

            let needs_choice = graph
                .node(&req.package)
                .map(|n| n.chosen.is_none())
                .unwrap_or(true);

            let previous_choice = graph.node(&req.package).and_then(|n| n.chosen.clone());

            if needs_choice || !self.still_valid(&previous_choice, &intersected) {
                let key = (req.package.clone(), intersected.to_string());
                if previous_choice.is_some() && !seen_on_backtrack.insert(key.clone()) {
                    return Err(ResolveError::UnresolvableConflict(req.package.clone()));
                }
                if previous_choice.is_some() {
                    // Downgrade: discard whatever this node previously brought
                    // in (its own subtree) but keep every parent's inbound
                    // requirement, not just the one that triggered this pass.
                    let inbound: Vec<(Option<PackageId>, Constraint)> = graph
                        .edges()
                        .iter()
                        .filter(|e| e.child == req.package)
                        .map(|e| (e.parent.clone(), e.constraint.clone()))
                        .collect();
                    graph.remove_node(&req.package);
                    for (parent, constraint) in inbound {
                        graph
                            .add_edge(parent.as_deref(), &req.package, constraint)
                            .map_err(|e| match e {
                                GraphError::SelfDependency(p) => ResolveError::CycleDetected(vec![p]),
                                GraphError::CycleDetected(c) => ResolveError::CycleDetected(c),
                            })?;
                    }
                }

                let chosen = self.choose_version(&req.package, &source_url, &intersected)?;
                if let Some(node) = graph.node_mut(&req.package) {
                    node.chosen = Some(chosen.clone());
                    node.source_url = Some(source_url.clone());
                    node.status = paker_graph::NodeStatus::Resolved;
                }

                let deps = self
                    .provider
                    .dependencies(&req.package, &chosen, &source_url)
                    .map_err(ResolveError::Provider)?;
                let mut child_names: Vec<&PackageId> = deps.keys().collect();
                child_names.sort();
                for child in child_names {
                    let raw = &deps[child];
                    let constraint = paker_types::parse_constraint(raw).unwrap_or(Constraint::Any);
                    worklist.push(PendingRequirement {
                        package: child.clone(),
                        constraint,
                        parent: Some(req.package.clone()),
                        depth: req.depth + 1,
                    });
                }
            }
        }

        Ok(graph)
    }

    fn back_edge_compatible(&self, graph: &Graph, pkg: &str) -> bool {
        match graph.node(pkg).and_then(|n| n.chosen.clone()) {
            None => true,
            Some(chosen) => self.still_valid(&Some(chosen), &graph.intersected_constraint(pkg)),
        }
    }

    fn still_valid(&self, chosen: &Option<ChosenVersion>, constraint: &Constraint) -> bool {
        match chosen {
            None => false,
            Some(ChosenVersion::Semver(v)) => satisfies(v, constraint),
            Some(ChosenVersion::Tag(t)) => satisfies_tag(t, constraint),
        }
    }

    fn choose_version(
        &self,
        package: &str,
        source_url: &str,
        constraint: &Constraint,
    ) -> Result<ChosenVersion, ResolveError> {
        if let Constraint::Tag(t) = constraint {
            return Ok(ChosenVersion::Tag(t.clone()));
        }
        let versions = self
            .provider
            .available_versions(package, source_url)
            .map_err(ResolveError::Provider)?;
        if let Some(v) = max_satisfying(&versions, constraint) {
            return Ok(ChosenVersion::Semver(v));
        }
        if versions.is_empty() {
            let tag = self
                .provider
                .default_tag(package, source_url)
                .map_err(ResolveError::Provider)?;
            return Ok(ChosenVersion::Tag(tag));
        }
        Err(ResolveError::NoMatchingVersion {
            package: package.to_string(),
            constraint: constraint.to_string(),
        })
    }
}

/// Loosen a single top-level requirement in `manifest` to `*`, or every
/// requirement if `package` is `None`. Grounded on the original
/// implementation's `pm_upgrade()` (remove-then-add-with-no-version).
pub fn loosen_for_upgrade(manifest: &mut Manifest, package: Option<&str>) {
    match package {
        Some(pkg) => {
            if let Some(v) = manifest.dependencies.get_mut(pkg) {
                *v = "*".to_string();
            }
        }
        None => {
            for v in manifest.dependencies.values_mut() {
                *v = "*".to_string();
            }
        }
    }
}

/// A simple in-memory provider for tests: no network, no filesystem.
#[derive(Default)]
pub struct MemoryProvider {
    sources: HashMap<PackageId, String>,
    versions: HashMap<PackageId, Vec<semver::Version>>,
    deps: HashMap<(PackageId, String), HashMap<PackageId, String>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_source(&mut self, package: &str, url: &str) -> &mut Self {
        self.sources.insert(package.to_string(), url.to_string());
        self
    }

    pub fn add_version(
        &mut self,
        package: &str,
        version: semver::Version,
        deps: HashMap<PackageId, String>,
    ) -> &mut Self {
        self.versions
            .entry(package.to_string())
            .or_default()
            .push(version.clone());
        self.deps.insert((package.to_string(), version.to_string()), deps);
        self
    }
}

impl ResolutionProvider for MemoryProvider {
    fn source_url(&self, package: &str) -> Option<String> {
        self.sources.get(package).cloned()
    }

    fn available_versions(&self, package: &str, _source_url: &str) -> Result<Vec<semver::Version>, ProviderError> {
        Ok(self.versions.get(package).cloned().unwrap_or_default())
    }

    fn default_tag(&self, _package: &str, _source_url: &str) -> Result<String, ProviderError> {
        Ok("main".to_string())
    }

    fn dependencies(
        &self,
        package: &str,
        chosen: &ChosenVersion,
        _source_url: &str,
    ) -> Result<HashMap<PackageId, String>, ProviderError> {
        Ok(self
            .deps
            .get(&(package.to_string(), chosen.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest_with(deps: &[(&str, &str)]) -> Manifest {
        let mut m = Manifest::default();
        for (k, v) in deps {
            m.dependencies.insert(k.to_string(), v.to_string());
        }
        m
    }

    #[test]
    fn resolves_single_package() {
        let mut provider = MemoryProvider::new();
        provider.add_source("fmt", "https://example.test/fmt.git");
        provider.add_version("fmt", semver::Version::new(10, 0, 0), HashMap::new());

        let resolver = Resolver::new(&provider);
        let manifest = manifest_with(&[("fmt", "=10.0.0")]);
        let graph = resolver.resolve(&manifest).unwrap();

        let node = graph.node("fmt").unwrap();
        assert_eq!(node.chosen, Some(ChosenVersion::Semver(semver::Version::new(10, 0, 0))));
    }

    #[test]
    fn resolves_transitive_dependency() {
        let mut provider = MemoryProvider::new();
        provider.add_source("a", "https://example.test/a.git");
        provider.add_source("b", "https://example.test/b.git");
        let mut a_deps = HashMap::new();
        a_deps.insert("b".to_string(), "^2.0.0".to_string());
        provider.add_version("a", semver::Version::new(1, 2, 0), a_deps);
        provider.add_version("b", semver::Version::new(2, 3, 0), HashMap::new());

        let resolver = Resolver::new(&provider);
        let manifest = manifest_with(&[("a", "^1.0.0")]);
        let graph = resolver.resolve(&manifest).unwrap();

        assert!(graph.node("a").is_some());
        assert_eq!(
            graph.node("b").unwrap().chosen,
            Some(ChosenVersion::Semver(semver::Version::new(2, 3, 0)))
        );
    }

    #[test]
    fn conflicting_transitive_requirements_produce_conflict_set() {
        let mut provider = MemoryProvider::new();
        provider.add_source("a", "https://example.test/a.git");
        provider.add_source("c", "https://example.test/c.git");
        provider.add_source("b", "https://example.test/b.git");
        let mut a_deps = HashMap::new();
        a_deps.insert("b".to_string(), "^2.0.0".to_string());
        provider.add_version("a", semver::Version::new(1, 0, 0), a_deps);
        let mut c_deps = HashMap::new();
        c_deps.insert("b".to_string(), "^3.0.0".to_string());
        provider.add_version("c", semver::Version::new(1, 0, 0), c_deps);
        provider.add_version("b", semver::Version::new(2, 0, 0), HashMap::new());
        provider.add_version("b", semver::Version::new(3, 0, 0), HashMap::new());

        let resolver = Resolver::new(&provider);
        let manifest = manifest_with(&[("a", "^1.0.0"), ("c", "^1.0.0")]);
        let err = resolver.resolve(&manifest).unwrap_err();
        assert!(matches!(err, ResolveError::ConflictSet { package, .. } if package == "b"));
    }

    #[test]
    fn unknown_package_fails_before_any_fetch() {
        let provider = MemoryProvider::new();
        let resolver = Resolver::new(&provider);
        let manifest = manifest_with(&[("nope", "*")]);
        let err = resolver.resolve(&manifest).unwrap_err();
        assert!(matches!(err, ResolveError::UnknownPackage(p) if p == "nope"));
    }

    #[test]
    fn loosen_for_upgrade_targets_named_package_only() {
        let mut m = manifest_with(&[("a", "^1.0.0"), ("b", "^2.0.0")]);
        loosen_for_upgrade(&mut m, Some("a"));
        assert_eq!(m.dependencies["a"], "*");
        assert_eq!(m.dependencies["b"], "^2.0.0");
    }

    #[test]
    fn loosen_for_upgrade_with_no_package_loosens_all() {
        let mut m = manifest_with(&[("a", "^1.0.0"), ("b", "^2.0.0")]);
        loosen_for_upgrade(&mut m, None);
        assert_eq!(m.dependencies["a"], "*");
        assert_eq!(m.dependencies["b"], "*");
    }
}
