//! In-memory dependency graph: nodes, edges, and cycle/conflict analysis.
//!
//! The graph never fetches or resolves anything; it only stores structure
//! and answers questions about it.

use paker_types::{intersect, Constraint, PackageId};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Declared,
    Resolved,
    Fetched,
    Linked,
    Conflict,
    Failed,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub package: PackageId,
    pub chosen: Option<paker_types::ChosenVersion>,
    pub source_url: Option<String>,
    pub status: NodeStatus,
}

impl Node {
    fn new(package: PackageId) -> Self {
        Self {
            package,
            chosen: None,
            source_url: None,
            status: NodeStatus::Declared,
        }
    }
}

/// Directed `parent -> child` edge. `parent == None` means the edge
/// originates at the virtual root (a top-level requirement).
#[derive(Debug, Clone)]
pub struct Edge {
    pub parent: Option<PackageId>,
    pub child: PackageId,
    pub constraint: Constraint,
}

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("package `{0}` cannot depend on itself")]
    SelfDependency(PackageId),
    #[error("cycle detected: {}", .0.join(" -> "))]
    CycleDetected(Vec<PackageId>),
}

/// A package whose inbound constraints have empty intersection.
#[derive(Debug, Clone)]
pub struct ConflictReport {
    pub package: PackageId,
    pub edges: Vec<Edge>,
}

#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: HashMap<PackageId, Node>,
    edges: Vec<Edge>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotently ensure a node exists for `pkg`, returning its id.
    pub fn upsert_node(&mut self, pkg: &str) -> PackageId {
        self.nodes
            .entry(pkg.to_string())
            .or_insert_with(|| Node::new(pkg.to_string()));
        pkg.to_string()
    }

    pub fn node(&self, pkg: &str) -> Option<&Node> {
        self.nodes.get(pkg)
    }

    pub fn node_mut(&mut self, pkg: &str) -> Option<&mut Node> {
        self.nodes.get_mut(pkg)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Add an edge `parent -> child`. `parent = None` denotes the virtual
    /// root. Fails with `SelfDependency` if `parent == Some(child)`.
    pub fn add_edge(
        &mut self,
        parent: Option<&str>,
        child: &str,
        constraint: Constraint,
    ) -> Result<(), GraphError> {
        if parent == Some(child) {
            return Err(GraphError::SelfDependency(child.to_string()));
        }
        self.upsert_node(child);
        if let Some(p) = parent {
            self.upsert_node(p);
        }
        self.edges.push(Edge {
            parent: parent.map(|s| s.to_string()),
            child: child.to_string(),
            constraint,
        });
        Ok(())
    }

    /// Remove a node and every edge touching it. Used by the resolver's
    /// backtrack/downgrade step to discard a subtree.
    pub fn remove_node(&mut self, pkg: &str) {
        self.nodes.remove(pkg);
        self.edges
            .retain(|e| e.child != pkg && e.parent.as_deref() != Some(pkg));
    }

    /// All inbound edge constraints for `pkg`, in edge-insertion order.
    pub fn constraints_on(&self, pkg: &str) -> Vec<&Constraint> {
        self.edges
            .iter()
            .filter(|e| e.child == pkg)
            .map(|e| &e.constraint)
            .collect()
    }

    /// Intersection of all inbound constraints for `pkg`. `Constraint::Any`
    /// if `pkg` has no inbound edges at all.
    pub fn intersected_constraint(&self, pkg: &str) -> Constraint {
        self.constraints_on(pkg)
            .into_iter()
            .cloned()
            .fold(Constraint::Any, |acc, c| intersect(&acc, &c))
    }

    fn children_of(&self, pkg: &str) -> Vec<&str> {
        let mut out: Vec<&str> = self
            .edges
            .iter()
            .filter(|e| e.parent.as_deref() == Some(pkg))
            .map(|e| e.child.as_str())
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    /// DFS with three-coloring; returns a cycle witness (package ids, first
    /// repeated at the end) if one exists.
    pub fn detect_cycle(&self) -> Option<Vec<PackageId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }
        let mut color: HashMap<&str, Color> = self
            .nodes
            .keys()
            .map(|k| (k.as_str(), Color::White))
            .collect();
        let mut stack: Vec<PackageId> = Vec::new();

        fn visit<'a>(
            g: &'a Graph,
            pkg: &'a str,
            color: &mut HashMap<&'a str, Color>,
            stack: &mut Vec<PackageId>,
        ) -> Option<Vec<PackageId>> {
            color.insert(pkg, Color::Gray);
            stack.push(pkg.to_string());
            for child in g.children_of(pkg) {
                match color.get(child).copied().unwrap_or(Color::White) {
                    Color::White => {
                        if let Some(cycle) = visit(g, child, color, stack) {
                            return Some(cycle);
                        }
                    }
                    Color::Gray => {
                        let start = stack.iter().position(|p| p == child).unwrap();
                        let mut cycle = stack[start..].to_vec();
                        cycle.push(child.to_string());
                        return Some(cycle);
                    }
                    Color::Black => {}
                }
            }
            stack.pop();
            color.insert(pkg, Color::Black);
            None
        }

        let mut roots: Vec<&str> = self.nodes.keys().map(|s| s.as_str()).collect();
        roots.sort_unstable();
        for pkg in roots {
            if color.get(pkg).copied().unwrap_or(Color::White) == Color::White {
                if let Some(cycle) = visit(self, pkg, &mut color, &mut stack) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    /// Deterministic topological order, tie-broken by package id. Errors if
    /// the graph is cyclic.
    pub fn topological_order(&self) -> Result<Vec<PackageId>, GraphError> {
        if let Some(cycle) = self.detect_cycle() {
            return Err(GraphError::CycleDetected(cycle));
        }
        let mut indegree: HashMap<&str, usize> = self
            .nodes
            .keys()
            .map(|k| (k.as_str(), 0usize))
            .collect();
        for e in &self.edges {
            if let Some(d) = indegree.get_mut(e.child.as_str()) {
                *d += 1;
            }
        }
        let mut ready: Vec<&str> = indegree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(k, _)| *k)
            .collect();
        ready.sort_unstable();

        let mut order = Vec::with_capacity(self.nodes.len());
        let mut seen: HashSet<&str> = HashSet::new();
        while let Some(pkg) = ready.first().copied() {
            ready.remove(0);
            if !seen.insert(pkg) {
                continue;
            }
            order.push(pkg.to_string());
            let mut newly_ready = Vec::new();
            for child in self.children_of(pkg) {
                if let Some(d) = indegree.get_mut(child) {
                    *d -= 1;
                    if *d == 0 {
                        newly_ready.push(child);
                    }
                }
            }
            ready.extend(newly_ready);
            ready.sort_unstable();
            ready.dedup();
        }
        Ok(order)
    }

    /// One report per package whose inbound constraints have empty
    /// intersection.
    pub fn diagnose_conflicts(&self) -> Vec<ConflictReport> {
        let mut packages: Vec<&str> = self.nodes.keys().map(|s| s.as_str()).collect();
        packages.sort_unstable();
        packages
            .into_iter()
            .filter_map(|pkg| {
                if self.intersected_constraint(pkg) == Constraint::Empty {
                    let edges = self
                        .edges
                        .iter()
                        .filter(|e| e.child == pkg)
                        .cloned()
                        .collect();
                    Some(ConflictReport {
                        package: pkg.to_string(),
                        edges,
                    })
                } else {
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paker_types::parse_constraint;

    #[test]
    fn upsert_node_is_idempotent() {
        let mut g = Graph::new();
        g.upsert_node("fmt");
        g.upsert_node("fmt");
        assert_eq!(g.nodes().count(), 1);
    }

    #[test]
    fn self_dependency_is_rejected() {
        let mut g = Graph::new();
        let err = g
            .add_edge(Some("a"), "a", parse_constraint("*").unwrap())
            .unwrap_err();
        assert!(matches!(err, GraphError::SelfDependency(p) if p == "a"));
    }

    #[test]
    fn detects_cycle() {
        let mut g = Graph::new();
        g.add_edge(Some("a"), "b", parse_constraint("*").unwrap()).unwrap();
        g.add_edge(Some("b"), "a", parse_constraint("*").unwrap()).unwrap();
        assert!(g.detect_cycle().is_some());
    }

    #[test]
    fn acyclic_graph_has_no_cycle() {
        let mut g = Graph::new();
        g.add_edge(None, "a", parse_constraint("*").unwrap()).unwrap();
        g.add_edge(Some("a"), "b", parse_constraint("*").unwrap()).unwrap();
        assert!(g.detect_cycle().is_none());
        let order = g.topological_order().unwrap();
        assert_eq!(order, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn conflicting_constraints_are_diagnosed() {
        let mut g = Graph::new();
        g.add_edge(Some("a"), "b", parse_constraint("^1.0.0").unwrap()).unwrap();
        g.add_edge(Some("c"), "b", parse_constraint("^2.0.0").unwrap()).unwrap();
        let conflicts = g.diagnose_conflicts();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].package, "b");
        assert_eq!(conflicts[0].edges.len(), 2);
    }

    #[test]
    fn remove_node_drops_its_edges() {
        let mut g = Graph::new();
        g.add_edge(Some("a"), "b", parse_constraint("*").unwrap()).unwrap();
        g.remove_node("b");
        assert!(g.node("b").is_none());
        assert!(g.edges().is_empty());
    }
}
