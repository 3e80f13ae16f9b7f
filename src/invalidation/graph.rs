//! Dependency graph over cache namespaces.
//!
//! Edges are stored in both directions: `dependencies` (what a node is built
//! from) and `dependents` (what must be invalidated when the node changes).
//! The graph is meant to be acyclic, but traversal never relies on it.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::RwLock;

use serde::Deserialize;
use time::OffsetDateTime;
use tracing::debug;

use crate::lock::{rw_read, rw_write};

const SOURCE: &str = "invalidation::graph";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    #[default]
    Content,
    Schema,
    Component,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DependencyNode {
    pub id: String,
    pub node_type: NodeType,
    pub version: Option<String>,
    pub dependents: HashSet<String>,
    pub dependencies: HashSet<String>,
    pub last_invalidated_at: Option<OffsetDateTime>,
}

impl DependencyNode {
    fn new(id: &str, node_type: NodeType) -> Self {
        Self {
            id: id.to_string(),
            node_type,
            version: None,
            dependents: HashSet::new(),
            dependencies: HashSet::new(),
            last_invalidated_at: None,
        }
    }
}

/// Result of a bounded breadth-first walk along dependents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Traversal {
    /// Discovered dependents with their hop distance, in BFS order.
    pub dependents: Vec<(String, usize)>,
    /// Edges that led back to an already visited node.
    pub cycles_tolerated: usize,
}

#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: RwLock<HashMap<String, DependencyNode>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `node` depends on `depends_on`. Missing nodes are created with
    /// `node_type`. Returns false if the edge already existed.
    pub fn add_dependency(&self, node: &str, depends_on: &str, node_type: NodeType) -> bool {
        let mut nodes = rw_write(&self.nodes, SOURCE, "add_dependency");
        let added = nodes
            .entry(node.to_string())
            .or_insert_with(|| DependencyNode::new(node, node_type))
            .dependencies
            .insert(depends_on.to_string());
        nodes
            .entry(depends_on.to_string())
            .or_insert_with(|| DependencyNode::new(depends_on, node_type))
            .dependents
            .insert(node.to_string());
        added
    }

    /// Remove one edge. Nodes stay registered. Returns false if there was no such edge.
    pub fn remove_dependency(&self, node: &str, depends_on: &str) -> bool {
        let mut nodes = rw_write(&self.nodes, SOURCE, "remove_dependency");
        let removed = nodes
            .get_mut(node)
            .is_some_and(|entry| entry.dependencies.remove(depends_on));
        if let Some(entry) = nodes.get_mut(depends_on) {
            entry.dependents.remove(node);
        }
        removed
    }

    /// Remove a node and every edge touching it.
    pub fn remove_node(&self, id: &str) -> bool {
        let mut nodes = rw_write(&self.nodes, SOURCE, "remove_node");
        let Some(removed) = nodes.remove(id) else {
            return false;
        };
        for dependency in &removed.dependencies {
            if let Some(entry) = nodes.get_mut(dependency) {
                entry.dependents.remove(id);
            }
        }
        for dependent in &removed.dependents {
            if let Some(entry) = nodes.get_mut(dependent) {
                entry.dependencies.remove(id);
            }
        }
        true
    }

    pub fn node(&self, id: &str) -> Option<DependencyNode> {
        rw_read(&self.nodes, SOURCE, "node").get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        rw_read(&self.nodes, SOURCE, "contains").contains_key(id)
    }

    /// Walk dependents breadth-first from every id in `starts`, at most `max_depth` hops.
    ///
    /// A node reached twice is reported once; the repeat edge is counted in
    /// `cycles_tolerated` and not expanded.
    pub fn dependents_within(&self, starts: &[String], max_depth: usize) -> Traversal {
        let nodes = rw_read(&self.nodes, SOURCE, "dependents_within");
        let mut traversal = Traversal::default();
        let mut visited: HashSet<&str> = starts.iter().map(String::as_str).collect();
        let mut frontier: VecDeque<(&str, usize)> =
            starts.iter().map(|id| (id.as_str(), 0)).collect();

        while let Some((id, depth)) = frontier.pop_front() {
            if depth >= max_depth {
                continue;
            }
            let Some(node) = nodes.get(id) else {
                continue;
            };
            // Sorted so traversal order does not depend on hash seeds.
            let dependents: BTreeSet<&str> = node.dependents.iter().map(String::as_str).collect();
            for dependent in dependents {
                if !visited.insert(dependent) {
                    traversal.cycles_tolerated += 1;
                    debug!(
                        from = id,
                        to = dependent,
                        depth,
                        "Dependency already visited, cycle tolerated"
                    );
                    continue;
                }
                traversal.dependents.push((dependent.to_string(), depth + 1));
                frontier.push_back((dependent, depth + 1));
            }
        }

        traversal
    }

    /// Stamp `last_invalidated_at` (and `version` when given) on a known node.
    pub fn mark_invalidated(&self, id: &str, at: OffsetDateTime, version: Option<&str>) -> bool {
        let mut nodes = rw_write(&self.nodes, SOURCE, "mark_invalidated");
        match nodes.get_mut(id) {
            Some(node) => {
                node.last_invalidated_at = Some(at);
                if let Some(version) = version {
                    node.version = Some(version.to_string());
                }
                true
            }
            None => false,
        }
    }

    pub fn node_count(&self) -> usize {
        rw_read(&self.nodes, SOURCE, "node_count").len()
    }

    pub fn edge_count(&self) -> usize {
        rw_read(&self.nodes, SOURCE, "edge_count")
            .values()
            .map(|node| node.dependencies.len())
            .sum()
    }

    pub fn clear(&self) {
        rw_write(&self.nodes, SOURCE, "clear").clear();
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    fn ids(traversal: &Traversal) -> Vec<&str> {
        traversal
            .dependents
            .iter()
            .map(|(id, _)| id.as_str())
            .collect()
    }

    #[test]
    fn add_dependency_is_idempotent_and_creates_nodes() {
        let graph = DependencyGraph::new();
        assert!(graph.add_dependency("page:home", "content:hero", NodeType::Content));
        assert!(!graph.add_dependency("page:home", "content:hero", NodeType::Content));

        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.edge_count(), 1);
        let hero = graph.node("content:hero").expect("auto-created");
        assert!(hero.dependents.contains("page:home"));
    }

    #[test]
    fn remove_dependency_keeps_nodes() {
        let graph = DependencyGraph::new();
        graph.add_dependency("a", "b", NodeType::Content);
        assert!(graph.remove_dependency("a", "b"));
        assert!(!graph.remove_dependency("a", "b"));
        assert_eq!(graph.node_count(), 2);
        assert!(graph.node("b").expect("kept").dependents.is_empty());
    }

    #[test]
    fn remove_node_drops_edges_on_both_sides() {
        let graph = DependencyGraph::new();
        graph.add_dependency("a", "b", NodeType::Content);
        graph.add_dependency("b", "c", NodeType::Content);
        assert!(graph.remove_node("b"));
        assert!(!graph.contains("b"));
        assert!(graph.node("a").expect("a").dependencies.is_empty());
        assert!(graph.node("c").expect("c").dependents.is_empty());
    }

    #[test]
    fn traversal_respects_max_depth() {
        let graph = DependencyGraph::new();
        graph.add_dependency("l1", "root", NodeType::Component);
        graph.add_dependency("l2", "l1", NodeType::Component);
        graph.add_dependency("l3", "l2", NodeType::Component);

        let traversal = graph.dependents_within(&["root".to_string()], 2);
        assert_eq!(ids(&traversal), vec!["l1", "l2"]);
        assert_eq!(traversal.dependents[1].1, 2);
    }

    #[test]
    fn two_node_cycle_is_tolerated() {
        let graph = DependencyGraph::new();
        graph.add_dependency("a", "b", NodeType::Content);
        graph.add_dependency("b", "a", NodeType::Content);

        let traversal = graph.dependents_within(&["a".to_string()], 10);
        assert_eq!(ids(&traversal), vec!["b"]);
        assert_eq!(traversal.cycles_tolerated, 1);
    }

    #[test]
    fn shared_dependents_are_reported_once() {
        let graph = DependencyGraph::new();
        graph.add_dependency("page", "hero", NodeType::Content);
        graph.add_dependency("page", "footer", NodeType::Content);

        let traversal =
            graph.dependents_within(&["hero".to_string(), "footer".to_string()], 3);
        assert_eq!(ids(&traversal), vec!["page"]);
    }

    #[test]
    fn mark_invalidated_stamps_known_nodes_only() {
        let graph = DependencyGraph::new();
        graph.add_dependency("a", "b", NodeType::Schema);
        let at = datetime!(2024-05-01 10:00 UTC);
        assert!(graph.mark_invalidated("b", at, Some("7")));
        assert!(!graph.mark_invalidated("zzz", at, None));

        let node = graph.node("b").expect("b");
        assert_eq!(node.last_invalidated_at, Some(at));
        assert_eq!(node.version.as_deref(), Some("7"));
        assert_eq!(node.node_type, NodeType::Schema);
    }
}
