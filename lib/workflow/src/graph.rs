//! Workflow graph: node arena plus edges.
//!
//! Nodes live in an insertion-ordered arena keyed by id; edges are id
//! pairs with an optional label (condition branches select by label).
//! Loop and parallel bodies reference arena nodes by id, so cycles are
//! ordinary data. petgraph is used for structural validation only.

use crate::error::GraphError;
use crate::node::{Node, NodeId, NodeKind};
use indexmap::IndexMap;
use petgraph::graph::DiGraph;
use petgraph::visit::{Dfs, NodeIndexable};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A directed edge between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// Source node.
    pub from: NodeId,
    /// Target node.
    pub to: NodeId,
    /// Branch label; `None` for the plain sequential edge.
    pub label: Option<String>,
}

impl Edge {
    /// Creates an unlabeled edge.
    #[must_use]
    pub fn new(from: NodeId, to: NodeId) -> Self {
        Self {
            from,
            to,
            label: None,
        }
    }

    /// Creates a labeled edge (condition branch).
    #[must_use]
    pub fn labeled(from: NodeId, to: NodeId, label: impl Into<String>) -> Self {
        Self {
            from,
            to,
            label: Some(label.into()),
        }
    }
}

/// A workflow graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowGraph {
    nodes: IndexMap<NodeId, Node>,
    edges: Vec<Edge>,
}

impl WorkflowGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node, returning its id.
    pub fn add_node(&mut self, node: Node) -> NodeId {
        let id = node.id;
        self.nodes.insert(id, node);
        id
    }

    /// Adds an edge.
    ///
    /// # Errors
    ///
    /// Returns an error if either endpoint does not exist.
    pub fn add_edge(&mut self, edge: Edge) -> Result<(), GraphError> {
        for endpoint in [edge.from, edge.to] {
            if !self.nodes.contains_key(&endpoint) {
                return Err(GraphError::EdgeEndpointMissing { node_id: endpoint });
            }
        }
        self.edges.push(edge);
        Ok(())
    }

    /// Returns a node by id.
    #[must_use]
    pub fn node(&self, node_id: NodeId) -> Option<&Node> {
        self.nodes.get(&node_id)
    }

    /// Returns true if the node exists.
    #[must_use]
    pub fn contains(&self, node_id: NodeId) -> bool {
        self.nodes.contains_key(&node_id)
    }

    /// Iterates nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Returns the edges.
    #[must_use]
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Returns the single input node, if exactly one exists.
    #[must_use]
    pub fn entry_node(&self) -> Option<NodeId> {
        let mut entries = self
            .nodes
            .values()
            .filter(|n| matches!(n.kind, NodeKind::Input));
        let first = entries.next()?;
        if entries.next().is_some() {
            return None;
        }
        Some(first.id)
    }

    /// Returns the target of the unlabeled outgoing edge, if any.
    #[must_use]
    pub fn successor(&self, node_id: NodeId) -> Option<NodeId> {
        self.edges
            .iter()
            .find(|e| e.from == node_id && e.label.is_none())
            .map(|e| e.to)
    }

    /// Returns the target of the outgoing edge with the given label.
    #[must_use]
    pub fn labeled_successor(&self, node_id: NodeId, label: &str) -> Option<NodeId> {
        self.edges
            .iter()
            .find(|e| e.from == node_id && e.label.as_deref() == Some(label))
            .map(|e| e.to)
    }

    /// Validates the graph structure.
    ///
    /// Checks: exactly one input node, at least one output node, all edge
    /// endpoints and body members exist, body members are kinds allowed in
    /// a body, condition branches have matching edges, and every node is
    /// reachable from the entry.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn validate(&self) -> Result<(), GraphError> {
        let entry_count = self
            .nodes
            .values()
            .filter(|n| matches!(n.kind, NodeKind::Input))
            .count();
        if entry_count == 0 {
            return Err(GraphError::NoEntryNode);
        }
        if entry_count > 1 {
            return Err(GraphError::MultipleEntryNodes { count: entry_count });
        }
        if !self
            .nodes
            .values()
            .any(|n| matches!(n.kind, NodeKind::Output { .. }))
        {
            return Err(GraphError::NoOutputNode);
        }

        for edge in &self.edges {
            for endpoint in [edge.from, edge.to] {
                if !self.nodes.contains_key(&endpoint) {
                    return Err(GraphError::EdgeEndpointMissing { node_id: endpoint });
                }
            }
        }

        for node in self.nodes.values() {
            match &node.kind {
                NodeKind::Loop { body, .. } => {
                    self.validate_body(node.id, body)?;
                }
                NodeKind::Parallel { branches, .. } => {
                    if branches.is_empty() || branches.iter().any(Vec::is_empty) {
                        return Err(GraphError::EmptyBody { node_id: node.id });
                    }
                    for branch in branches {
                        self.validate_body(node.id, branch)?;
                    }
                }
                NodeKind::Condition { branches } => {
                    for branch in branches {
                        if self.labeled_successor(node.id, &branch.label).is_none() {
                            return Err(GraphError::MissingBranchEdge {
                                node_id: node.id,
                                label: branch.label.clone(),
                            });
                        }
                    }
                }
                _ => {}
            }
        }

        self.validate_reachability()
    }

    fn validate_body(&self, node_id: NodeId, body: &[NodeId]) -> Result<(), GraphError> {
        if body.is_empty() {
            return Err(GraphError::EmptyBody { node_id });
        }
        for member in body {
            let Some(node) = self.nodes.get(member) else {
                return Err(GraphError::BodyNodeMissing {
                    node_id,
                    missing: *member,
                });
            };
            if !node.kind.allowed_in_body() {
                return Err(GraphError::InvalidBodyNode {
                    node_id,
                    member: *member,
                });
            }
        }
        Ok(())
    }

    /// Every node must be reachable from the entry, counting body
    /// membership as reachability.
    fn validate_reachability(&self) -> Result<(), GraphError> {
        let mut graph: DiGraph<NodeId, ()> = DiGraph::new();
        let mut indices = HashMap::with_capacity(self.nodes.len());
        for id in self.nodes.keys() {
            indices.insert(*id, graph.add_node(*id));
        }
        for edge in &self.edges {
            graph.add_edge(indices[&edge.from], indices[&edge.to], ());
        }
        for node in self.nodes.values() {
            match &node.kind {
                NodeKind::Loop { body, .. } => {
                    for member in body {
                        graph.add_edge(indices[&node.id], indices[member], ());
                    }
                }
                NodeKind::Parallel { branches, .. } => {
                    for member in branches.iter().flatten() {
                        graph.add_edge(indices[&node.id], indices[member], ());
                    }
                }
                _ => {}
            }
        }

        // validate() checked the entry exists before calling us
        let Some(entry) = self.entry_node() else {
            return Err(GraphError::NoEntryNode);
        };
        let mut visited = vec![false; graph.node_bound()];
        let mut dfs = Dfs::new(&graph, indices[&entry]);
        while let Some(index) = dfs.next(&graph) {
            visited[index.index()] = true;
        }
        for (id, index) in &indices {
            if !visited[index.index()] {
                return Err(GraphError::Unreachable { node_id: *id });
            }
        }
        Ok(())
    }
}
