//! Workflow graph storage built on petgraph.
//!
//! The graph keeps the forward and reverse adjacency petgraph gives us, plus
//! id lookups for nodes and edges. Graphs arriving from a loader are built
//! leniently: duplicate ids and edges pointing at unknown nodes are recorded
//! rather than rejected, so the validator can report all of them at once.

use crate::edge::{Edge, Handle};
use crate::error::GraphError;
use crate::node::{Capability, Node};
use petgraph::Direction;
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tidewater_core::{EdgeId, NodeId};

/// A directed graph of nodes joined by handle-labelled edges.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "GraphParts", into = "GraphParts")]
pub struct WorkflowGraph {
    graph: DiGraph<Node, Edge>,
    node_index_map: HashMap<NodeId, NodeIndex>,
    edge_index_map: HashMap<EdgeId, EdgeIndex>,
    unresolved_edges: Vec<Edge>,
    duplicate_nodes: Vec<NodeId>,
    duplicate_edges: Vec<EdgeId>,
}

/// Serialized form of a graph: plain node and edge lists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphParts {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl WorkflowGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a graph, recording duplicate ids and dangling edges instead of
    /// failing.
    #[must_use]
    pub fn from_parts(nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        let mut graph = Self::new();
        for node in nodes {
            graph.insert_node_lenient(node);
        }
        for edge in edges {
            graph.insert_edge_lenient(edge);
        }
        graph
    }

    /// Adds a node.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::DuplicateNode`] if the id is already present.
    pub fn add_node(&mut self, node: Node) -> Result<(), GraphError> {
        if self.node_index_map.contains_key(&node.id) {
            return Err(GraphError::DuplicateNode { node_id: node.id });
        }
        let node_id = node.id.clone();
        let index = self.graph.add_node(node);
        self.node_index_map.insert(node_id, index);
        Ok(())
    }

    /// Adds an edge between two existing nodes.
    ///
    /// # Errors
    ///
    /// Returns an error if either endpoint is missing or the edge id is taken.
    pub fn add_edge(&mut self, edge: Edge) -> Result<(), GraphError> {
        if self.edge_index_map.contains_key(&edge.id) {
            return Err(GraphError::DuplicateEdge { edge_id: edge.id });
        }
        let source = self.index_of(&edge.source).ok_or_else(|| GraphError::NodeNotFound {
            node_id: edge.source.clone(),
        })?;
        let target = self.index_of(&edge.target).ok_or_else(|| GraphError::NodeNotFound {
            node_id: edge.target.clone(),
        })?;
        let edge_id = edge.id.clone();
        let index = self.graph.add_edge(source, target, edge);
        self.edge_index_map.insert(edge_id, index);
        Ok(())
    }

    /// Adds a node, chaining. Duplicates are recorded for the validator.
    #[must_use]
    pub fn with_node(mut self, node: Node) -> Self {
        self.insert_node_lenient(node);
        self
    }

    /// Adds an edge, chaining. Problems are recorded for the validator.
    #[must_use]
    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.insert_edge_lenient(edge);
        self
    }

    fn insert_node_lenient(&mut self, node: Node) {
        if let Err(GraphError::DuplicateNode { node_id }) = self.add_node(node) {
            self.duplicate_nodes.push(node_id);
        }
    }

    fn insert_edge_lenient(&mut self, edge: Edge) {
        match self.add_edge(edge.clone()) {
            Ok(()) => {}
            Err(GraphError::DuplicateEdge { edge_id }) => self.duplicate_edges.push(edge_id),
            Err(_) => self.unresolved_edges.push(edge),
        }
    }

    pub(crate) fn index_of(&self, node_id: &NodeId) -> Option<NodeIndex> {
        self.node_index_map.get(node_id).copied()
    }

    /// Returns the node with the given id.
    #[must_use]
    pub fn get_node(&self, node_id: &NodeId) -> Option<&Node> {
        self.graph.node_weight(self.index_of(node_id)?)
    }

    #[must_use]
    pub fn contains_node(&self, node_id: &NodeId) -> bool {
        self.node_index_map.contains_key(node_id)
    }

    /// Returns the edge with the given id.
    #[must_use]
    pub fn get_edge(&self, edge_id: &EdgeId) -> Option<&Edge> {
        self.graph.edge_weight(*self.edge_index_map.get(edge_id)?)
    }

    /// Iterates over all nodes.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.graph.node_weights()
    }

    /// Iterates over all edges that connect existing nodes.
    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.graph.edge_weights()
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    fn edges_directed(&self, node_id: &NodeId, direction: Direction) -> Vec<&Edge> {
        let Some(index) = self.index_of(node_id) else {
            return Vec::new();
        };
        let mut edges: Vec<&Edge> = self
            .graph
            .edges_directed(index, direction)
            .map(|e| e.weight())
            .collect();
        edges.sort_by(|a, b| a.id.cmp(&b.id));
        edges
    }

    /// Outgoing edges of a node, ordered by edge id.
    #[must_use]
    pub fn outgoing(&self, node_id: &NodeId) -> Vec<&Edge> {
        self.edges_directed(node_id, Direction::Outgoing)
    }

    /// Incoming edges of a node, ordered by edge id.
    #[must_use]
    pub fn incoming(&self, node_id: &NodeId) -> Vec<&Edge> {
        self.edges_directed(node_id, Direction::Incoming)
    }

    /// Outgoing edges of a node grouped by source handle.
    #[must_use]
    pub fn outgoing_by_handle(&self, node_id: &NodeId) -> BTreeMap<Handle, Vec<&Edge>> {
        let mut groups: BTreeMap<Handle, Vec<&Edge>> = BTreeMap::new();
        for edge in self.outgoing(node_id) {
            groups.entry(edge.source_handle.clone()).or_default().push(edge);
        }
        groups
    }

    /// Downstream nodes with the edge leading to each.
    #[must_use]
    pub fn successors(&self, node_id: &NodeId) -> Vec<(&Node, &Edge)> {
        self.outgoing(node_id)
            .into_iter()
            .filter_map(|edge| Some((self.get_node(&edge.target)?, edge)))
            .collect()
    }

    /// Nodes with the ROOT capability.
    #[must_use]
    pub fn root_nodes(&self) -> Vec<&Node> {
        self.nodes_with(Capability::Root)
    }

    /// Nodes with the RESPONSE capability.
    #[must_use]
    pub fn response_nodes(&self) -> Vec<&Node> {
        self.nodes_with(Capability::Response)
    }

    fn nodes_with(&self, capability: Capability) -> Vec<&Node> {
        let mut nodes: Vec<&Node> = self
            .nodes()
            .filter(|n| n.capability() == capability)
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// Edges whose source or target did not exist when they were added.
    #[must_use]
    pub fn unresolved_edges(&self) -> &[Edge] {
        &self.unresolved_edges
    }

    /// Node ids that appeared more than once.
    #[must_use]
    pub fn duplicate_nodes(&self) -> &[NodeId] {
        &self.duplicate_nodes
    }

    /// Edge ids that appeared more than once.
    #[must_use]
    pub fn duplicate_edges(&self) -> &[EdgeId] {
        &self.duplicate_edges
    }

    /// The graph with every `loop` edge removed, for ordering checks.
    pub(crate) fn forward_skeleton(&self) -> DiGraph<NodeId, ()> {
        let mut skeleton = DiGraph::with_capacity(self.node_count(), self.edge_count());
        let mut indices = HashMap::new();
        for index in self.graph.node_indices() {
            indices.insert(index, skeleton.add_node(self.graph[index].id.clone()));
        }
        for edge in self.graph.edge_references() {
            if edge.weight().is_loop() {
                continue;
            }
            skeleton.add_edge(indices[&edge.source()], indices[&edge.target()], ());
        }
        skeleton
    }
}

impl From<GraphParts> for WorkflowGraph {
    fn from(parts: GraphParts) -> Self {
        Self::from_parts(parts.nodes, parts.edges)
    }
}

impl From<WorkflowGraph> for GraphParts {
    fn from(graph: WorkflowGraph) -> Self {
        let mut edges: Vec<Edge> = graph.graph.edge_weights().cloned().collect();
        edges.extend(graph.unresolved_edges);
        Self {
            nodes: graph.graph.node_weights().cloned().collect(),
            edges,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::TaskConfig;

    fn task(id: &str) -> Node {
        Node::task(id, TaskConfig::new("echo"))
    }

    fn linear() -> WorkflowGraph {
        WorkflowGraph::new()
            .with_node(Node::start("start", vec![]))
            .with_node(task("work"))
            .with_node(Node::end("end", vec![]))
            .with_edge(Edge::new("e1", "start", "work"))
            .with_edge(Edge::new("e2", "work", "end"))
    }

    #[test]
    fn add_and_get_nodes() {
        let graph = linear();
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.edge_count(), 2);
        assert!(graph.get_node(&NodeId::new("work")).is_some());
        assert!(graph.get_node(&NodeId::new("missing")).is_none());
    }

    #[test]
    fn adjacency_in_both_directions() {
        let graph = linear();
        let work = NodeId::new("work");
        assert_eq!(graph.outgoing(&work)[0].target.as_str(), "end");
        assert_eq!(graph.incoming(&work)[0].source.as_str(), "start");
        let successors = graph.successors(&NodeId::new("start"));
        assert_eq!(successors.len(), 1);
        assert_eq!(successors[0].0.id.as_str(), "work");
    }

    #[test]
    fn strict_add_edge_rejects_unknown_nodes() {
        let mut graph = linear();
        let err = graph.add_edge(Edge::new("e3", "work", "ghost")).unwrap_err();
        assert_eq!(
            err,
            GraphError::NodeNotFound {
                node_id: NodeId::new("ghost")
            }
        );
    }

    #[test]
    fn lenient_building_records_problems() {
        let graph = linear()
            .with_node(task("work"))
            .with_edge(Edge::new("e1", "start", "end"))
            .with_edge(Edge::new("e9", "work", "ghost"));

        assert_eq!(graph.duplicate_nodes(), &[NodeId::new("work")]);
        assert_eq!(graph.duplicate_edges(), &[EdgeId::new("e1")]);
        assert_eq!(graph.unresolved_edges().len(), 1);
    }

    #[test]
    fn groups_outgoing_edges_by_handle() {
        let graph = WorkflowGraph::new()
            .with_node(task("a"))
            .with_node(task("b"))
            .with_node(task("c"))
            .with_node(task("d"))
            .with_edge(Edge::new("e1", "a", "b").with_handle(Handle::True))
            .with_edge(Edge::new("e2", "a", "c").with_handle(Handle::True))
            .with_edge(Edge::new("e3", "a", "d").with_handle(Handle::False));

        let groups = graph.outgoing_by_handle(&NodeId::new("a"));
        assert_eq!(groups[&Handle::True].len(), 2);
        assert_eq!(groups[&Handle::False].len(), 1);
    }

    #[test]
    fn roots_and_responses() {
        let graph = linear();
        assert_eq!(graph.root_nodes()[0].id.as_str(), "start");
        assert_eq!(graph.response_nodes()[0].id.as_str(), "end");
    }

    #[test]
    fn serde_roundtrip_keeps_lookup_tables() {
        let json = serde_json::to_string(&linear()).expect("serialize");
        let parsed: WorkflowGraph = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.node_count(), 3);
        assert!(parsed.get_edge(&EdgeId::new("e2")).is_some());
        assert_eq!(parsed.outgoing(&NodeId::new("start")).len(), 1);
    }

    #[test]
    fn skeleton_drops_loop_edges() {
        let graph = WorkflowGraph::new()
            .with_node(Node::container_start("ls"))
            .with_node(Node::container_end("le", vec![]))
            .with_edge(Edge::new("e1", "ls", "le"))
            .with_edge(Edge::new("back", "le", "ls").with_handle(Handle::Loop));

        let skeleton = graph.forward_skeleton();
        assert_eq!(skeleton.edge_count(), 1);
        assert!(!petgraph::algo::is_cyclic_directed(&skeleton));
    }
}
