//! Edge resolution and skip-cascade.
//!
//! When a node completes the engine tells the processor which handles it
//! emitted. Edges leaving through those handles become TAKEN and every other
//! outgoing edge becomes SKIPPED. A target whose incoming edges are now all
//! resolved is either ready (at least one TAKEN) or skipped (all SKIPPED); a
//! skipped node skips its own outgoing edges in turn, and so on down the
//! graph.
//!
//! `loop` edges never take part in readiness. They are resolved separately by
//! the container driver once it knows whether another iteration follows.

use crate::edge::{EdgeState, Handle};
use crate::graph::WorkflowGraph;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tidewater_core::{EdgeId, NodeId};

/// Outcome of resolving one node's outgoing edges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Edges that became TAKEN.
    pub taken: Vec<EdgeId>,
    /// Edges that became SKIPPED, including cascaded ones.
    pub skipped: Vec<EdgeId>,
    /// Nodes whose dependencies are now satisfied.
    pub ready: Vec<NodeId>,
    /// Nodes that can never run, in cascade order.
    pub skipped_nodes: Vec<NodeId>,
}

enum Readiness {
    Pending,
    Ready,
    Skip,
}

/// Tracks edge states for one run, or one container iteration.
#[derive(Debug, Clone)]
pub struct EdgeProcessor {
    graph: Arc<WorkflowGraph>,
    states: HashMap<EdgeId, EdgeState>,
}

impl EdgeProcessor {
    /// Creates a processor with every edge UNKNOWN.
    #[must_use]
    pub fn new(graph: Arc<WorkflowGraph>) -> Self {
        let states = graph
            .edges()
            .map(|edge| (edge.id.clone(), EdgeState::Unknown))
            .collect();
        Self { graph, states }
    }

    #[must_use]
    pub fn state(&self, edge_id: &EdgeId) -> EdgeState {
        self.states.get(edge_id).copied().unwrap_or_default()
    }

    #[must_use]
    pub fn states(&self) -> &HashMap<EdgeId, EdgeState> {
        &self.states
    }

    /// Resolves the non-loop outgoing edges of a completed node.
    ///
    /// Edges leaving through one of `emitted` become TAKEN, the rest SKIPPED.
    /// An empty `emitted` skips the entire downstream subtree.
    pub fn resolve(&mut self, node_id: &NodeId, emitted: &[Handle]) -> Resolution {
        let mut resolution = Resolution::default();
        let mut touched = BTreeSet::new();

        for edge in self.graph.outgoing(node_id) {
            if edge.is_loop() || self.state(&edge.id).is_resolved() {
                continue;
            }
            if emitted.contains(&edge.source_handle) {
                self.states.insert(edge.id.clone(), EdgeState::Taken);
                resolution.taken.push(edge.id.clone());
            } else {
                self.states.insert(edge.id.clone(), EdgeState::Skipped);
                resolution.skipped.push(edge.id.clone());
            }
            touched.insert(edge.target.clone());
        }

        self.settle(touched, &mut resolution);
        resolution
    }

    /// Resolves a node's `loop` edges: TAKEN while iterating, SKIPPED on exit.
    pub fn resolve_loop(&mut self, node_id: &NodeId, continuing: bool) -> Vec<(EdgeId, EdgeState)> {
        let state = if continuing {
            EdgeState::Taken
        } else {
            EdgeState::Skipped
        };
        let mut changed = Vec::new();
        for edge in self.graph.outgoing(node_id) {
            if edge.is_loop() && !self.state(&edge.id).is_resolved() {
                self.states.insert(edge.id.clone(), state);
                changed.push((edge.id.clone(), state));
            }
        }
        changed
    }

    fn settle(&mut self, touched: BTreeSet<NodeId>, resolution: &mut Resolution) {
        let mut queue: VecDeque<NodeId> = touched.into_iter().collect();
        while let Some(target) = queue.pop_front() {
            match self.readiness(&target) {
                Readiness::Pending => {}
                Readiness::Ready => resolution.ready.push(target),
                Readiness::Skip => {
                    let mut next = BTreeSet::new();
                    for edge in self.graph.outgoing(&target) {
                        if self.state(&edge.id).is_resolved() {
                            continue;
                        }
                        self.states.insert(edge.id.clone(), EdgeState::Skipped);
                        resolution.skipped.push(edge.id.clone());
                        if !edge.is_loop() {
                            next.insert(edge.target.clone());
                        }
                    }
                    resolution.skipped_nodes.push(target);
                    queue.extend(next);
                }
            }
        }
    }

    fn readiness(&self, node_id: &NodeId) -> Readiness {
        let mut any_taken = false;
        for edge in self.graph.incoming(node_id) {
            if edge.is_loop() {
                continue;
            }
            match self.state(&edge.id) {
                EdgeState::Unknown => return Readiness::Pending,
                EdgeState::Taken => any_taken = true,
                EdgeState::Skipped => {}
            }
        }
        if any_taken {
            Readiness::Ready
        } else {
            Readiness::Skip
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::Edge;
    use crate::node::{Node, TaskConfig};

    fn task(id: &str) -> Node {
        Node::task(id, TaskConfig::new("echo"))
    }

    fn ids(items: &[&str]) -> Vec<NodeId> {
        items.iter().map(|s| NodeId::new(*s)).collect()
    }

    /// branch --true--> a --> join
    ///        --false-> b --> b2 --> join
    fn diamond() -> Arc<WorkflowGraph> {
        Arc::new(
            WorkflowGraph::new()
                .with_node(task("branch"))
                .with_node(task("a"))
                .with_node(task("b"))
                .with_node(task("b2"))
                .with_node(task("join"))
                .with_edge(Edge::new("e_true", "branch", "a").with_handle(Handle::True))
                .with_edge(Edge::new("e_false", "branch", "b").with_handle(Handle::False))
                .with_edge(Edge::new("e_a", "a", "join"))
                .with_edge(Edge::new("e_b", "b", "b2"))
                .with_edge(Edge::new("e_b2", "b2", "join")),
        )
    }

    #[test]
    fn linear_edge_taken_makes_target_ready() {
        let graph = Arc::new(
            WorkflowGraph::new()
                .with_node(task("a"))
                .with_node(task("b"))
                .with_edge(Edge::new("e1", "a", "b")),
        );
        let mut processor = EdgeProcessor::new(graph);
        let res = processor.resolve(&NodeId::new("a"), &[Handle::Source]);

        assert_eq!(res.taken, vec![EdgeId::new("e1")]);
        assert_eq!(res.ready, ids(&["b"]));
        assert!(res.skipped.is_empty());
    }

    #[test]
    fn branch_skips_losing_subtree_and_join_waits() {
        let mut processor = EdgeProcessor::new(diamond());
        let res = processor.resolve(&NodeId::new("branch"), &[Handle::True]);

        assert_eq!(res.taken, vec![EdgeId::new("e_true")]);
        assert_eq!(res.ready, ids(&["a"]));
        assert_eq!(res.skipped_nodes, ids(&["b", "b2"]));
        assert_eq!(processor.state(&EdgeId::new("e_b2")), EdgeState::Skipped);
        // join still waits on e_a
        assert_eq!(processor.state(&EdgeId::new("e_a")), EdgeState::Unknown);

        let res = processor.resolve(&NodeId::new("a"), &[Handle::Source]);
        assert_eq!(res.ready, ids(&["join"]));
    }

    #[test]
    fn all_skipped_inputs_cascade_through_join() {
        let mut processor = EdgeProcessor::new(diamond());
        let res = processor.resolve(&NodeId::new("branch"), &[]);

        assert!(res.taken.is_empty());
        assert!(res.ready.is_empty());
        assert_eq!(res.skipped_nodes, ids(&["a", "b", "b2", "join"]));
        assert!(
            processor
                .states()
                .values()
                .all(|state| *state == EdgeState::Skipped)
        );
    }

    #[test]
    fn fail_branch_pair_is_exclusive() {
        let graph = Arc::new(
            WorkflowGraph::new()
                .with_node(task("code"))
                .with_node(task("ok"))
                .with_node(task("recover"))
                .with_edge(Edge::new("s", "code", "ok").with_handle(Handle::SuccessBranch))
                .with_edge(Edge::new("f", "code", "recover").with_handle(Handle::FailBranch)),
        );
        let mut processor = EdgeProcessor::new(graph);
        let res = processor.resolve(&NodeId::new("code"), &[Handle::FailBranch]);

        assert_eq!(res.taken, vec![EdgeId::new("f")]);
        assert_eq!(res.skipped, vec![EdgeId::new("s")]);
        assert_eq!(res.ready, ids(&["recover"]));
        assert_eq!(res.skipped_nodes, ids(&["ok"]));
    }

    #[test]
    fn resolved_edges_never_revert() {
        let mut processor = EdgeProcessor::new(diamond());
        processor.resolve(&NodeId::new("branch"), &[Handle::True]);
        let again = processor.resolve(&NodeId::new("branch"), &[Handle::False]);

        assert!(again.taken.is_empty());
        assert_eq!(processor.state(&EdgeId::new("e_true")), EdgeState::Taken);
        assert_eq!(processor.state(&EdgeId::new("e_false")), EdgeState::Skipped);
    }

    #[test]
    fn loop_edges_resolve_separately() {
        let graph = Arc::new(
            WorkflowGraph::new()
                .with_node(Node::container_start("ls"))
                .with_node(task("body"))
                .with_node(Node::container_end("le", vec![]))
                .with_edge(Edge::new("e1", "ls", "body"))
                .with_edge(Edge::new("e2", "body", "le"))
                .with_edge(Edge::new("back", "le", "ls").with_handle(Handle::Loop)),
        );
        let mut processor = EdgeProcessor::new(graph);

        let res = processor.resolve(&NodeId::new("le"), &[Handle::Source]);
        assert!(res.skipped.is_empty());
        assert_eq!(processor.state(&EdgeId::new("back")), EdgeState::Unknown);

        let changed = processor.resolve_loop(&NodeId::new("le"), true);
        assert_eq!(changed, vec![(EdgeId::new("back"), EdgeState::Taken)]);

        assert!(processor.resolve_loop(&NodeId::new("le"), false).is_empty());
        assert_eq!(processor.state(&EdgeId::new("back")), EdgeState::Taken);
    }
}
