//! Error types for the workflow crate.
//!
//! Errors are layered, and the engine's public entry points wrap them in a
//! rootcause `Report`:
//! - `GraphError`: building a graph in code.
//! - `StructuralError`: validator findings that stop a run from starting.
//! - `EngineError`: fatal conditions surfaced to the caller of a run.
//!
//! Executor failures are not here; see [`crate::executor::NodeExecutionError`],
//! which the engine absorbs according to each node's error strategy.

use crate::edge::Handle;
use crate::execution::NodeStatus;
use crate::selector::Selector;
use crate::variable_pool::PoolError;
use std::fmt;
use tidewater_core::{EdgeId, NodeId};

/// Errors from graph building operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// Node with the given ID was not found in the graph.
    NodeNotFound { node_id: NodeId },
    /// A node with this ID already exists.
    DuplicateNode { node_id: NodeId },
    /// An edge with this ID already exists.
    DuplicateEdge { edge_id: EdgeId },
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeNotFound { node_id } => write!(f, "node not found: {node_id}"),
            Self::DuplicateNode { node_id } => write!(f, "duplicate node id: {node_id}"),
            Self::DuplicateEdge { edge_id } => write!(f, "duplicate edge id: {edge_id}"),
        }
    }
}

impl std::error::Error for GraphError {}

/// A fatal problem found by the graph validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructuralError {
    /// The graph has no entry node.
    NoRootNode,
    /// The graph has more than one entry node.
    MultipleRootNodes { node_ids: Vec<NodeId> },
    /// The entry node has incoming edges.
    RootHasIncomingEdges { node_id: NodeId },
    /// A node kind appears where it is not allowed.
    MisplacedNode { node_id: NodeId, kind: &'static str },
    /// Two nodes share an id.
    DuplicateNode { node_id: NodeId },
    /// Two edges share an id.
    DuplicateEdge { edge_id: EdgeId },
    /// An edge references a node that does not exist.
    DanglingEdge { edge_id: EdgeId, node_id: NodeId },
    /// An edge leaves through a handle its source cannot emit.
    InvalidSourceHandle {
        edge_id: EdgeId,
        node_id: NodeId,
        handle: Handle,
    },
    /// The graph contains a cycle through the given node.
    CycleDetected { node_id: NodeId },
    /// A `loop` edge outside a container body.
    StrayLoopEdge { edge_id: EdgeId },
    /// A `loop` edge that does not return to the body's start marker.
    LoopEdgeTarget {
        edge_id: EdgeId,
        target: NodeId,
        expected: NodeId,
    },
    /// The graph has no terminal node.
    NoTerminalNode,
    /// No terminal node is reachable from the entry node.
    TerminalUnreachable,
    /// A selector names a node that is not in scope.
    UnknownSelectorSource { node_id: NodeId, selector: Selector },
    /// A selector names a field its producer does not declare.
    UnknownOutputField { node_id: NodeId, selector: Selector },
    /// Error handling configured on a node kind that cannot use it.
    StrategyNotAllowed { node_id: NodeId, kind: &'static str },
    /// A pausing node inside a container body.
    PauseInsideContainer { node_id: NodeId },
    /// A container body's start or end marker is missing or of the wrong kind.
    InvalidContainerMarker { container: NodeId, marker: NodeId },
    /// A loop that would never run.
    ZeroLoopCount { node_id: NodeId },
    /// An error found inside a container body.
    InContainer {
        container: NodeId,
        error: Box<StructuralError>,
    },
}

impl fmt::Display for StructuralError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoRootNode => write!(f, "graph has no start node"),
            Self::MultipleRootNodes { node_ids } => {
                let ids: Vec<String> = node_ids.iter().map(ToString::to_string).collect();
                write!(f, "graph has multiple start nodes: {}", ids.join(", "))
            }
            Self::RootHasIncomingEdges { node_id } => {
                write!(f, "start node {node_id} has incoming edges")
            }
            Self::MisplacedNode { node_id, kind } => {
                write!(f, "{kind} node {node_id} is not allowed here")
            }
            Self::DuplicateNode { node_id } => write!(f, "duplicate node id: {node_id}"),
            Self::DuplicateEdge { edge_id } => write!(f, "duplicate edge id: {edge_id}"),
            Self::DanglingEdge { edge_id, node_id } => {
                write!(f, "edge {edge_id} references unknown node {node_id}")
            }
            Self::InvalidSourceHandle {
                edge_id,
                node_id,
                handle,
            } => write!(
                f,
                "edge {edge_id} leaves node {node_id} through handle '{handle}' it cannot emit"
            ),
            Self::CycleDetected { node_id } => {
                write!(f, "graph contains a cycle through node {node_id}")
            }
            Self::StrayLoopEdge { edge_id } => {
                write!(f, "loop edge {edge_id} is outside a container body")
            }
            Self::LoopEdgeTarget {
                edge_id,
                target,
                expected,
            } => write!(
                f,
                "loop edge {edge_id} targets {target} instead of start marker {expected}"
            ),
            Self::NoTerminalNode => write!(f, "graph has no end node"),
            Self::TerminalUnreachable => write!(f, "no end node is reachable from the start node"),
            Self::UnknownSelectorSource { node_id, selector } => {
                write!(f, "node {node_id} reads {selector} from a node that is not in scope")
            }
            Self::UnknownOutputField { node_id, selector } => {
                write!(f, "node {node_id} reads undeclared output {selector}")
            }
            Self::StrategyNotAllowed { node_id, kind } => {
                write!(f, "{kind} node {node_id} cannot use retry or error strategies")
            }
            Self::PauseInsideContainer { node_id } => {
                write!(f, "human-input node {node_id} cannot run inside a container")
            }
            Self::InvalidContainerMarker { container, marker } => {
                write!(f, "container {container} has an invalid marker {marker}")
            }
            Self::ZeroLoopCount { node_id } => write!(f, "loop {node_id} has loop_count 0"),
            Self::InContainer { container, error } => {
                write!(f, "in container {container}: {error}")
            }
        }
    }
}

impl std::error::Error for StructuralError {}

/// Fatal errors that end a run, or prevent one from starting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The graph failed validation.
    Structural { errors: Vec<StructuralError> },
    /// A node's executor is not registered.
    MissingExecutor { node_id: NodeId, executor: String },
    /// A selector was read before its producer completed.
    UnresolvedVariable { node_id: NodeId, selector: Selector },
    /// A variable key was written twice in one scope.
    VariableConflict { node_id: NodeId, detail: String },
    /// The engine attempted an illegal node status change.
    InvalidTransition {
        node_id: NodeId,
        from: NodeStatus,
        to: NodeStatus,
    },
    /// A resume request that does not match the paused run.
    ResumeRejected { reason: String },
}

impl EngineError {
    /// Attributes a pool failure to the node being processed.
    pub(crate) fn from_pool(node_id: &NodeId, error: PoolError) -> Self {
        match error {
            PoolError::Unresolved { selector } => Self::UnresolvedVariable {
                node_id: node_id.clone(),
                selector,
            },
            other => Self::VariableConflict {
                node_id: node_id.clone(),
                detail: other.to_string(),
            },
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Structural { errors } => {
                write!(f, "graph failed validation with {} error(s)", errors.len())?;
                for error in errors {
                    write!(f, "; {error}")?;
                }
                Ok(())
            }
            Self::MissingExecutor { node_id, executor } => {
                write!(f, "no executor '{executor}' registered for node {node_id}")
            }
            Self::UnresolvedVariable { node_id, selector } => {
                write!(f, "unresolved variable {selector} needed by node {node_id}")
            }
            Self::VariableConflict { node_id, detail } => {
                write!(f, "variable conflict at node {node_id}: {detail}")
            }
            Self::InvalidTransition { node_id, from, to } => {
                write!(f, "invalid transition for node {node_id}: {from:?} -> {to:?}")
            }
            Self::ResumeRejected { reason } => write!(f, "resume rejected: {reason}"),
        }
    }
}

impl std::error::Error for EngineError {}
