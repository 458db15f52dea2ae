//! Run state, and its reconstruction from events.
//!
//! [`RunState`] is owned by exactly one engine loop: the run's outer loop, or
//! the loop driving one container iteration. Nothing else holds a mutable
//! reference to it, so its ready queue, pool and edge states need no locking.
//! Workers only ever see values copied out of it.
//!
//! [`RunReplay`] goes the other way: it rebuilds node and edge states from a
//! run's event history, for observers that only have the event stream.

use crate::edge::EdgeState;
use crate::edge_processor::EdgeProcessor;
use crate::error::EngineError;
use crate::execution::{EngineEvent, NodeRuntimeState, NodeStatus, WorkflowRunStatus};
use crate::graph::WorkflowGraph;
use crate::variable_pool::VariablePool;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use tidewater_core::{EdgeId, NodeId, RunId};

/// Why a run failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    /// The failing node, when the failure is attributable to one.
    pub node_id: Option<NodeId>,
    pub error_type: String,
    pub message: String,
}

impl RunFailure {
    pub fn new(
        node_id: Option<NodeId>,
        error_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            node_id,
            error_type: error_type.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node_id {
            Some(node_id) => write!(f, "{node_id}: {} ({})", self.message, self.error_type),
            None => write!(f, "{} ({})", self.message, self.error_type),
        }
    }
}

/// Why a loop stopped dispatching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Halt {
    /// The terminal node succeeded.
    Terminal,
    /// An unhandled failure or a fatal error.
    Failed,
    /// Stop was requested.
    Stopped,
}

/// Mutable state of one engine loop.
#[derive(Debug, Clone)]
pub struct RunState {
    pub(crate) graph: Arc<WorkflowGraph>,
    pub(crate) pool: VariablePool,
    pub(crate) node_states: HashMap<NodeId, NodeRuntimeState>,
    pub(crate) edges: EdgeProcessor,
    pub(crate) ready: VecDeque<NodeId>,
    pub(crate) in_flight: HashSet<NodeId>,
    pub(crate) awaiting_input: BTreeSet<NodeId>,
    /// Nodes that finished EXCEPTION, in completion order.
    pub(crate) exceptions: Vec<NodeId>,
    pub(crate) halt: Option<Halt>,
    pub(crate) terminal_reached: bool,
    pub(crate) failure: Option<RunFailure>,
    pub(crate) fatal: Option<EngineError>,
    /// Outputs of the terminal node, once it has succeeded.
    pub(crate) outputs: serde_json::Map<String, JsonValue>,
}

impl RunState {
    /// Creates state with every node NOT_STARTED and every edge UNKNOWN.
    pub(crate) fn new(graph: Arc<WorkflowGraph>, pool: VariablePool) -> Self {
        let node_states = graph
            .nodes()
            .map(|node| (node.id.clone(), NodeRuntimeState::default()))
            .collect();
        Self {
            edges: EdgeProcessor::new(Arc::clone(&graph)),
            graph,
            pool,
            node_states,
            ready: VecDeque::new(),
            in_flight: HashSet::new(),
            awaiting_input: BTreeSet::new(),
            exceptions: Vec::new(),
            halt: None,
            terminal_reached: false,
            failure: None,
            fatal: None,
            outputs: serde_json::Map::new(),
        }
    }

    #[must_use]
    pub fn status_of(&self, node_id: &NodeId) -> NodeStatus {
        self.node_states
            .get(node_id)
            .map(|s| s.status)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn node_states(&self) -> &HashMap<NodeId, NodeRuntimeState> {
        &self.node_states
    }

    #[must_use]
    pub fn edge_states(&self) -> &HashMap<EdgeId, EdgeState> {
        self.edges.states()
    }

    #[must_use]
    pub fn pool(&self) -> &VariablePool {
        &self.pool
    }

    /// Nodes parked until external input arrives.
    pub fn awaiting_input(&self) -> impl Iterator<Item = &NodeId> {
        self.awaiting_input.iter()
    }

    #[must_use]
    pub fn outputs(&self) -> &serde_json::Map<String, JsonValue> {
        &self.outputs
    }

    /// Moves a node to `to`, returning its previous status and attempt count.
    pub(crate) fn transition(
        &mut self,
        node_id: &NodeId,
        to: NodeStatus,
        at: DateTime<Utc>,
    ) -> Result<(NodeStatus, u32), EngineError> {
        let state = self.node_states.entry(node_id.clone()).or_default();
        let from = state.transition(node_id, to, at)?;
        Ok((from, state.attempt_count))
    }

    pub(crate) fn node_state_mut(&mut self, node_id: &NodeId) -> &mut NodeRuntimeState {
        self.node_states.entry(node_id.clone()).or_default()
    }

    /// Records the first reason to stop dispatching; later ones are ignored.
    pub(crate) fn halt(&mut self, halt: Halt) {
        self.halt.get_or_insert(halt);
    }

    #[must_use]
    pub(crate) fn is_halted(&self) -> bool {
        self.halt.is_some()
    }

    /// Returns true when nothing is queued or running.
    #[must_use]
    pub(crate) fn is_idle(&self) -> bool {
        self.ready.is_empty() && self.in_flight.is_empty()
    }

    /// Records a run failure; the first one wins.
    pub(crate) fn fail(&mut self, failure: RunFailure) {
        if self.failure.is_none() {
            self.failure = Some(failure);
        }
        self.halt(Halt::Failed);
    }
}

/// Node and edge states rebuilt from an event history.
///
/// Only events of the outer graph are applied; container-body events carry an
/// iteration scope and are ignored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReplay {
    pub run_id: Option<RunId>,
    pub status: Option<WorkflowRunStatus>,
    pub node_statuses: HashMap<NodeId, NodeStatus>,
    pub attempts: HashMap<NodeId, u32>,
    pub edge_states: HashMap<EdgeId, EdgeState>,
}

impl RunReplay {
    /// Replays events in order, earliest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the events mix runs, or if a transition does not
    /// start from the status the previous events left the node in.
    pub fn from_events<'a>(
        events: impl IntoIterator<Item = &'a EngineEvent>,
    ) -> Result<Self, ReplayError> {
        let mut replay = Self::default();
        let mut seen_any = false;

        for event in events {
            seen_any = true;
            let run_id = event.run_id();
            match replay.run_id {
                None => replay.run_id = Some(run_id),
                Some(expected) if expected != run_id => {
                    return Err(ReplayError::MixedRuns {
                        expected,
                        found: run_id,
                    });
                }
                Some(_) => {}
            }
            replay.apply(event)?;
        }

        if !seen_any {
            return Err(ReplayError::NoEvents);
        }
        Ok(replay)
    }

    fn apply(&mut self, event: &EngineEvent) -> Result<(), ReplayError> {
        match event {
            EngineEvent::RunStatusChanged { to, .. } => self.status = Some(*to),
            EngineEvent::NodeTransition(t) if t.scope.is_empty() => {
                let current = self.node_statuses.get(&t.node_id).copied().unwrap_or_default();
                if current != t.from {
                    return Err(ReplayError::OutOfOrder {
                        node_id: t.node_id.clone(),
                        expected: current,
                        found: t.from,
                    });
                }
                self.node_statuses.insert(t.node_id.clone(), t.to);
                self.attempts.insert(t.node_id.clone(), t.attempt);
            }
            EngineEvent::EdgeResolved {
                edge_id,
                state,
                scope,
                ..
            } if scope.is_empty() => {
                self.edge_states.insert(edge_id.clone(), *state);
            }
            _ => {}
        }
        Ok(())
    }

    #[must_use]
    pub fn status_of(&self, node_id: &NodeId) -> NodeStatus {
        self.node_statuses.get(node_id).copied().unwrap_or_default()
    }
}

/// Errors from replaying an event history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayError {
    /// No events provided.
    NoEvents,
    /// Events from more than one run.
    MixedRuns { expected: RunId, found: RunId },
    /// A transition whose `from` does not match the replayed status.
    OutOfOrder {
        node_id: NodeId,
        expected: NodeStatus,
        found: NodeStatus,
    },
}

impl fmt::Display for ReplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoEvents => write!(f, "no events provided"),
            Self::MixedRuns { expected, found } => {
                write!(f, "event from run {found} in history of run {expected}")
            }
            Self::OutOfOrder {
                node_id,
                expected,
                found,
            } => write!(
                f,
                "node {node_id} transitions from {found:?} but was {expected:?}"
            ),
        }
    }
}

impl std::error::Error for ReplayError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::Edge;
    use crate::execution::{IterationScope, NodeTransition};
    use crate::node::{Node, TaskConfig};

    fn graph() -> Arc<WorkflowGraph> {
        Arc::new(
            WorkflowGraph::new()
                .with_node(Node::start("start", vec![]))
                .with_node(Node::task("a", TaskConfig::new("echo")))
                .with_edge(Edge::new("e1", "start", "a")),
        )
    }

    fn transition(run_id: RunId, node: &str, from: NodeStatus, to: NodeStatus) -> EngineEvent {
        EngineEvent::NodeTransition(NodeTransition {
            run_id,
            node_id: NodeId::new(node),
            from,
            to,
            attempt: u32::from(to == NodeStatus::Running),
            timestamp: Utc::now(),
            scope: Vec::new(),
            outputs: None,
            error: None,
        })
    }

    #[test]
    fn new_state_starts_everything_unknown() {
        let state = RunState::new(graph(), VariablePool::new());
        assert_eq!(state.status_of(&NodeId::new("a")), NodeStatus::NotStarted);
        assert_eq!(
            state.edge_states().get(&EdgeId::new("e1")),
            Some(&EdgeState::Unknown)
        );
        assert!(state.is_idle());
        assert!(!state.is_halted());
    }

    #[test]
    fn transition_rejects_illegal_moves() {
        let mut state = RunState::new(graph(), VariablePool::new());
        let a = NodeId::new("a");
        let err = state
            .transition(&a, NodeStatus::Succeeded, Utc::now())
            .expect_err("NOT_STARTED cannot jump to SUCCEEDED");
        assert!(matches!(err, EngineError::InvalidTransition { .. }));

        state.transition(&a, NodeStatus::Waiting, Utc::now()).expect("legal");
        let (from, attempts) = state
            .transition(&a, NodeStatus::Running, Utc::now())
            .expect("legal");
        assert_eq!(from, NodeStatus::Waiting);
        assert_eq!(attempts, 1);
    }

    #[test]
    fn first_failure_wins() {
        let mut state = RunState::new(graph(), VariablePool::new());
        state.fail(RunFailure::new(Some(NodeId::new("a")), "Timeout", "slow"));
        state.fail(RunFailure::new(None, "ExecutionTimeout", "run too slow"));
        assert_eq!(state.failure.as_ref().map(|f| f.error_type.as_str()), Some("Timeout"));
        assert_eq!(state.halt, Some(Halt::Failed));
    }

    #[test]
    fn replay_rebuilds_statuses() {
        let run_id = RunId::new();
        let events = vec![
            EngineEvent::RunStatusChanged {
                run_id,
                from: WorkflowRunStatus::Scheduled,
                to: WorkflowRunStatus::Running,
                timestamp: Utc::now(),
            },
            transition(run_id, "a", NodeStatus::NotStarted, NodeStatus::Waiting),
            transition(run_id, "a", NodeStatus::Waiting, NodeStatus::Running),
            EngineEvent::EdgeResolved {
                run_id,
                edge_id: EdgeId::new("inner"),
                state: EdgeState::Taken,
                scope: vec![IterationScope {
                    container: NodeId::new("loop"),
                    index: 0,
                }],
                timestamp: Utc::now(),
            },
        ];

        let replay = RunReplay::from_events(&events).expect("consistent history");
        assert_eq!(replay.status, Some(WorkflowRunStatus::Running));
        assert_eq!(replay.status_of(&NodeId::new("a")), NodeStatus::Running);
        assert_eq!(replay.attempts.get(&NodeId::new("a")), Some(&1));
        assert!(replay.edge_states.is_empty());
    }

    #[test]
    fn replay_rejects_gaps_and_mixed_runs() {
        let run_id = RunId::new();
        let gap = vec![transition(run_id, "a", NodeStatus::Waiting, NodeStatus::Running)];
        assert!(matches!(
            RunReplay::from_events(&gap),
            Err(ReplayError::OutOfOrder { .. })
        ));

        let mixed = vec![
            transition(run_id, "a", NodeStatus::NotStarted, NodeStatus::Waiting),
            transition(RunId::new(), "a", NodeStatus::Waiting, NodeStatus::Running),
        ];
        assert!(matches!(
            RunReplay::from_events(&mixed),
            Err(ReplayError::MixedRuns { .. })
        ));

        assert_eq!(RunReplay::from_events(&[]), Err(ReplayError::NoEvents));
    }
}
