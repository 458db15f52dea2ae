//! Run and node state machines, and the lifecycle events they emit.
//!
//! The engine is the only writer of these states. Every change is published
//! as an [`EngineEvent`] to the injected [`EventSink`] and kept in the run's
//! history, so observers can follow a run without touching engine state.

use crate::edge::EdgeState;
use crate::error::EngineError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tidewater_core::{EdgeId, NodeId, RunId};
use tokio::sync::mpsc;

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowRunStatus {
    Scheduled,
    Running,
    Succeeded,
    Failed,
    PartialSucceeded,
    Stopped,
    Paused,
}

impl WorkflowRunStatus {
    /// Returns true if the run can make no further progress.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::PartialSucceeded | Self::Stopped
        )
    }

    /// Returns true if the run may move from `self` to `to`.
    #[must_use]
    pub fn can_transition_to(&self, to: Self) -> bool {
        match self {
            Self::Scheduled => matches!(to, Self::Running | Self::Stopped),
            Self::Running => to != Self::Scheduled && to != Self::Running,
            Self::Paused => matches!(to, Self::Running | Self::Stopped),
            _ => false,
        }
    }
}

/// Status of one node within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    #[default]
    NotStarted,
    /// Dependencies satisfied, queued for dispatch.
    Waiting,
    Running,
    /// Failed, another attempt is scheduled.
    Retry,
    Succeeded,
    Failed,
    /// Failed, and the failure was handled by the node's error strategy.
    Exception,
    Stopped,
    Skipped,
}

impl NodeStatus {
    /// Returns true if the node will not change status again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Exception | Self::Stopped | Self::Skipped
        )
    }

    /// Returns true if a node in this status holds a worker slot or is parked.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Retry)
    }

    /// Returns true if the node may move from `self` to `to`.
    #[must_use]
    pub fn can_transition_to(&self, to: Self) -> bool {
        match self {
            Self::NotStarted => matches!(to, Self::Waiting | Self::Skipped | Self::Stopped),
            Self::Waiting => matches!(to, Self::Running | Self::Stopped),
            Self::Running => matches!(
                to,
                Self::Succeeded | Self::Failed | Self::Exception | Self::Stopped | Self::Retry
            ),
            Self::Retry => matches!(to, Self::Running | Self::Stopped),
            _ => false,
        }
    }
}

/// Error detail recorded on a node that failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFailure {
    pub error_type: String,
    pub message: String,
}

/// Mutable per-node state, one per node per run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeRuntimeState {
    pub status: NodeStatus,
    pub attempt_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<NodeFailure>,
    /// Extra facts about the execution, such as a container's iteration count.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, JsonValue>,
}

impl NodeRuntimeState {
    /// Moves to `to`, returning the previous status.
    ///
    /// Entering RUNNING counts an attempt; entering a terminal status stamps
    /// `finished_at`.
    pub(crate) fn transition(
        &mut self,
        node_id: &NodeId,
        to: NodeStatus,
        at: DateTime<Utc>,
    ) -> Result<NodeStatus, EngineError> {
        let from = self.status;
        if !from.can_transition_to(to) {
            return Err(EngineError::InvalidTransition {
                node_id: node_id.clone(),
                from,
                to,
            });
        }
        self.status = to;
        if to == NodeStatus::Running {
            self.attempt_count += 1;
            self.started_at.get_or_insert(at);
        }
        if to.is_terminal() {
            self.finished_at = Some(at);
        }
        Ok(from)
    }
}

/// Position of an event inside nested container iterations, outermost first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IterationScope {
    pub container: NodeId,
    pub index: usize,
}

/// A node status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTransition {
    pub run_id: RunId,
    pub node_id: NodeId,
    pub from: NodeStatus,
    pub to: NodeStatus,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scope: Vec<IterationScope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<serde_json::Map<String, JsonValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeFailure>,
}

/// Everything an observer can see of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    RunStatusChanged {
        run_id: RunId,
        from: WorkflowRunStatus,
        to: WorkflowRunStatus,
        timestamp: DateTime<Utc>,
    },
    NodeTransition(NodeTransition),
    EdgeResolved {
        run_id: RunId,
        edge_id: EdgeId,
        state: EdgeState,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        scope: Vec<IterationScope>,
        timestamp: DateTime<Utc>,
    },
    IterationStarted {
        run_id: RunId,
        container: NodeId,
        index: usize,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        scope: Vec<IterationScope>,
        timestamp: DateTime<Utc>,
    },
    IterationCompleted {
        run_id: RunId,
        container: NodeId,
        index: usize,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        scope: Vec<IterationScope>,
        timestamp: DateTime<Utc>,
    },
}

impl EngineEvent {
    /// Returns the run this event belongs to.
    #[must_use]
    pub fn run_id(&self) -> RunId {
        match self {
            Self::RunStatusChanged { run_id, .. }
            | Self::EdgeResolved { run_id, .. }
            | Self::IterationStarted { run_id, .. }
            | Self::IterationCompleted { run_id, .. } => *run_id,
            Self::NodeTransition(t) => t.run_id,
        }
    }

    /// Returns the time the event was recorded.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::RunStatusChanged { timestamp, .. }
            | Self::EdgeResolved { timestamp, .. }
            | Self::IterationStarted { timestamp, .. }
            | Self::IterationCompleted { timestamp, .. } => *timestamp,
            Self::NodeTransition(t) => t.timestamp,
        }
    }

    /// Returns the node transition, if this is one.
    #[must_use]
    pub fn as_node_transition(&self) -> Option<&NodeTransition> {
        match self {
            Self::NodeTransition(t) => Some(t),
            _ => None,
        }
    }
}

/// Receives lifecycle events as the engine produces them.
///
/// Delivery order matches emission order. Sinks should return quickly; the
/// engine awaits each publish before continuing.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &EngineEvent);
}

/// Forwards events into an unbounded channel.
///
/// Events are dropped silently once the receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    sender: mpsc::UnboundedSender<EngineEvent>,
}

impl ChannelEventSink {
    /// Creates a sink and the receiver that observes it.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl EventSink for ChannelEventSink {
    async fn publish(&self, event: &EngineEvent) {
        let _ = self.sender.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_terminal_states() {
        assert!(WorkflowRunStatus::Succeeded.is_terminal());
        assert!(WorkflowRunStatus::PartialSucceeded.is_terminal());
        assert!(!WorkflowRunStatus::Paused.is_terminal());
        assert!(!WorkflowRunStatus::Running.is_terminal());
    }

    #[test]
    fn run_status_transitions() {
        use WorkflowRunStatus as S;
        assert!(S::Scheduled.can_transition_to(S::Running));
        assert!(S::Running.can_transition_to(S::Paused));
        assert!(S::Paused.can_transition_to(S::Running));
        assert!(!S::Succeeded.can_transition_to(S::Running));
        assert!(!S::Scheduled.can_transition_to(S::Succeeded));
    }

    #[test]
    fn node_lifecycle_counts_attempts() {
        let node = NodeId::new("n");
        let now = Utc::now();
        let mut state = NodeRuntimeState::default();

        state.transition(&node, NodeStatus::Waiting, now).expect("ready");
        state.transition(&node, NodeStatus::Running, now).expect("run");
        state.transition(&node, NodeStatus::Retry, now).expect("retry");
        state.transition(&node, NodeStatus::Running, now).expect("rerun");
        let from = state
            .transition(&node, NodeStatus::Succeeded, now)
            .expect("done");

        assert_eq!(from, NodeStatus::Running);
        assert_eq!(state.attempt_count, 2);
        assert_eq!(state.finished_at, Some(now));
    }

    #[test]
    fn illegal_node_transition_is_rejected() {
        let node = NodeId::new("n");
        let mut state = NodeRuntimeState::default();
        let err = state
            .transition(&node, NodeStatus::Succeeded, Utc::now())
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::InvalidTransition {
                node_id: node,
                from: NodeStatus::NotStarted,
                to: NodeStatus::Succeeded,
            }
        );
        assert_eq!(state.status, NodeStatus::NotStarted);
    }

    #[test]
    fn skipped_is_terminal_and_final() {
        assert!(NodeStatus::Skipped.is_terminal());
        assert!(!NodeStatus::Skipped.can_transition_to(NodeStatus::Waiting));
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let event = EngineEvent::EdgeResolved {
            run_id: RunId::new(),
            edge_id: EdgeId::new("e1"),
            state: EdgeState::Skipped,
            scope: Vec::new(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "edge_resolved");
        assert_eq!(json["state"], "SKIPPED");

        let parsed: EngineEvent = serde_json::from_value(json).expect("deserialize");
        assert_eq!(parsed, event);
    }

    #[tokio::test]
    async fn channel_sink_forwards_in_order() {
        let (sink, mut rx) = ChannelEventSink::new();
        let run_id = RunId::new();
        for to in [WorkflowRunStatus::Running, WorkflowRunStatus::Succeeded] {
            sink.publish(&EngineEvent::RunStatusChanged {
                run_id,
                from: WorkflowRunStatus::Scheduled,
                to,
                timestamp: Utc::now(),
            })
            .await;
        }

        let first = rx.recv().await.expect("first");
        let second = rx.recv().await.expect("second");
        assert!(matches!(first, EngineEvent::RunStatusChanged { to: WorkflowRunStatus::Running, .. }));
        assert!(matches!(second, EngineEvent::RunStatusChanged { to: WorkflowRunStatus::Succeeded, .. }));
    }
}
