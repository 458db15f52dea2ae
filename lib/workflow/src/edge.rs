//! Edges and handles.
//!
//! An edge leaves a node through a named handle. Which handles a node can emit
//! depends on its kind: plain nodes use `source`, if-else nodes `true`/`false`
//! (or a case id), classifiers a class id, fail-branch nodes
//! `success-branch`/`fail-branch`, and container bodies `loop`.

use serde::{Deserialize, Serialize};
use std::fmt;
use tidewater_core::{EdgeId, NodeId};

/// A named output port on a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Handle {
    /// The default handle.
    #[default]
    Source,
    /// If-else: the first case matched.
    True,
    /// If-else: no case matched.
    False,
    /// Fail-branch node completed normally.
    SuccessBranch,
    /// Fail-branch node failed and the failure was handled.
    FailBranch,
    /// Container continuation.
    Loop,
    /// Free-form label: a classifier class id or an if-else case id.
    Label(String),
}

impl Handle {
    /// Returns the wire name of the handle.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Source => "source",
            Self::True => "true",
            Self::False => "false",
            Self::SuccessBranch => "success-branch",
            Self::FailBranch => "fail-branch",
            Self::Loop => "loop",
            Self::Label(label) => label,
        }
    }

    /// Creates a label handle.
    pub fn label(label: impl Into<String>) -> Self {
        Self::from(label.into())
    }
}

impl From<String> for Handle {
    fn from(s: String) -> Self {
        match s.as_str() {
            "source" => Self::Source,
            "true" => Self::True,
            "false" => Self::False,
            "success-branch" => Self::SuccessBranch,
            "fail-branch" => Self::FailBranch,
            "loop" => Self::Loop,
            _ => Self::Label(s),
        }
    }
}

impl From<&str> for Handle {
    fn from(s: &str) -> Self {
        Self::from(s.to_owned())
    }
}

impl From<Handle> for String {
    fn from(handle: Handle) -> Self {
        match handle {
            Handle::Label(label) => label,
            other => other.as_str().to_owned(),
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_target_handle() -> String {
    "target".to_owned()
}

/// A directed connection between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub source: NodeId,
    #[serde(default)]
    pub source_handle: Handle,
    pub target: NodeId,
    #[serde(default = "default_target_handle")]
    pub target_handle: String,
}

impl Edge {
    /// Creates an edge leaving through the default `source` handle.
    pub fn new(id: impl Into<EdgeId>, source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            source_handle: Handle::Source,
            target: target.into(),
            target_handle: default_target_handle(),
        }
    }

    /// Sets the source handle.
    #[must_use]
    pub fn with_handle(mut self, handle: impl Into<Handle>) -> Self {
        self.source_handle = handle.into();
        self
    }

    /// Returns true if this is a container back-edge.
    #[must_use]
    pub fn is_loop(&self) -> bool {
        self.source_handle == Handle::Loop
    }
}

/// Resolution state of an edge within one run (or one container iteration).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeState {
    #[default]
    Unknown,
    Taken,
    Skipped,
}

impl EdgeState {
    /// Returns true once the edge is TAKEN or SKIPPED.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_handles_parse_to_variants() {
        assert_eq!(Handle::from("source"), Handle::Source);
        assert_eq!(Handle::from("fail-branch"), Handle::FailBranch);
        assert_eq!(Handle::from("loop"), Handle::Loop);
        assert_eq!(Handle::from("billing"), Handle::Label("billing".into()));
    }

    #[test]
    fn edge_deserializes_with_default_handles() {
        let edge: Edge = serde_json::from_value(serde_json::json!({
            "id": "e1",
            "source": "start",
            "target": "llm"
        }))
        .expect("valid edge");
        assert_eq!(edge.source_handle, Handle::Source);
        assert_eq!(edge.target_handle, "target");
        assert!(!edge.is_loop());
    }

    #[test]
    fn label_handle_serializes_as_plain_string() {
        let edge = Edge::new("e2", "classify", "refund").with_handle("class_refund");
        let json = serde_json::to_value(&edge).expect("serialize");
        assert_eq!(json["source_handle"], "class_refund");
    }

    #[test]
    fn edge_state_resolution() {
        assert!(!EdgeState::Unknown.is_resolved());
        assert!(EdgeState::Taken.is_resolved());
        assert!(EdgeState::Skipped.is_resolved());
    }
}
