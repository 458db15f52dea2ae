//! Selectors address values in the variable pool.
//!
//! A selector is a node id followed by a non-empty field path. Path segments
//! are either object keys or array indices, so `["llm", "usage", "tokens"]`
//! and `["search", "results", 0, "url"]` are both valid.

use serde::{Deserialize, Serialize};
use std::fmt;
use tidewater_core::NodeId;

/// Namespace for values supplied by the caller about the run itself.
pub const SYS_NAMESPACE: &str = "sys";
/// Namespace for workflow environment variables.
pub const ENV_NAMESPACE: &str = "env";
/// Namespace for conversation variables.
pub const CONVERSATION_NAMESPACE: &str = "conversation";

/// Namespaces seeded before the run starts. Nodes may read but never write them.
pub const RESERVED_NAMESPACES: [&str; 3] = [SYS_NAMESPACE, ENV_NAMESPACE, CONVERSATION_NAMESPACE];

/// Returns true if `node_id` names one of the read-only seeded namespaces.
#[must_use]
pub fn is_reserved_namespace(node_id: &NodeId) -> bool {
    RESERVED_NAMESPACES.contains(&node_id.as_str())
}

/// One step of a field path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    /// Array position.
    Index(usize),
    /// Object key.
    Key(String),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(i) => write!(f, "{i}"),
            Self::Key(k) => f.write_str(k),
        }
    }
}

impl From<&str> for PathSegment {
    fn from(s: &str) -> Self {
        Self::Key(s.to_owned())
    }
}

impl From<String> for PathSegment {
    fn from(s: String) -> Self {
        Self::Key(s)
    }
}

impl From<usize> for PathSegment {
    fn from(i: usize) -> Self {
        Self::Index(i)
    }
}

/// Error produced when a selector is malformed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorError {
    /// The selector has no node id.
    Empty,
    /// The first segment is an index instead of a node id.
    NodeIdNotKey,
    /// The selector names a node but no field.
    MissingField { node_id: NodeId },
}

impl fmt::Display for SelectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "selector is empty"),
            Self::NodeIdNotKey => write!(f, "selector must start with a node id"),
            Self::MissingField { node_id } => {
                write!(f, "selector for node {node_id} has no field path")
            }
        }
    }
}

impl std::error::Error for SelectorError {}

/// Address of a produced value: `(node_id, field_path...)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Vec<PathSegment>", into = "Vec<PathSegment>")]
pub struct Selector {
    node_id: NodeId,
    path: Vec<PathSegment>,
}

impl Selector {
    /// Creates a selector from a node id and a non-empty path.
    pub fn new(
        node_id: impl Into<NodeId>,
        path: impl IntoIterator<Item = PathSegment>,
    ) -> Result<Self, SelectorError> {
        let node_id = node_id.into();
        let path: Vec<PathSegment> = path.into_iter().collect();
        if path.is_empty() {
            return Err(SelectorError::MissingField { node_id });
        }
        Ok(Self { node_id, path })
    }

    /// Creates a selector for a top-level field of a node.
    pub fn field(node_id: impl Into<NodeId>, field: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            path: vec![PathSegment::Key(field.into())],
        }
    }

    /// Parses dotted notation such as `start.query` or `search.results.0.url`.
    ///
    /// Purely numeric segments after the node id become array indices.
    pub fn parse(dotted: &str) -> Result<Self, SelectorError> {
        let mut parts = dotted.split('.').filter(|p| !p.is_empty());
        let node_id = parts.next().ok_or(SelectorError::Empty)?;
        let path = parts.map(|p| match p.parse::<usize>() {
            Ok(i) => PathSegment::Index(i),
            Err(_) => PathSegment::Key(p.to_owned()),
        });
        Self::new(node_id, path)
    }

    /// The node that produces the value.
    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// The field path within the node's outputs.
    #[must_use]
    pub fn path(&self) -> &[PathSegment] {
        &self.path
    }

    /// The top-level output field this selector reads.
    #[must_use]
    pub fn root_field(&self) -> &PathSegment {
        &self.path[0]
    }

    /// Returns true if the selector reads a seeded namespace.
    #[must_use]
    pub fn is_reserved(&self) -> bool {
        is_reserved_namespace(&self.node_id)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.node_id)?;
        for segment in &self.path {
            write!(f, ".{segment}")?;
        }
        Ok(())
    }
}

impl TryFrom<Vec<PathSegment>> for Selector {
    type Error = SelectorError;

    fn try_from(mut segments: Vec<PathSegment>) -> Result<Self, Self::Error> {
        if segments.is_empty() {
            return Err(SelectorError::Empty);
        }
        let PathSegment::Key(node_id) = segments.remove(0) else {
            return Err(SelectorError::NodeIdNotKey);
        };
        Self::new(node_id, segments)
    }
}

impl From<Selector> for Vec<PathSegment> {
    fn from(selector: Selector) -> Self {
        let mut segments = Vec::with_capacity(selector.path.len() + 1);
        segments.push(PathSegment::Key(selector.node_id.as_str().to_owned()));
        segments.extend(selector.path);
        segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_dotted_with_index() {
        let sel = Selector::parse("search.results.0.url").expect("valid");
        assert_eq!(sel.node_id().as_str(), "search");
        assert_eq!(
            sel.path(),
            &[
                PathSegment::Key("results".into()),
                PathSegment::Index(0),
                PathSegment::Key("url".into()),
            ]
        );
        assert_eq!(sel.to_string(), "search.results.0.url");
    }

    #[test]
    fn node_only_selector_is_rejected() {
        assert_eq!(
            Selector::parse("start"),
            Err(SelectorError::MissingField {
                node_id: NodeId::new("start")
            })
        );
        assert_eq!(Selector::parse(""), Err(SelectorError::Empty));
    }

    #[test]
    fn deserializes_from_json_array() {
        let sel: Selector = serde_json::from_str(r#"["start", "items", 2]"#).expect("valid");
        assert_eq!(sel, Selector::parse("start.items.2").expect("valid"));

        let json = serde_json::to_value(&sel).expect("serialize");
        assert_eq!(json, serde_json::json!(["start", "items", 2]));
    }

    #[test]
    fn leading_index_is_rejected() {
        let result: Result<Selector, _> = serde_json::from_str("[3, \"x\"]");
        assert!(result.is_err());
    }

    #[test]
    fn reserved_namespaces() {
        assert!(Selector::field("sys", "user_id").is_reserved());
        assert!(Selector::field("env", "API_BASE").is_reserved());
        assert!(!Selector::field("llm", "text").is_reserved());
    }
}
