//! The variable pool: every value produced during a run, addressed by
//! `(node_id, field_path)`.
//!
//! Pools are layered. The run owns a root pool seeded with the `sys`, `env`
//! and `conversation` namespaces; each container iteration gets a child layer
//! whose writes never reach the parent. Lookups walk from the innermost layer
//! outwards.
//!
//! Only the engine loop writes to a pool, and it writes all of a node's
//! outputs in one call, so readers never observe a partially completed node.

use crate::selector::{PathSegment, Selector, is_reserved_namespace};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tidewater_core::NodeId;

/// Errors from pool reads and writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The selector does not resolve to a committed value.
    Unresolved { selector: Selector },
    /// The key was already written in this scope.
    Conflict { node_id: NodeId, path: String },
    /// Attempted write to a seeded namespace.
    ReadOnlyNamespace { namespace: NodeId },
    /// Attempted write with an empty field path.
    EmptyPath { node_id: NodeId },
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unresolved { selector } => write!(f, "unresolved variable: {selector}"),
            Self::Conflict { node_id, path } => {
                write!(f, "variable {node_id}.{path} written twice in one scope")
            }
            Self::ReadOnlyNamespace { namespace } => {
                write!(f, "namespace '{namespace}' is read-only")
            }
            Self::EmptyPath { node_id } => write!(f, "write to {node_id} has an empty field path"),
        }
    }
}

impl std::error::Error for PoolError {}

type FieldMap = BTreeMap<Vec<PathSegment>, JsonValue>;

/// Layered store of produced values.
#[derive(Debug, Clone, Default)]
pub struct VariablePool {
    values: HashMap<NodeId, FieldMap>,
    parent: Option<Arc<VariablePool>>,
}

/// Values pre-populated into the read-only namespaces.
#[derive(Debug, Clone, Default, PartialEq, Serialize, serde::Deserialize)]
pub struct NamespaceSeed {
    #[serde(default)]
    pub sys: serde_json::Map<String, JsonValue>,
    #[serde(default)]
    pub env: serde_json::Map<String, JsonValue>,
    #[serde(default)]
    pub conversation: serde_json::Map<String, JsonValue>,
}

impl VariablePool {
    /// Creates an empty root pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a root pool with the seeded namespaces populated.
    #[must_use]
    pub fn seeded(seed: &NamespaceSeed) -> Self {
        let mut pool = Self::new();
        for (namespace, values) in [
            (crate::selector::SYS_NAMESPACE, &seed.sys),
            (crate::selector::ENV_NAMESPACE, &seed.env),
            (crate::selector::CONVERSATION_NAMESPACE, &seed.conversation),
        ] {
            let fields = pool.values.entry(NodeId::new(namespace)).or_default();
            for (name, value) in values {
                fields.insert(vec![PathSegment::Key(name.clone())], value.clone());
            }
        }
        pool
    }

    /// Creates a child layer over `parent`.
    #[must_use]
    pub fn scoped(parent: Arc<VariablePool>) -> Self {
        Self {
            values: HashMap::new(),
            parent: Some(parent),
        }
    }

    /// Number of enclosing layers.
    #[must_use]
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut layer = self.parent.as_deref();
        while let Some(pool) = layer {
            depth += 1;
            layer = pool.parent.as_deref();
        }
        depth
    }

    /// Writes one value.
    ///
    /// A key may be written once per scope. Writing a path that is a prefix or
    /// extension of an existing key in the same scope is also a conflict,
    /// since reads would become ambiguous.
    pub fn put(
        &mut self,
        node_id: &NodeId,
        path: Vec<PathSegment>,
        value: JsonValue,
    ) -> Result<(), PoolError> {
        self.check_writable(node_id, &path)?;
        self.values
            .entry(node_id.clone())
            .or_default()
            .insert(path, value);
        Ok(())
    }

    /// Writes all top-level outputs of a node, or none of them.
    pub fn put_outputs(
        &mut self,
        node_id: &NodeId,
        outputs: &serde_json::Map<String, JsonValue>,
    ) -> Result<(), PoolError> {
        for name in outputs.keys() {
            self.check_writable(node_id, &[PathSegment::Key(name.clone())])?;
        }
        let fields = self.values.entry(node_id.clone()).or_default();
        for (name, value) in outputs {
            fields.insert(vec![PathSegment::Key(name.clone())], value.clone());
        }
        Ok(())
    }

    fn check_writable(&self, node_id: &NodeId, path: &[PathSegment]) -> Result<(), PoolError> {
        if is_reserved_namespace(node_id) {
            return Err(PoolError::ReadOnlyNamespace {
                namespace: node_id.clone(),
            });
        }
        if path.is_empty() {
            return Err(PoolError::EmptyPath {
                node_id: node_id.clone(),
            });
        }
        if let Some(fields) = self.values.get(node_id) {
            let overlaps = fields.keys().any(|existing| {
                let n = existing.len().min(path.len());
                existing[..n] == path[..n]
            });
            if overlaps {
                return Err(PoolError::Conflict {
                    node_id: node_id.clone(),
                    path: join_path(path),
                });
            }
        }
        Ok(())
    }

    /// Resolves a selector against this layer and its ancestors.
    pub fn get(&self, selector: &Selector) -> Result<&JsonValue, PoolError> {
        let mut layer = Some(self);
        while let Some(pool) = layer {
            if let Some(value) = pool.lookup(selector) {
                return Ok(value);
            }
            layer = pool.parent.as_deref();
        }
        Err(PoolError::Unresolved {
            selector: selector.clone(),
        })
    }

    /// Resolves a selector, returning `None` instead of an error.
    #[must_use]
    pub fn try_get(&self, selector: &Selector) -> Option<&JsonValue> {
        self.get(selector).ok()
    }

    /// Returns true if any layer holds a value for the node.
    #[must_use]
    pub fn has_node(&self, node_id: &NodeId) -> bool {
        self.values.contains_key(node_id)
            || self.parent.as_deref().is_some_and(|p| p.has_node(node_id))
    }

    fn lookup(&self, selector: &Selector) -> Option<&JsonValue> {
        let fields = self.values.get(selector.node_id())?;
        let path = selector.path();
        // Longest stored prefix wins, then descend into the stored value.
        (1..=path.len()).rev().find_map(|split| {
            fields
                .get(&path[..split])
                .and_then(|value| descend(value, &path[split..]))
        })
    }

    /// Returns an immutable flattened view of every visible value.
    ///
    /// Inner layers shadow outer ones.
    #[must_use]
    pub fn snapshot(&self) -> PoolSnapshot {
        let mut entries = match self.parent.as_deref() {
            Some(parent) => parent.snapshot().entries,
            None => BTreeMap::new(),
        };
        for (node_id, fields) in &self.values {
            for (path, value) in fields {
                entries.insert(format!("{node_id}.{}", join_path(path)), value.clone());
            }
        }
        PoolSnapshot { entries }
    }
}

fn descend<'a>(mut value: &'a JsonValue, rest: &[PathSegment]) -> Option<&'a JsonValue> {
    for segment in rest {
        value = match (segment, value) {
            (PathSegment::Key(key), JsonValue::Object(map)) => map.get(key)?,
            (PathSegment::Index(i), JsonValue::Array(items)) => items.get(*i)?,
            (PathSegment::Key(key), JsonValue::Array(items)) => {
                items.get(key.parse::<usize>().ok()?)?
            }
            _ => return None,
        };
    }
    Some(value)
}

fn join_path(path: &[PathSegment]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

/// Point-in-time copy of a pool, keyed by dotted selector.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct PoolSnapshot {
    entries: BTreeMap<String, JsonValue>,
}

impl PoolSnapshot {
    /// Returns the value stored under a dotted key such as `llm.text`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.entries.get(key)
    }

    /// Iterates entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &JsonValue)> {
        self.entries.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
