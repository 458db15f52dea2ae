//! Identifier types.
//!
//! Runs and workflow definitions are named by ULIDs and display with a short
//! type prefix (`run_01H...`). Nodes and edges are named by the graph author,
//! so their ids are opaque strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use ulid::Ulid;

/// Error returned when parsing an ID from a string fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError {
    /// The type of ID that failed to parse.
    pub id_type: &'static str,
    /// Why parsing failed.
    pub reason: String,
}

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to parse {}: {}", self.id_type, self.reason)
    }
}

impl std::error::Error for ParseIdError {}

/// Defines a ULID-backed id that displays as `{prefix}_{ulid}`.
macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            /// Creates a fresh id.
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Returns the underlying ULID.
            #[must_use]
            pub const fn as_ulid(&self) -> Ulid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let raw = s.strip_prefix(concat!($prefix, "_")).unwrap_or(s);
                Ulid::from_str(raw).map(Self).map_err(|e| ParseIdError {
                    id_type: stringify!($name),
                    reason: e.to_string(),
                })
            }
        }
    };
}

/// Defines an author-chosen string id.
macro_rules! key_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps an author-provided identifier.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

ulid_id!(
    /// Identifies a workflow definition.
    WorkflowId,
    "wf"
);

ulid_id!(
    /// Identifies one execution of a workflow.
    RunId,
    "run"
);

key_id!(
    /// Identifies a node within a graph.
    NodeId
);

key_id!(
    /// Identifies an edge within a graph.
    EdgeId
);

/// Last millisecond value handed out by [`NodeId::generate`].
static LAST_GENERATED: AtomicI64 = AtomicI64::new(0);

impl NodeId {
    /// Generates a node id from the current time in milliseconds.
    ///
    /// Ids are strictly increasing within a process, so two calls in the same
    /// millisecond still yield distinct values.
    #[must_use]
    pub fn generate() -> Self {
        Self::generate_batch(1).remove(0)
    }

    /// Generates `count` consecutive node ids.
    #[must_use]
    pub fn generate_batch(count: usize) -> Vec<Self> {
        if count == 0 {
            return Vec::new();
        }
        let now = chrono::Utc::now().timestamp_millis();
        let span = count as i64;
        let mut first = now;
        let _ = LAST_GENERATED.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            first = now.max(last + 1);
            Some(first + span - 1)
        });
        (0..span).map(|i| Self((first + i).to_string())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_display_has_prefix() {
        assert!(RunId::new().to_string().starts_with("run_"));
        assert!(WorkflowId::new().to_string().starts_with("wf_"));
    }

    #[test]
    fn run_id_parses_with_and_without_prefix() {
        let id = RunId::new();
        let parsed: RunId = id.to_string().parse().expect("prefixed");
        assert_eq!(id, parsed);

        let bare: RunId = id.as_ulid().to_string().parse().expect("bare");
        assert_eq!(id, bare);
    }

    #[test]
    fn run_id_rejects_garbage() {
        let err = "run_nope".parse::<RunId>().unwrap_err();
        assert_eq!(err.id_type, "RunId");
    }

    #[test]
    fn node_id_serializes_as_plain_string() {
        let id = NodeId::new("llm_1");
        assert_eq!(serde_json::to_string(&id).expect("serialize"), "\"llm_1\"");
        assert_eq!(id.to_string(), "llm_1");
    }

    #[test]
    fn generated_node_ids_are_numeric_and_unique() {
        let ids = NodeId::generate_batch(5);
        assert_eq!(ids.len(), 5);

        let values: Vec<i64> = ids
            .iter()
            .map(|id| id.as_str().parse().expect("numeric"))
            .collect();
        assert!(values.windows(2).all(|w| w[1] == w[0] + 1));

        let next: i64 = NodeId::generate().as_str().parse().expect("numeric");
        assert!(next > values[4]);
    }

    #[test]
    fn empty_batch_is_empty() {
        assert!(NodeId::generate_batch(0).is_empty());
    }
}
