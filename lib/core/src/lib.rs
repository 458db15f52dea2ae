//! Shared identifiers and error plumbing for tidewater.
//!
//! Everything here is deliberately small: the workflow engine and any
//! embedding service agree on how runs and graph elements are named, and
//! on the `Result` alias used at crate boundaries.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{EdgeId, NodeId, ParseIdError, RunId, WorkflowId};
