//! Workflow graph execution engine for tidewater.
//!
//! This crate provides:
//!
//! - **Graph Model**: Typed nodes joined by handle-labelled edges, with
//!   iteration and loop containers that own a body sub-graph
//! - **Validation**: Structural checks run before any execution
//! - **Variable Pool**: Scoped, write-once storage addressed by selectors
//! - **Execution**: A per-run event loop that dispatches ready nodes to a
//!   bounded worker pool, applies retry and error-handling policies, and
//!   publishes every state change as an [`EngineEvent`]
//!
//! Node behaviour that talks to the outside world (models, code sandboxes,
//! HTTP) is supplied by the embedder through [`NodeExecutor`]s registered in
//! an [`ExecutorRegistry`].

pub mod condition;
pub mod config;
mod container;
pub mod definition;
pub mod edge;
pub mod edge_processor;
pub mod engine;
pub mod error;
pub mod execution;
pub mod executor;
pub mod graph;
pub mod node;
pub mod run_state;
pub mod schema;
pub mod selector;
pub mod validator;
pub mod variable_pool;
pub mod worker;

pub use condition::{ComparisonOperator, Condition, LogicalOperator};
pub use config::{EngineConfig, IoTimeouts};
pub use definition::{RunSeed, WorkflowDefinition, WorkflowMetadata, WorkflowSummary};
pub use edge::{Edge, EdgeState, Handle};
pub use engine::{GraphEngine, PausedRun, RunOutcome, StopHandle};
pub use error::{EngineError, GraphError, StructuralError};
pub use execution::{
    ChannelEventSink, EngineEvent, EventSink, NodeRuntimeState, NodeStatus, NodeTransition,
    WorkflowRunStatus,
};
pub use executor::{
    ExecutionContext, ExecutorRegistry, NodeExecutionError, NodeExecutor, NodeOutputs,
    ResolvedInputs,
};
pub use graph::WorkflowGraph;
pub use node::{ErrorStrategy, Node, NodeKind, RetryConfig};
pub use run_state::{RunFailure, RunReplay};
pub use schema::{OutputDecl, VarType};
pub use selector::Selector;
pub use validator::{GraphValidator, ValidationReport, ValidationWarning};
pub use variable_pool::{PoolSnapshot, VariablePool};
pub use tidewater_core::{EdgeId, NodeId, RunId, WorkflowId};
