//! The executor capability.
//!
//! Task and classifier nodes do their work through an injected
//! [`NodeExecutor`]; the engine never knows whether that means calling a model
//! provider, running user code or making an HTTP request. Executors are looked
//! up by name in an [`ExecutorRegistry`].
//!
//! The deterministic fakes at the bottom of this module are what the engine's
//! own tests run against.

use crate::config::IoTimeouts;
use crate::node::Node;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tidewater_core::{NodeId, RunId};
use tokio_util::sync::CancellationToken;

/// Values handed to an executor, keyed by input binding name.
pub type ResolvedInputs = serde_json::Map<String, JsonValue>;

/// Values an executor produces, keyed by output name.
pub type NodeOutputs = serde_json::Map<String, JsonValue>;

/// Per-attempt information available to an executor.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub run_id: RunId,
    pub node_id: NodeId,
    /// 1 for the first attempt, incremented on every retry.
    pub attempt: u32,
    pub io_timeouts: IoTimeouts,
    /// Cancelled when the run is stopped or aborted.
    pub cancellation: CancellationToken,
}

impl ExecutionContext {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Trait for node execution.
///
/// Executors used under a retry policy must be idempotent; the engine does not
/// check this.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Executes a node with the given inputs.
    async fn execute(
        &self,
        node: &Node,
        inputs: ResolvedInputs,
        ctx: &ExecutionContext,
    ) -> Result<NodeOutputs, NodeExecutionError>;
}

/// Errors from node execution.
///
/// These are recoverable: the engine applies the failing node's retry policy
/// and error strategy before deciding whether the run fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeExecutionError {
    /// Input validation failed.
    InvalidInput { message: String },
    /// Execution failed.
    ExecutionFailed { message: String },
    /// External service error.
    ExternalService { service: String, message: String },
    /// The node ran past its timeout.
    Timeout { after_secs: u64 },
    /// The outputs did not match the node's declared outputs.
    OutputValidation { message: String },
    /// The execution was cancelled by a stop or an abort.
    Cancelled,
    /// A container iteration failed and was not handled inside the body.
    IterationFailed {
        index: usize,
        node_id: NodeId,
        error_type: String,
        message: String,
    },
}

impl NodeExecutionError {
    /// Stable name written to the `error_type` output field.
    #[must_use]
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidInput { .. } => "InvalidInput",
            Self::ExecutionFailed { .. } => "ExecutionFailed",
            Self::ExternalService { .. } => "ExternalServiceError",
            Self::Timeout { .. } => "Timeout",
            Self::OutputValidation { .. } => "OutputValidation",
            Self::Cancelled => "Cancelled",
            Self::IterationFailed { .. } => "IterationFailed",
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            message: message.into(),
        }
    }
}

impl fmt::Display for NodeExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInput { message } => write!(f, "invalid input: {message}"),
            Self::ExecutionFailed { message } => write!(f, "execution failed: {message}"),
            Self::ExternalService { service, message } => {
                write!(f, "external service error ({service}): {message}")
            }
            Self::Timeout { after_secs } => write!(f, "execution timed out after {after_secs}s"),
            Self::OutputValidation { message } => write!(f, "invalid outputs: {message}"),
            Self::Cancelled => write!(f, "execution cancelled"),
            Self::IterationFailed {
                index,
                node_id,
                error_type,
                message,
            } => write!(
                f,
                "iteration {index} failed at node {node_id} ({error_type}): {message}"
            ),
        }
    }
}

impl std::error::Error for NodeExecutionError {}

/// Named executors available to a run.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn NodeExecutor>>,
}

impl ExecutorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an executor, replacing any previous one with the same name.
    pub fn register(&mut self, name: impl Into<String>, executor: Arc<dyn NodeExecutor>) {
        self.executors.insert(name.into(), executor);
    }

    /// Builder form of [`register`](Self::register).
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, executor: impl NodeExecutor + 'static) -> Self {
        self.register(name, Arc::new(executor));
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(name).cloned()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.executors.contains_key(name)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.executors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("executors", &self.names())
            .finish()
    }
}

/// A simple executor that echoes inputs as output (for testing).
pub struct EchoExecutor;

#[async_trait]
impl NodeExecutor for EchoExecutor {
    async fn execute(
        &self,
        _node: &Node,
        inputs: ResolvedInputs,
        _ctx: &ExecutionContext,
    ) -> Result<NodeOutputs, NodeExecutionError> {
        Ok(inputs)
    }
}

/// A mock executor that can be configured to succeed or fail.
pub struct MockExecutor {
    /// If set, all executions will fail with this error.
    pub fail_with: Option<NodeExecutionError>,
    /// The outputs to return on success.
    pub outputs: NodeOutputs,
}

impl MockExecutor {
    /// Creates a mock executor that succeeds with the given outputs.
    ///
    /// A non-object value is wrapped as `{"output": value}`.
    #[must_use]
    pub fn succeeding(outputs: JsonValue) -> Self {
        Self {
            fail_with: None,
            outputs: into_outputs(outputs),
        }
    }

    /// Creates a mock executor that fails with the given error.
    #[must_use]
    pub fn failing(error: NodeExecutionError) -> Self {
        Self {
            fail_with: Some(error),
            outputs: NodeOutputs::new(),
        }
    }
}

#[async_trait]
impl NodeExecutor for MockExecutor {
    async fn execute(
        &self,
        _node: &Node,
        _inputs: ResolvedInputs,
        _ctx: &ExecutionContext,
    ) -> Result<NodeOutputs, NodeExecutionError> {
        match &self.fail_with {
            Some(e) => Err(e.clone()),
            None => Ok(self.outputs.clone()),
        }
    }
}

/// Fails a fixed number of times, then succeeds. Counts every call.
pub struct FlakyExecutor {
    failures: u32,
    outputs: NodeOutputs,
    calls: Arc<AtomicU32>,
}

impl FlakyExecutor {
    /// Fails the first `failures` calls, then returns `outputs`.
    ///
    /// `u32::MAX` never succeeds.
    #[must_use]
    pub fn new(failures: u32, outputs: JsonValue) -> Self {
        Self {
            failures,
            outputs: into_outputs(outputs),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Shared counter of calls made so far.
    #[must_use]
    pub fn calls(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl NodeExecutor for FlakyExecutor {
    async fn execute(
        &self,
        _node: &Node,
        _inputs: ResolvedInputs,
        ctx: &ExecutionContext,
    ) -> Result<NodeOutputs, NodeExecutionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(NodeExecutionError::failed(format!(
                "attempt {} of {} failed",
                ctx.attempt, ctx.node_id
            )));
        }
        Ok(self.outputs.clone())
    }
}

/// Sleeps before answering, honouring cancellation.
pub struct DelayExecutor {
    delay: Duration,
    outputs: NodeOutputs,
}

impl DelayExecutor {
    #[must_use]
    pub fn new(delay: Duration, outputs: JsonValue) -> Self {
        Self {
            delay,
            outputs: into_outputs(outputs),
        }
    }
}

#[async_trait]
impl NodeExecutor for DelayExecutor {
    async fn execute(
        &self,
        _node: &Node,
        _inputs: ResolvedInputs,
        ctx: &ExecutionContext,
    ) -> Result<NodeOutputs, NodeExecutionError> {
        tokio::select! {
            () = ctx.cancellation.cancelled() => Err(NodeExecutionError::Cancelled),
            () = tokio::time::sleep(self.delay) => Ok(self.outputs.clone()),
        }
    }
}

type ExecuteFn =
    dyn Fn(&Node, ResolvedInputs) -> Result<NodeOutputs, NodeExecutionError> + Send + Sync;

/// Runs a closure, for scripted behaviour in tests.
pub struct FnExecutor {
    f: Box<ExecuteFn>,
}

impl FnExecutor {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Node, ResolvedInputs) -> Result<NodeOutputs, NodeExecutionError>
            + Send
            + Sync
            + 'static,
    {
        Self { f: Box::new(f) }
    }
}

#[async_trait]
impl NodeExecutor for FnExecutor {
    async fn execute(
        &self,
        node: &Node,
        inputs: ResolvedInputs,
        _ctx: &ExecutionContext,
    ) -> Result<NodeOutputs, NodeExecutionError> {
        (self.f)(node, inputs)
    }
}

fn into_outputs(value: JsonValue) -> NodeOutputs {
    match value {
        JsonValue::Object(map) => map,
        other => {
            let mut map = NodeOutputs::new();
            map.insert("output".to_owned(), other);
            map
        }
    }
}
