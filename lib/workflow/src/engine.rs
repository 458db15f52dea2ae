//! The graph engine.
//!
//! One [`ScopeRunner`] drives one graph: the workflow itself, or one iteration
//! of a container body. It owns that scope's [`RunState`] and is its only
//! writer. Ready nodes are dispatched either inline (start, end, branches,
//! aggregators, markers) or to the [`WorkerPool`]; completions come back as
//! [`WorkerEvent`]s on the scope's channel and are applied one at a time.
//!
//! Containers are pool jobs whose driver runs their body through a fresh
//! `ScopeRunner`, on a scoped variable pool and a child of the worker pool.

use crate::condition::evaluate_all;
use crate::config::EngineConfig;
use crate::container::ContainerRun;
use crate::definition::RunSeed;
use crate::edge::{EdgeState, Handle};
use crate::error::EngineError;
use crate::execution::{
    EngineEvent, EventSink, IterationScope, NodeFailure, NodeRuntimeState, NodeStatus,
    NodeTransition, WorkflowRunStatus,
};
use crate::executor::{ExecutionContext, ExecutorRegistry, NodeExecutionError, ResolvedInputs};
use crate::graph::WorkflowGraph;
use crate::node::{
    ERROR_MESSAGE_FIELD, ERROR_TYPE_FIELD, ErrorStrategy, LoopValue, Node, NodeKind,
};
use crate::run_state::{Halt, RunFailure, RunState};
use crate::schema::check_outputs;
use crate::selector::Selector;
use crate::validator::{GraphValidator, ValidationWarning};
use crate::variable_pool::{PoolSnapshot, VariablePool};
use crate::worker::{Job, JobOutcome, WorkerEvent, WorkerEventKind, WorkerPool};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tidewater_core::{EdgeId, NodeId, RunId};
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Keeps a run's event history and forwards each event to the sink.
pub(crate) struct EventRecorder {
    history: Mutex<Vec<EngineEvent>>,
    sink: Option<Arc<dyn EventSink>>,
}

impl EventRecorder {
    /// Publishes and stores an event.
    ///
    /// The history lock is held across the publish so the sink sees events
    /// in history order, even when container bodies record concurrently.
    pub(crate) async fn record(&self, event: EngineEvent) {
        let mut history = self.history.lock().await;
        if let Some(sink) = &self.sink {
            sink.publish(&event).await;
        }
        history.push(event);
    }

    async fn history(&self) -> Vec<EngineEvent> {
        self.history.lock().await.clone()
    }
}

/// State shared by every scope of one run.
pub(crate) struct RunContext {
    pub(crate) run_id: RunId,
    pub(crate) registry: Arc<ExecutorRegistry>,
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) recorder: EventRecorder,
    steps: AtomicU32,
    deadline: Instant,
    /// Values for the start node.
    inputs: serde_json::Map<String, JsonValue>,
}

impl RunContext {
    fn new(
        run_id: RunId,
        engine: &GraphEngine,
        inputs: serde_json::Map<String, JsonValue>,
        history: Vec<EngineEvent>,
        steps: u32,
    ) -> Self {
        Self {
            run_id,
            registry: Arc::clone(&engine.registry),
            config: Arc::clone(&engine.config),
            recorder: EventRecorder {
                history: Mutex::new(history),
                sink: engine.sink.clone(),
            },
            steps: AtomicU32::new(steps),
            deadline: Instant::now() + engine.config.max_execution_time(),
            inputs,
        }
    }

    fn next_step(&self) -> u32 {
        self.steps.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn steps(&self) -> u32 {
        self.steps.load(Ordering::SeqCst)
    }
}

/// The node whose success completes a scope.
#[derive(Debug, Clone)]
pub(crate) enum Terminal {
    /// Any `end` node of the workflow.
    Response,
    /// The end marker of a container body.
    Marker(NodeId),
}

impl Terminal {
    fn matches(&self, node: &Node) -> bool {
        match self {
            Self::Response => node.is_response(),
            Self::Marker(end) => &node.id == end,
        }
    }
}

enum Wake {
    Cancelled,
    Deadline,
    Worker(Option<WorkerEvent>),
}

/// Runs a graph from `root` until it completes, fails, stops or goes idle.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_scope(
    ctx: Arc<RunContext>,
    graph: Arc<WorkflowGraph>,
    terminal: Terminal,
    scope: Vec<IterationScope>,
    pool: WorkerPool,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    layer: VariablePool,
    root: &NodeId,
) -> RunState {
    let mut state = RunState::new(graph, layer);
    let mut runner = ScopeRunner {
        ctx,
        terminal,
        scope,
        pool,
        events,
    };
    state.ready.push_back(root.clone());
    runner.drive(&mut state).await;
    state
}

/// The event loop of one scope.
pub(crate) struct ScopeRunner {
    ctx: Arc<RunContext>,
    terminal: Terminal,
    scope: Vec<IterationScope>,
    pool: WorkerPool,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
}

impl ScopeRunner {
    async fn drive(&mut self, state: &mut RunState) {
        loop {
            if !state.is_halted() && self.pool.cancellation().is_cancelled() {
                state.halt(Halt::Stopped);
            }
            if !state.is_halted() {
                if let Err(error) = self.dispatch_ready(state).await {
                    self.fatal(state, error);
                }
            }
            if state.is_idle() || (state.is_halted() && state.in_flight.is_empty()) {
                break;
            }

            let halted = state.is_halted();
            let wake = tokio::select! {
                () = self.pool.cancellation().cancelled(), if !halted => Wake::Cancelled,
                () = tokio::time::sleep_until(self.ctx.deadline), if !halted => Wake::Deadline,
                event = self.events.recv() => Wake::Worker(event),
            };

            match wake {
                Wake::Cancelled => {
                    if self.scope.is_empty() {
                        info!("stop requested");
                    } else {
                        debug!(scope_depth = self.scope.len(), "scope cancelled");
                    }
                    state.halt(Halt::Stopped);
                }
                Wake::Deadline => {
                    let limit = self.ctx.config.max_execution_time_secs;
                    error!(limit_secs = limit, "run exceeded its time limit");
                    state.fail(RunFailure::new(
                        None,
                        "ExecutionTimeout",
                        format!("run exceeded {limit}s"),
                    ));
                    self.pool.cancel();
                }
                Wake::Worker(Some(event)) => {
                    if let Err(error) = self.on_worker_event(state, event).await {
                        self.fatal(state, error);
                    }
                }
                Wake::Worker(None) => break,
            }
        }
        self.settle(state).await;
    }

    /// Resumes a paused node with `input` as its outputs, then drives on.
    async fn resume(&mut self, state: &mut RunState, node: &Node, input: ResolvedInputs) {
        if let Err(error) = self.complete(state, node, JobOutcome::succeeded(input)).await {
            self.fatal(state, error);
        }
        self.drive(state).await;
    }

    fn fatal(&self, state: &mut RunState, error: EngineError) {
        error!(%error, "fatal engine error");
        state.fatal.get_or_insert(error);
        state.halt(Halt::Failed);
        self.pool.cancel();
    }

    /// Applies the end-of-loop rules for a halted scope.
    ///
    /// Parked nodes are stopped. On a stop request every node that never
    /// started is stopped too; otherwise those stay NOT_STARTED.
    async fn settle(&mut self, state: &mut RunState) {
        if !state.is_halted() {
            return;
        }
        state.ready.clear();
        let mut leftover: Vec<NodeId> = std::mem::take(&mut state.awaiting_input)
            .into_iter()
            .collect();
        if state.halt == Some(Halt::Stopped) {
            let mut not_started: Vec<NodeId> = state
                .node_states
                .iter()
                .filter(|(_, s)| s.status == NodeStatus::NotStarted)
                .map(|(id, _)| id.clone())
                .collect();
            not_started.sort();
            leftover.extend(not_started);
        }
        for node_id in leftover {
            if let Err(error) = self
                .transition(state, &node_id, NodeStatus::Stopped, None, None)
                .await
            {
                state.fatal.get_or_insert(error);
            }
        }
    }

    async fn dispatch_ready(&mut self, state: &mut RunState) -> Result<(), EngineError> {
        while !state.is_halted() {
            let Some(node_id) = state.ready.pop_front() else {
                break;
            };
            let limit = self.ctx.config.max_execution_steps;
            if self.ctx.next_step() > limit {
                warn!(node_id = %node_id, limit, "step limit reached");
                state.fail(RunFailure::new(
                    None,
                    "MaxStepsExceeded",
                    format!("run exceeded {limit} node executions"),
                ));
                self.pool.cancel();
                break;
            }
            self.dispatch(state, &node_id).await?;
        }
        Ok(())
    }

    async fn dispatch(&mut self, state: &mut RunState, node_id: &NodeId) -> Result<(), EngineError> {
        let graph = Arc::clone(&state.graph);
        let Some(node) = graph.get_node(node_id) else {
            return Ok(());
        };
        debug!(node_id = %node_id, kind = node.kind.name(), "dispatching node");
        self.transition(state, node_id, NodeStatus::Waiting, None, None)
            .await?;

        match &node.kind {
            NodeKind::Task(_) | NodeKind::QuestionClassifier(_) => {
                self.submit(state, node, None)
            }
            NodeKind::Iteration(_) | NodeKind::Loop(_) => self.start_container(state, node),
            NodeKind::HumanInput(_) => {
                self.transition(state, node_id, NodeStatus::Running, None, None)
                    .await?;
                if !self.scope.is_empty() {
                    let error = NodeExecutionError::InvalidInput {
                        message: "human input cannot pause inside a container".to_owned(),
                    };
                    return self.on_failure(state, node, error).await;
                }
                info!(node_id = %node_id, "waiting for human input");
                state.awaiting_input.insert(node_id.clone());
                Ok(())
            }
            _ => {
                self.transition(state, node_id, NodeStatus::Running, None, None)
                    .await?;
                let outcome = self.run_inline(state, node);
                self.complete(state, node, outcome).await
            }
        }
    }

    /// Runs a native node kind against the current pool.
    fn run_inline(&self, state: &RunState, node: &Node) -> JobOutcome {
        let pool = &state.pool;
        let resolve = |selector: &Selector| {
            pool.get(selector)
                .cloned()
                .map_err(|e| EngineError::from_pool(&node.id, e))
        };

        match &node.kind {
            NodeKind::Start(config) => {
                let mut outputs = serde_json::Map::new();
                for variable in &config.variables {
                    let value = match self.ctx.inputs.get(&variable.variable) {
                        Some(value) => value.clone(),
                        None => match (&variable.default, variable.required) {
                            (Some(default), _) => default.clone(),
                            (None, true) => {
                                return JobOutcome::Failed(NodeExecutionError::InvalidInput {
                                    message: format!(
                                        "missing required input '{}'",
                                        variable.variable
                                    ),
                                });
                            }
                            (None, false) => JsonValue::Null,
                        },
                    };
                    if !value.is_null() && !variable.var_type.accepts(&value) {
                        return JobOutcome::Failed(NodeExecutionError::InvalidInput {
                            message: format!(
                                "input '{}' expected {} but got {value}",
                                variable.variable, variable.var_type
                            ),
                        });
                    }
                    outputs.insert(variable.variable.clone(), value);
                }
                JobOutcome::succeeded(outputs)
            }
            NodeKind::End(config) | NodeKind::ContainerEnd(config) => {
                let mut outputs = serde_json::Map::new();
                for binding in &config.outputs {
                    match resolve(&binding.value_selector) {
                        Ok(value) => {
                            outputs.insert(binding.variable.clone(), value);
                        }
                        Err(error) => return JobOutcome::Fatal(error),
                    }
                }
                JobOutcome::succeeded(outputs)
            }
            NodeKind::IfElse(config) => {
                let mut selected = Handle::False.as_str().to_owned();
                for case in &config.cases {
                    match evaluate_all(&case.conditions, case.logical_operator, pool) {
                        Ok(true) => {
                            selected.clone_from(&case.case_id);
                            break;
                        }
                        Ok(false) => {}
                        Err(e) => return JobOutcome::Fatal(EngineError::from_pool(&node.id, e)),
                    }
                }
                let mut metadata = serde_json::Map::new();
                metadata.insert("selected_case".to_owned(), JsonValue::String(selected));
                JobOutcome::Succeeded {
                    outputs: serde_json::Map::new(),
                    metadata,
                }
            }
            NodeKind::VariableAggregator(config) => {
                let found = config.variables.iter().find_map(|s| pool.try_get(s));
                let value = match (found, config.variables.first()) {
                    (Some(value), _) => value.clone(),
                    (None, Some(first)) => {
                        return JobOutcome::Fatal(EngineError::UnresolvedVariable {
                            node_id: node.id.clone(),
                            selector: first.clone(),
                        });
                    }
                    (None, None) => JsonValue::Null,
                };
                if !value.is_null() && !config.output_type.accepts(&value) {
                    return JobOutcome::Failed(NodeExecutionError::OutputValidation {
                        message: format!("expected {} but got {value}", config.output_type),
                    });
                }
                let mut outputs = serde_json::Map::new();
                outputs.insert("output".to_owned(), value);
                JobOutcome::succeeded(outputs)
            }
            NodeKind::ContainerStart => JobOutcome::succeeded(serde_json::Map::new()),
            other => JobOutcome::Failed(NodeExecutionError::failed(format!(
                "{} nodes do not run inline",
                other.name()
            ))),
        }
    }

    fn resolve_inputs(&self, state: &RunState, node: &Node) -> Result<ResolvedInputs, EngineError> {
        let resolve = |selector: &Selector| {
            state
                .pool
                .get(selector)
                .cloned()
                .map_err(|e| EngineError::from_pool(&node.id, e))
        };
        let mut inputs = ResolvedInputs::new();
        match &node.kind {
            NodeKind::Task(config) => {
                for binding in &config.inputs {
                    inputs.insert(binding.variable.clone(), resolve(&binding.value_selector)?);
                }
            }
            NodeKind::QuestionClassifier(config) => {
                inputs.insert("query".to_owned(), resolve(&config.query_variable_selector)?);
                let classes = config
                    .classes
                    .iter()
                    .map(|c| serde_json::json!({ "id": c.id, "name": c.name }))
                    .collect();
                inputs.insert("classes".to_owned(), JsonValue::Array(classes));
            }
            _ => {}
        }
        Ok(inputs)
    }

    /// Hands an executor-backed node to the worker pool.
    fn submit(
        &mut self,
        state: &mut RunState,
        node: &Node,
        delay: Option<Duration>,
    ) -> Result<(), EngineError> {
        let inputs = self.resolve_inputs(state, node)?;
        let name = node.kind.executor_name().unwrap_or_default();
        let executor = self
            .ctx
            .registry
            .get(name)
            .ok_or_else(|| EngineError::MissingExecutor {
                node_id: node.id.clone(),
                executor: name.to_owned(),
            })?;
        let attempt = state
            .node_states
            .get(&node.id)
            .map_or(0, |s| s.attempt_count)
            + 1;

        self.pool.submit(Job {
            node: Arc::new(node.clone()),
            executor,
            inputs,
            ctx: ExecutionContext {
                run_id: self.ctx.run_id,
                node_id: node.id.clone(),
                attempt,
                io_timeouts: self.ctx.config.io_timeouts,
                cancellation: self.pool.cancellation().clone(),
            },
            timeout: node.timeout().unwrap_or_else(|| self.ctx.config.node_timeout()),
            delay,
        });
        state.in_flight.insert(node.id.clone());
        Ok(())
    }

    fn start_container(&mut self, state: &mut RunState, node: &Node) -> Result<(), EngineError> {
        let Some(body) = node.kind.body() else {
            return Ok(());
        };
        let run = ContainerRun::new(
            Arc::clone(&self.ctx),
            &node.id,
            body,
            Arc::new(state.pool.clone()),
            self.scope.clone(),
            self.pool.clone(),
        );

        let driver = match &node.kind {
            NodeKind::Iteration(config) => {
                let items = state
                    .pool
                    .get(&config.iterator_selector)
                    .cloned()
                    .map_err(|e| EngineError::from_pool(&node.id, e))?;
                let parallelism = self.ctx.config.clamp_parallelism(config.parallelism);
                run.iteration(items, parallelism, config.error_mode)
            }
            NodeKind::Loop(config) => {
                let mut variables = serde_json::Map::new();
                for variable in &config.loop_variables {
                    let value = match &variable.value {
                        LoopValue::Constant { value } => value.clone(),
                        LoopValue::Variable { selector } => state
                            .pool
                            .get(selector)
                            .cloned()
                            .map_err(|e| EngineError::from_pool(&node.id, e))?,
                    };
                    variables.insert(variable.name.clone(), value);
                }
                let count = self.ctx.config.clamp_loop_count(config.loop_count);
                if count < config.loop_count {
                    warn!(
                        node_id = %node.id,
                        requested = config.loop_count,
                        limit = count,
                        "loop_count clamped"
                    );
                }
                run.looping(
                    count,
                    config.break_conditions.clone(),
                    config.logical_operator,
                    variables,
                )
            }
            _ => return Ok(()),
        };

        self.pool.spawn_container(node.id.clone(), 1, driver);
        state.in_flight.insert(node.id.clone());
        Ok(())
    }

    async fn on_worker_event(&mut self, state: &mut RunState, event: WorkerEvent) -> Result<(), EngineError> {
        let graph = Arc::clone(&state.graph);
        let Some(node) = graph.get_node(&event.node_id) else {
            return Ok(());
        };
        match event.kind {
            WorkerEventKind::Started => {
                if matches!(
                    state.status_of(&node.id),
                    NodeStatus::Waiting | NodeStatus::Retry
                ) {
                    self.transition(state, &node.id, NodeStatus::Running, None, None)
                        .await?;
                }
                Ok(())
            }
            WorkerEventKind::Finished(outcome) => {
                state.in_flight.remove(&node.id);
                self.complete(state, node, outcome).await
            }
        }
    }

    async fn complete(&mut self, state: &mut RunState, node: &Node, outcome: JobOutcome) -> Result<(), EngineError> {
        match outcome {
            JobOutcome::Fatal(error) => Err(error),
            JobOutcome::Failed(NodeExecutionError::Cancelled)
                if state.is_halted() || self.pool.cancellation().is_cancelled() =>
            {
                state.halt(Halt::Stopped);
                self.transition(state, &node.id, NodeStatus::Stopped, None, None)
                    .await
            }
            JobOutcome::Failed(error) => self.on_failure(state, node, error).await,
            JobOutcome::Succeeded { outputs, metadata } => {
                if let NodeKind::Task(config) = &node.kind {
                    if let Err(message) = check_outputs(&config.outputs, &outputs) {
                        let error = NodeExecutionError::OutputValidation { message };
                        return self.on_failure(state, node, error).await;
                    }
                }
                self.on_success(state, node, outputs, metadata).await
            }
        }
    }

    async fn on_success(
        &mut self,
        state: &mut RunState,
        node: &Node,
        mut outputs: serde_json::Map<String, JsonValue>,
        metadata: serde_json::Map<String, JsonValue>,
    ) -> Result<(), EngineError> {
        let handles = match &node.kind {
            NodeKind::QuestionClassifier(config) => match config.winning_class(&outputs).cloned() {
                Some(class) => {
                    outputs.insert("class_id".to_owned(), JsonValue::String(class.id.clone()));
                    outputs.insert("class_name".to_owned(), JsonValue::String(class.name));
                    vec![Handle::from(class.id)]
                }
                None => {
                    warn!(node_id = %node.id, "classifier matched no class");
                    outputs.insert("class_id".to_owned(), JsonValue::Null);
                    outputs.insert("class_name".to_owned(), JsonValue::Null);
                    Vec::new()
                }
            },
            NodeKind::IfElse(_) => {
                let selected = metadata
                    .get("selected_case")
                    .and_then(JsonValue::as_str)
                    .unwrap_or("false");
                vec![Handle::from(selected)]
            }
            _ => vec![Handle::Source, Handle::SuccessBranch],
        };

        state
            .pool
            .put_outputs(&node.id, &outputs)
            .map_err(|e| EngineError::from_pool(&node.id, e))?;
        state.node_state_mut(&node.id).metadata.extend(metadata);
        self.transition(
            state,
            &node.id,
            NodeStatus::Succeeded,
            Some(outputs.clone()),
            None,
        )
        .await?;

        if self.terminal.matches(node) {
            if self.scope.is_empty() {
                info!(node_id = %node.id, "terminal node reached");
            } else {
                debug!(node_id = %node.id, "body end reached");
            }
            state.terminal_reached = true;
            state.outputs = outputs;
            state.halt(Halt::Terminal);
            return Ok(());
        }
        self.resolve_edges(state, &node.id, &handles).await
    }

    async fn on_failure(
        &mut self,
        state: &mut RunState,
        node: &Node,
        error: NodeExecutionError,
    ) -> Result<(), EngineError> {
        let failure = NodeFailure {
            error_type: error.error_type().to_owned(),
            message: error.to_string(),
        };
        let attempts = state
            .node_states
            .get(&node.id)
            .map_or(0, |s| s.attempt_count);

        if let Some(retry) = node.retry.filter(|_| node.kind.executor_name().is_some()) {
            if attempts <= retry.max_retries
                && !state.is_halted()
                && error != NodeExecutionError::Cancelled
            {
                warn!(
                    node_id = %node.id,
                    attempt = attempts,
                    max_retries = retry.max_retries,
                    %error,
                    "node failed, retrying"
                );
                self.transition(state, &node.id, NodeStatus::Retry, None, Some(failure))
                    .await?;
                return self.submit(state, node, Some(retry.retry_interval()));
            }
        }

        match &node.error_strategy {
            ErrorStrategy::Abort => {
                error!(node_id = %node.id, %error, "node failed");
                self.transition(state, &node.id, NodeStatus::Failed, None, Some(failure))
                    .await?;
                state.fail(run_failure(&node.id, &error));
                self.pool.cancel();
                Ok(())
            }
            ErrorStrategy::FailBranch => {
                warn!(node_id = %node.id, %error, "node failed, taking fail branch");
                let mut outputs = serde_json::Map::new();
                outputs.insert(
                    ERROR_MESSAGE_FIELD.to_owned(),
                    JsonValue::String(error.to_string()),
                );
                outputs.insert(
                    ERROR_TYPE_FIELD.to_owned(),
                    JsonValue::String(error.error_type().to_owned()),
                );
                state
                    .pool
                    .put_outputs(&node.id, &outputs)
                    .map_err(|e| EngineError::from_pool(&node.id, e))?;
                self.transition(
                    state,
                    &node.id,
                    NodeStatus::Exception,
                    Some(outputs),
                    Some(failure),
                )
                .await?;
                state.exceptions.push(node.id.clone());
                self.resolve_edges(state, &node.id, &[Handle::FailBranch])
                    .await
            }
            ErrorStrategy::DefaultValue { outputs } => {
                warn!(node_id = %node.id, %error, "node failed, using default outputs");
                state
                    .pool
                    .put_outputs(&node.id, outputs)
                    .map_err(|e| EngineError::from_pool(&node.id, e))?;
                let runtime = state.node_state_mut(&node.id);
                runtime
                    .metadata
                    .insert("default_value_used".to_owned(), JsonValue::Bool(true));
                runtime.metadata.insert(
                    ERROR_TYPE_FIELD.to_owned(),
                    JsonValue::String(failure.error_type.clone()),
                );
                runtime.error = Some(failure);
                self.transition(
                    state,
                    &node.id,
                    NodeStatus::Succeeded,
                    Some(outputs.clone()),
                    None,
                )
                .await?;
                self.resolve_edges(state, &node.id, &[Handle::Source, Handle::SuccessBranch])
                    .await
            }
        }
    }

    /// Resolves a completed node's edges, then queues or skips its targets.
    async fn resolve_edges(
        &mut self,
        state: &mut RunState,
        node_id: &NodeId,
        handles: &[Handle],
    ) -> Result<(), EngineError> {
        let resolution = state.edges.resolve(node_id, handles);
        for edge_id in &resolution.taken {
            self.record_edge(edge_id, EdgeState::Taken).await;
        }
        for edge_id in &resolution.skipped {
            self.record_edge(edge_id, EdgeState::Skipped).await;
        }
        for skipped in &resolution.skipped_nodes {
            if state.status_of(skipped) == NodeStatus::NotStarted {
                self.transition(state, skipped, NodeStatus::Skipped, None, None)
                    .await?;
            }
        }
        if !state.is_halted() {
            for ready in resolution.ready {
                if state.status_of(&ready) == NodeStatus::NotStarted {
                    state.ready.push_back(ready);
                }
            }
        }
        Ok(())
    }

    async fn record_edge(&self, edge_id: &EdgeId, edge_state: EdgeState) {
        self.ctx
            .recorder
            .record(EngineEvent::EdgeResolved {
                run_id: self.ctx.run_id,
                edge_id: edge_id.clone(),
                state: edge_state,
                scope: self.scope.clone(),
                timestamp: Utc::now(),
            })
            .await;
    }

    /// Changes a node's status and publishes the transition.
    async fn transition(
        &self,
        state: &mut RunState,
        node_id: &NodeId,
        to: NodeStatus,
        outputs: Option<serde_json::Map<String, JsonValue>>,
        error: Option<NodeFailure>,
    ) -> Result<(), EngineError> {
        let now = Utc::now();
        let (from, attempt) = state.transition(node_id, to, now)?;
        if let Some(error) = &error {
            state.node_state_mut(node_id).error = Some(error.clone());
        }
        debug!(node_id = %node_id, ?from, ?to, attempt, "node transition");
        self.ctx
            .recorder
            .record(EngineEvent::NodeTransition(NodeTransition {
                run_id: self.ctx.run_id,
                node_id: node_id.clone(),
                from,
                to,
                attempt,
                timestamp: now,
                scope: self.scope.clone(),
                outputs,
                error,
            }))
            .await;
        Ok(())
    }
}

fn run_failure(node_id: &NodeId, error: &NodeExecutionError) -> RunFailure {
    match error {
        NodeExecutionError::IterationFailed {
            node_id: inner,
            error_type,
            message,
            ..
        } => RunFailure::new(Some(inner.clone()), error_type.clone(), message.clone()),
        other => RunFailure::new(Some(node_id.clone()), other.error_type(), other.to_string()),
    }
}

/// Requests a cooperative stop of a running workflow.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    token: CancellationToken,
}

impl StopHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops dispatching and cancels in-flight executors.
    pub fn stop(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// A run parked on one or more human-input nodes.
#[derive(Debug, Clone)]
pub struct PausedRun {
    pub run_id: RunId,
    state: RunState,
    history: Vec<EngineEvent>,
    steps: u32,
    started_at: DateTime<Utc>,
}

impl PausedRun {
    /// Nodes that can be resumed.
    pub fn awaiting_input(&self) -> impl Iterator<Item = &NodeId> {
        self.state.awaiting_input()
    }
}

/// Everything known about a run once its loop has exited.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub status: WorkflowRunStatus,
    /// Outputs of the `end` node that completed the run.
    pub outputs: serde_json::Map<String, JsonValue>,
    pub failure: Option<RunFailure>,
    /// Runtime state of every workflow-level node.
    pub node_states: HashMap<NodeId, NodeRuntimeState>,
    pub edge_states: HashMap<EdgeId, EdgeState>,
    pub pool: PoolSnapshot,
    pub history: Vec<EngineEvent>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Set when `status` is PAUSED.
    pub paused: Option<PausedRun>,
}

impl RunOutcome {
    #[must_use]
    pub fn node_state(&self, node_id: &str) -> Option<&NodeRuntimeState> {
        self.node_states.get(node_id)
    }

    #[must_use]
    pub fn node_status(&self, node_id: &str) -> NodeStatus {
        self.node_state(node_id).map(|s| s.status).unwrap_or_default()
    }

    #[must_use]
    pub fn edge_state(&self, edge_id: &str) -> EdgeState {
        self.edge_states.get(edge_id).copied().unwrap_or_default()
    }
}

/// Executes validated workflow graphs.
pub struct GraphEngine {
    graph: Arc<WorkflowGraph>,
    root: NodeId,
    registry: Arc<ExecutorRegistry>,
    config: Arc<EngineConfig>,
    sink: Option<Arc<dyn EventSink>>,
    warnings: Vec<ValidationWarning>,
}

impl GraphEngine {
    /// Validates `graph` and binds it to the executors that will run it.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Structural` if validation finds fatal errors, and
    /// `EngineError::MissingExecutor` if a task or classifier names an
    /// executor that is not registered.
    pub fn new(
        graph: WorkflowGraph,
        registry: ExecutorRegistry,
        config: EngineConfig,
    ) -> tidewater_core::Result<Self, EngineError> {
        let report = GraphValidator::validate(&graph);
        for warning in &report.warnings {
            warn!(%warning, "graph validation warning");
        }
        if !report.is_valid() {
            error!(errors = report.errors.len(), "graph failed validation");
            return Err(EngineError::Structural {
                errors: report.errors,
            }
            .into());
        }
        check_executors(&graph, &registry)?;

        let root = graph
            .root_nodes()
            .first()
            .map(|node| node.id.clone())
            .ok_or_else(|| EngineError::Structural {
                errors: vec![crate::error::StructuralError::NoRootNode],
            })?;

        Ok(Self {
            graph: Arc::new(graph),
            root,
            registry: Arc::new(registry),
            config: Arc::new(config),
            sink: None,
            warnings: report.warnings,
        })
    }

    /// Publishes every lifecycle event to `sink` as well as the history.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Non-fatal validation findings.
    #[must_use]
    pub fn warnings(&self) -> &[ValidationWarning] {
        &self.warnings
    }

    #[must_use]
    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    /// Runs the workflow to completion.
    ///
    /// # Errors
    ///
    /// Returns an error only for fatal engine conditions: unresolved
    /// variables, conflicting writes and invalid transitions. Node failures
    /// are reported through the outcome's status.
    pub async fn run(&self, seed: RunSeed) -> tidewater_core::Result<RunOutcome, EngineError> {
        self.run_with_stop(seed, &StopHandle::new()).await
    }

    /// Runs the workflow, stopping early if `stop` is triggered.
    ///
    /// # Errors
    ///
    /// See [`run`](Self::run).
    #[instrument(skip_all, fields(run_id))]
    pub async fn run_with_stop(
        &self,
        seed: RunSeed,
        stop: &StopHandle,
    ) -> tidewater_core::Result<RunOutcome, EngineError> {
        let run_id = RunId::new();
        tracing::Span::current().record("run_id", tracing::field::display(run_id));

        let RunSeed {
            mut namespaces,
            inputs,
        } = seed;
        namespaces.sys.insert(
            "workflow_run_id".to_owned(),
            JsonValue::String(run_id.to_string()),
        );
        let pool = VariablePool::seeded(&namespaces);

        let started_at = Utc::now();
        let ctx = Arc::new(RunContext::new(run_id, self, inputs, Vec::new(), 0));
        self.record_status(
            &ctx,
            WorkflowRunStatus::Scheduled,
            WorkflowRunStatus::Running,
        )
        .await;
        info!(nodes = self.graph.node_count(), "workflow run started");

        let (workers, events) = WorkerPool::new(self.config.max_workers, stop.token.child_token());
        let state = run_scope(
            Arc::clone(&ctx),
            Arc::clone(&self.graph),
            Terminal::Response,
            Vec::new(),
            workers,
            events,
            pool,
            &self.root,
        )
        .await;
        self.finish(&ctx, state, started_at).await
    }

    /// Continues a paused run, using `input` as the outputs of `node_id`.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ResumeRejected` if the node is not waiting for
    /// input or `input` lacks a declared field; otherwise as for
    /// [`run`](Self::run).
    #[instrument(skip_all, fields(run_id = %paused.run_id, node_id = %node_id))]
    pub async fn resume(
        &self,
        paused: PausedRun,
        node_id: &NodeId,
        input: ResolvedInputs,
    ) -> tidewater_core::Result<RunOutcome, EngineError> {
        let PausedRun {
            run_id,
            mut state,
            history,
            steps,
            started_at,
        } = paused;

        if !state.awaiting_input.contains(node_id) {
            return Err(EngineError::ResumeRejected {
                reason: format!("node {node_id} is not waiting for input"),
            }
            .into());
        }
        let graph = Arc::clone(&self.graph);
        let Some(node) = graph.get_node(node_id) else {
            return Err(EngineError::ResumeRejected {
                reason: format!("node {node_id} is not in this workflow"),
            }
            .into());
        };
        if let NodeKind::HumanInput(config) = &node.kind {
            check_outputs(&config.fields, &input)
                .map_err(|reason| EngineError::ResumeRejected { reason })?;
        }
        state.awaiting_input.remove(node_id);

        let ctx = Arc::new(RunContext::new(
            run_id,
            self,
            serde_json::Map::new(),
            history,
            steps,
        ));
        self.record_status(&ctx, WorkflowRunStatus::Paused, WorkflowRunStatus::Running)
            .await;
        info!("workflow run resumed");

        let (workers, events) = WorkerPool::new(self.config.max_workers, CancellationToken::new());
        let mut runner = ScopeRunner {
            ctx: Arc::clone(&ctx),
            terminal: Terminal::Response,
            scope: Vec::new(),
            pool: workers,
            events,
        };
        runner.resume(&mut state, node, input).await;
        self.finish(&ctx, state, started_at).await
    }

    async fn record_status(&self, ctx: &RunContext, from: WorkflowRunStatus, to: WorkflowRunStatus) {
        ctx.recorder
            .record(EngineEvent::RunStatusChanged {
                run_id: ctx.run_id,
                from,
                to,
                timestamp: Utc::now(),
            })
            .await;
    }

    async fn finish(
        &self,
        ctx: &RunContext,
        mut state: RunState,
        started_at: DateTime<Utc>,
    ) -> tidewater_core::Result<RunOutcome, EngineError> {
        let status = if state.fatal.is_some() || state.failure.is_some() {
            WorkflowRunStatus::Failed
        } else if state.halt == Some(Halt::Stopped) {
            WorkflowRunStatus::Stopped
        } else if !state.awaiting_input.is_empty() {
            WorkflowRunStatus::Paused
        } else if state.terminal_reached {
            if state.exceptions.is_empty() {
                WorkflowRunStatus::Succeeded
            } else {
                WorkflowRunStatus::PartialSucceeded
            }
        } else {
            state.failure = Some(RunFailure::new(
                None,
                "NoTerminalReached",
                "run ended without reaching an end node",
            ));
            WorkflowRunStatus::Failed
        };

        self.record_status(ctx, WorkflowRunStatus::Running, status)
            .await;
        match (&state.failure, status) {
            (Some(failure), _) => error!(%failure, "workflow run failed"),
            (None, WorkflowRunStatus::Failed) => error!("workflow run failed"),
            _ => info!(?status, steps = ctx.steps(), "workflow run finished"),
        }

        if let Some(fatal) = state.fatal.take() {
            return Err(fatal.into());
        }

        let history = ctx.recorder.history().await;
        let paused = (status == WorkflowRunStatus::Paused).then(|| PausedRun {
            run_id: ctx.run_id,
            state: state.clone(),
            history: history.clone(),
            steps: ctx.steps(),
            started_at,
        });

        Ok(RunOutcome {
            run_id: ctx.run_id,
            status,
            outputs: std::mem::take(&mut state.outputs),
            failure: state.failure.take(),
            edge_states: state.edge_states().clone(),
            pool: state.pool.snapshot(),
            node_states: state.node_states,
            history,
            started_at,
            finished_at: Utc::now(),
            paused,
        })
    }
}

fn check_executors(graph: &WorkflowGraph, registry: &ExecutorRegistry) -> Result<(), EngineError> {
    for node in graph.nodes() {
        if let Some(name) = node.kind.executor_name() {
            if !registry.contains(name) {
                return Err(EngineError::MissingExecutor {
                    node_id: node.id.clone(),
                    executor: name.to_owned(),
                });
            }
        }
        if let Some(body) = node.kind.body() {
            check_executors(&body.graph, registry)?;
        }
    }
    Ok(())
}
