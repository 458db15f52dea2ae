//! Drivers for iteration and loop containers.
//!
//! A container runs on the worker pool like any executor-backed node. Its
//! driver runs the body graph once per item or per round, each time through
//! a fresh scope runner whose variable pool is layered over the outer pool.
//! The container's own inputs (`item`, `index`, loop variables) are visible
//! to the body under the container's node id.

use crate::condition::{Condition, LogicalOperator, evaluate_all};
use crate::engine::{RunContext, Terminal, run_scope};
use crate::error::EngineError;
use crate::execution::{EngineEvent, IterationScope};
use crate::executor::NodeExecutionError;
use crate::graph::WorkflowGraph;
use crate::node::{ContainerBody, IterationErrorMode};
use crate::run_state::{Halt, RunFailure, RunState};
use crate::variable_pool::VariablePool;
use crate::worker::{JobOutcome, WorkerPool};
use chrono::Utc;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt, stream};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tidewater_core::NodeId;
use tracing::{debug, warn};

type Fields = serde_json::Map<String, JsonValue>;

/// How one run of a body ended.
#[derive(Debug)]
enum BodyResult {
    /// The end marker succeeded with these outputs.
    Completed(Fields),
    /// Every path was skipped before reaching the end marker.
    NoTerminal,
    Failed(RunFailure),
    Fatal(EngineError),
    Stopped,
}

impl BodyResult {
    fn of(state: &RunState) -> Self {
        if let Some(error) = &state.fatal {
            Self::Fatal(error.clone())
        } else if let Some(failure) = &state.failure {
            Self::Failed(failure.clone())
        } else if state.halt == Some(Halt::Stopped) {
            Self::Stopped
        } else if state.terminal_reached {
            Self::Completed(state.outputs.clone())
        } else {
            Self::NoTerminal
        }
    }
}

/// The value a body contributes to the container's `output` array.
///
/// A single end output is unwrapped; several are kept as an object.
fn end_value(outputs: Fields) -> JsonValue {
    match outputs.len() {
        0 => JsonValue::Null,
        1 => outputs
            .into_iter()
            .next()
            .map_or(JsonValue::Null, |(_, value)| value),
        _ => JsonValue::Object(outputs),
    }
}

/// Everything a container driver needs, detached from the outer runner.
pub(crate) struct ContainerRun {
    ctx: Arc<RunContext>,
    container: NodeId,
    graph: Arc<WorkflowGraph>,
    start: NodeId,
    end: NodeId,
    parent: Arc<VariablePool>,
    scope: Vec<IterationScope>,
    pool: WorkerPool,
}

impl ContainerRun {
    pub(crate) fn new(
        ctx: Arc<RunContext>,
        container: &NodeId,
        body: &ContainerBody,
        parent: Arc<VariablePool>,
        scope: Vec<IterationScope>,
        pool: WorkerPool,
    ) -> Self {
        Self {
            ctx,
            container: container.clone(),
            graph: Arc::new(body.graph.clone()),
            start: body.start_node_id.clone(),
            end: body.end_node_id.clone(),
            parent,
            scope,
            pool,
        }
    }

    /// Runs the body once per element of `items`, at most `parallelism` at a
    /// time. Outputs keep the order of `items`.
    pub(crate) fn iteration(
        self,
        items: JsonValue,
        parallelism: usize,
        error_mode: IterationErrorMode,
    ) -> BoxFuture<'static, JobOutcome> {
        async move {
            let items = match items {
                JsonValue::Array(items) => items,
                other => {
                    return JobOutcome::Failed(NodeExecutionError::InvalidInput {
                        message: format!("iteration input must be an array, got {other}"),
                    });
                }
            };
            let count = items.len();
            let (container_pool, _events) = self.pool.child();
            let this = &self;
            let pool = &container_pool;

            let mut results = std::pin::pin!(
                stream::iter(items.into_iter().enumerate())
                    .map(|(index, item)| async move {
                        if pool.cancellation().is_cancelled() {
                            return (index, BodyResult::Stopped);
                        }
                        let mut fields = Fields::new();
                        fields.insert("item".to_owned(), item);
                        fields.insert("index".to_owned(), JsonValue::from(index));
                        let layer = match this.layer(&fields) {
                            Ok(layer) => layer,
                            Err(error) => return (index, BodyResult::Fatal(error)),
                        };
                        let mut state = this.run_body(pool, index, layer).await;
                        this.close_iteration(&mut state, index, false).await;
                        (index, BodyResult::of(&state))
                    })
                    .buffered(parallelism)
            );

            let mut outputs = Vec::with_capacity(count);
            let mut failed = None;
            while let Some((index, result)) = results.next().await {
                if failed.is_some() {
                    continue;
                }
                match result {
                    BodyResult::Completed(values) => outputs.push(end_value(values)),
                    BodyResult::NoTerminal => outputs.push(JsonValue::Null),
                    BodyResult::Failed(failure) => match error_mode {
                        IterationErrorMode::Terminated => {
                            pool.cancel();
                            failed = Some(JobOutcome::Failed(self.iteration_failed(index, failure)));
                        }
                        IterationErrorMode::ContinueOnError => {
                            warn!(container = %self.container, index, %failure, "iteration failed, continuing");
                            outputs.push(JsonValue::Null);
                        }
                        IterationErrorMode::RemoveAbnormalOutput => {
                            warn!(container = %self.container, index, %failure, "iteration failed, dropping its output");
                        }
                    },
                    BodyResult::Fatal(error) => {
                        pool.cancel();
                        failed = Some(JobOutcome::Fatal(error));
                    }
                    BodyResult::Stopped => {
                        failed = Some(JobOutcome::Failed(NodeExecutionError::Cancelled));
                    }
                }
            }
            if let Some(outcome) = failed {
                return outcome;
            }

            let mut result = Fields::new();
            result.insert("output".to_owned(), JsonValue::Array(outputs));
            let mut metadata = Fields::new();
            metadata.insert("iterations".to_owned(), JsonValue::from(count));
            JobOutcome::Succeeded {
                outputs: result,
                metadata,
            }
        }
        .boxed()
    }

    /// Runs the body up to `count` times, carrying `variables` between rounds.
    ///
    /// After each round, variables named like an end-marker output take that
    /// output's value, then the break conditions are checked against them.
    pub(crate) fn looping(
        self,
        count: u32,
        break_conditions: Vec<Condition>,
        operator: LogicalOperator,
        mut variables: Fields,
    ) -> BoxFuture<'static, JobOutcome> {
        async move {
            let (container_pool, _events) = self.pool.child();
            let rounds = count as usize;
            let mut outputs = Vec::new();
            let mut iterations = 0usize;
            let mut reason = "loop_completed";

            for index in 0..rounds {
                if container_pool.cancellation().is_cancelled() {
                    return JobOutcome::Failed(NodeExecutionError::Cancelled);
                }
                let layer = match self.layer(&loop_fields(&variables, index)) {
                    Ok(layer) => layer,
                    Err(error) => return JobOutcome::Fatal(error),
                };
                let mut state = self.run_body(&container_pool, index, layer).await;
                iterations += 1;

                match BodyResult::of(&state) {
                    BodyResult::Completed(values) => {
                        for (name, value) in &values {
                            if let Some(slot) = variables.get_mut(name) {
                                slot.clone_from(value);
                            }
                        }
                        outputs.push(end_value(values));
                    }
                    BodyResult::NoTerminal => outputs.push(JsonValue::Null),
                    BodyResult::Failed(failure) => {
                        self.close_iteration(&mut state, index, false).await;
                        return JobOutcome::Failed(self.iteration_failed(index, failure));
                    }
                    BodyResult::Fatal(error) => return JobOutcome::Fatal(error),
                    BodyResult::Stopped => {
                        return JobOutcome::Failed(NodeExecutionError::Cancelled);
                    }
                }

                let mut done = index + 1 >= rounds;
                if !break_conditions.is_empty() {
                    let check = match self.layer(&loop_fields(&variables, index)) {
                        Ok(layer) => layer,
                        Err(error) => return JobOutcome::Fatal(error),
                    };
                    match evaluate_all(&break_conditions, operator, &check) {
                        Ok(true) => {
                            debug!(container = %self.container, index, "break condition met");
                            done = true;
                            reason = "loop_break";
                        }
                        Ok(false) => {}
                        Err(e) => {
                            return JobOutcome::Fatal(EngineError::from_pool(&self.container, e));
                        }
                    }
                }
                self.close_iteration(&mut state, index, !done).await;
                if done {
                    break;
                }
            }

            let mut result = Fields::new();
            result.insert("output".to_owned(), JsonValue::Array(outputs));
            result.extend(variables);
            let mut metadata = Fields::new();
            metadata.insert("iterations".to_owned(), JsonValue::from(iterations));
            metadata.insert(
                "completed_reason".to_owned(),
                JsonValue::String(reason.to_owned()),
            );
            JobOutcome::Succeeded {
                outputs: result,
                metadata,
            }
        }
        .boxed()
    }

    /// A pool layer holding the container's per-round fields.
    fn layer(&self, fields: &Fields) -> Result<VariablePool, EngineError> {
        let mut layer = VariablePool::scoped(Arc::clone(&self.parent));
        layer
            .put_outputs(&self.container, fields)
            .map_err(|e| EngineError::from_pool(&self.container, e))?;
        Ok(layer)
    }

    async fn run_body(&self, pool: &WorkerPool, index: usize, layer: VariablePool) -> RunState {
        debug!(container = %self.container, index, "iteration started");
        self.ctx
            .recorder
            .record(EngineEvent::IterationStarted {
                run_id: self.ctx.run_id,
                container: self.container.clone(),
                index,
                scope: self.scope.clone(),
                timestamp: Utc::now(),
            })
            .await;

        let (body_pool, events) = pool.child();
        run_scope(
            Arc::clone(&self.ctx),
            Arc::clone(&self.graph),
            Terminal::Marker(self.end.clone()),
            self.inner_scope(index),
            body_pool,
            events,
            layer,
            &self.start,
        )
        .await
    }

    /// Resolves the body's back edge and records the end of a round.
    async fn close_iteration(&self, state: &mut RunState, index: usize, continuing: bool) {
        let inner = self.inner_scope(index);
        for (edge_id, edge_state) in state.edges.resolve_loop(&self.end, continuing) {
            self.ctx
                .recorder
                .record(EngineEvent::EdgeResolved {
                    run_id: self.ctx.run_id,
                    edge_id,
                    state: edge_state,
                    scope: inner.clone(),
                    timestamp: Utc::now(),
                })
                .await;
        }
        self.ctx
            .recorder
            .record(EngineEvent::IterationCompleted {
                run_id: self.ctx.run_id,
                container: self.container.clone(),
                index,
                scope: self.scope.clone(),
                timestamp: Utc::now(),
            })
            .await;
    }

    fn inner_scope(&self, index: usize) -> Vec<IterationScope> {
        let mut scope = self.scope.clone();
        scope.push(IterationScope {
            container: self.container.clone(),
            index,
        });
        scope
    }

    fn iteration_failed(&self, index: usize, failure: RunFailure) -> NodeExecutionError {
        NodeExecutionError::IterationFailed {
            index,
            node_id: failure.node_id.unwrap_or_else(|| self.container.clone()),
            error_type: failure.error_type,
            message: failure.message,
        }
    }
}

fn loop_fields(variables: &Fields, index: usize) -> Fields {
    let mut fields = variables.clone();
    fields.insert("index".to_owned(), JsonValue::from(index));
    fields
}
