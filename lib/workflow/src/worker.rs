//! The worker pool.
//!
//! A bounded set of execution slots shared by a run and every container body
//! inside it. The pool never decides control flow: a job runs its executor,
//! then reports back on the submitting scope's event channel. Each job emits
//! `Started` once it holds a slot and exactly one `Finished`, in that order.
//!
//! Containers are driven by a job too, but hold no slot while their body runs,
//! so nested bodies cannot starve the pool.

use crate::error::EngineError;
use crate::executor::{ExecutionContext, NodeExecutionError, NodeExecutor, NodeOutputs, ResolvedInputs};
use crate::node::Node;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value as JsonValue;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tidewater_core::NodeId;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

/// A node execution ready to be run.
pub struct Job {
    pub node: Arc<Node>,
    pub executor: Arc<dyn NodeExecutor>,
    pub inputs: ResolvedInputs,
    pub ctx: ExecutionContext,
    pub timeout: Duration,
    /// Wait this long before competing for a slot, e.g. a retry interval.
    pub delay: Option<Duration>,
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Succeeded {
        outputs: NodeOutputs,
        metadata: serde_json::Map<String, JsonValue>,
    },
    Failed(NodeExecutionError),
    /// A condition that fails the whole run regardless of error strategy.
    Fatal(EngineError),
}

impl JobOutcome {
    #[must_use]
    pub fn succeeded(outputs: NodeOutputs) -> Self {
        Self::Succeeded {
            outputs,
            metadata: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEventKind {
    /// The job acquired a slot and its executor is running.
    Started,
    Finished(JobOutcome),
}

/// Lifecycle report from a job.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerEvent {
    pub node_id: NodeId,
    pub attempt: u32,
    pub kind: WorkerEventKind,
    pub timestamp: DateTime<Utc>,
}

/// Bounded pool of execution slots.
///
/// Cloning shares the slots and the reporting channel.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    slots: Arc<Semaphore>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Creates a pool with `capacity` slots and the receiver for its events.
    ///
    /// Jobs are cancelled when `cancel` is.
    #[must_use]
    pub fn new(
        capacity: usize,
        cancel: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let pool = Self {
            slots: Arc::new(Semaphore::new(capacity.max(1))),
            events,
            cancel,
        };
        (pool, receiver)
    }

    /// Creates a pool sharing this pool's slots, with its own event channel.
    ///
    /// Cancelling this pool also cancels the child; cancelling the child
    /// leaves this pool running.
    #[must_use]
    pub fn child(&self) -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let pool = Self {
            slots: Arc::clone(&self.slots),
            events,
            cancel: self.cancel.child_token(),
        };
        (pool, receiver)
    }

    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancels every job submitted through this pool or its children.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Runs a job in the background.
    pub fn submit(&self, job: Job) {
        let slots = Arc::clone(&self.slots);
        let events = self.events.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let node_id = job.ctx.node_id.clone();
            let attempt = job.ctx.attempt;
            let report = |kind| send_event(&events, &node_id, attempt, kind);

            if let Some(delay) = job.delay {
                tokio::select! {
                    () = cancel.cancelled() => {
                        report(WorkerEventKind::Finished(JobOutcome::Failed(NodeExecutionError::Cancelled)));
                        return;
                    }
                    () = tokio::time::sleep(delay) => {}
                }
            }

            let _permit = tokio::select! {
                () = cancel.cancelled() => {
                    report(WorkerEventKind::Finished(JobOutcome::Failed(NodeExecutionError::Cancelled)));
                    return;
                }
                permit = slots.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        report(WorkerEventKind::Finished(JobOutcome::Failed(NodeExecutionError::Cancelled)));
                        return;
                    }
                },
            };

            report(WorkerEventKind::Started);
            debug!(node_id = %job.ctx.node_id, attempt, "executing node");

            let result = tokio::select! {
                () = cancel.cancelled() => Err(NodeExecutionError::Cancelled),
                result = tokio::time::timeout(
                    job.timeout,
                    AssertUnwindSafe(job.executor.execute(&job.node, job.inputs, &job.ctx)).catch_unwind(),
                ) => match result {
                    Ok(Ok(result)) => result,
                    Ok(Err(payload)) => {
                        let message = panic_message(&*payload);
                        error!(node_id = %job.ctx.node_id, attempt, %message, "executor panicked");
                        Err(NodeExecutionError::failed(format!("executor panicked: {message}")))
                    }
                    Err(_) => Err(NodeExecutionError::Timeout {
                        after_secs: job.timeout.as_secs(),
                    }),
                },
            };

            let outcome = match result {
                Ok(outputs) => JobOutcome::succeeded(outputs),
                Err(error) => JobOutcome::Failed(error),
            };
            trace!(node_id = %job.ctx.node_id, attempt, "node execution finished");
            report(WorkerEventKind::Finished(outcome));
        });
    }

    /// Runs a container driver in the background without holding a slot.
    pub fn spawn_container(&self, node_id: NodeId, attempt: u32, driver: BoxFuture<'static, JobOutcome>) {
        let events = self.events.clone();
        tokio::spawn(async move {
            let report = |kind| send_event(&events, &node_id, attempt, kind);
            report(WorkerEventKind::Started);
            let outcome = match AssertUnwindSafe(driver).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(payload) => {
                    let message = panic_message(&*payload);
                    error!(node_id = %node_id, %message, "container driver panicked");
                    JobOutcome::Failed(NodeExecutionError::failed(format!(
                        "container driver panicked: {message}"
                    )))
                }
            };
            report(WorkerEventKind::Finished(outcome));
        });
    }
}

fn send_event(
    events: &mpsc::UnboundedSender<WorkerEvent>,
    node_id: &NodeId,
    attempt: u32,
    kind: WorkerEventKind,
) {
    let event = WorkerEvent {
        node_id: node_id.clone(),
        attempt,
        kind,
        timestamp: Utc::now(),
    };
    if events.send(event).is_err() {
        // The scope may already have exited after an abort.
        trace!(node_id = %node_id, attempt, "scope closed, dropping worker event");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IoTimeouts;
    use crate::executor::{DelayExecutor, FnExecutor, MockExecutor};
    use crate::node::TaskConfig;
    use serde_json::json;
    use tidewater_core::RunId;

    fn job(node_id: &str, executor: impl NodeExecutor + 'static, cancel: &CancellationToken) -> Job {
        Job {
            node: Arc::new(Node::task(node_id, TaskConfig::new("test"))),
            executor: Arc::new(executor),
            inputs: ResolvedInputs::new(),
            ctx: ExecutionContext {
                run_id: RunId::new(),
                node_id: NodeId::new(node_id),
                attempt: 1,
                io_timeouts: IoTimeouts::default(),
                cancellation: cancel.clone(),
            },
            timeout: Duration::from_secs(5),
            delay: None,
        }
    }

    async fn finished(rx: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> WorkerEvent {
        loop {
            let event = rx.recv().await.expect("pool is alive");
            if matches!(event.kind, WorkerEventKind::Finished(_)) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn reports_started_then_finished() {
        let cancel = CancellationToken::new();
        let (pool, mut rx) = WorkerPool::new(2, cancel.clone());
        pool.submit(job("a", MockExecutor::succeeding(json!({"v": 1})), &cancel));

        let first = rx.recv().await.expect("event");
        assert_eq!(first.kind, WorkerEventKind::Started);
        let second = rx.recv().await.expect("event");
        match second.kind {
            WorkerEventKind::Finished(JobOutcome::Succeeded { outputs, .. }) => {
                assert_eq!(outputs.get("v"), Some(&json!(1)));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(second.node_id.as_str(), "a");
    }

    #[tokio::test]
    async fn timeout_surfaces_as_failure() {
        let cancel = CancellationToken::new();
        let (pool, mut rx) = WorkerPool::new(1, cancel.clone());
        let mut slow = job("slow", DelayExecutor::new(Duration::from_secs(30), json!({})), &cancel);
        slow.timeout = Duration::from_millis(20);
        pool.submit(slow);

        let event = finished(&mut rx).await;
        assert!(matches!(
            event.kind,
            WorkerEventKind::Finished(JobOutcome::Failed(NodeExecutionError::Timeout { .. }))
        ));
    }

    #[tokio::test]
    async fn cancel_stops_running_and_queued_jobs() {
        let cancel = CancellationToken::new();
        let (pool, mut rx) = WorkerPool::new(1, cancel.clone());
        pool.submit(job("running", DelayExecutor::new(Duration::from_secs(30), json!({})), &cancel));
        pool.submit(job("queued", DelayExecutor::new(Duration::from_secs(30), json!({})), &cancel));

        // Wait until one of them holds the only slot.
        let started = rx.recv().await.expect("event");
        assert_eq!(started.kind, WorkerEventKind::Started);
        pool.cancel();

        for _ in 0..2 {
            let event = finished(&mut rx).await;
            assert_eq!(
                event.kind,
                WorkerEventKind::Finished(JobOutcome::Failed(NodeExecutionError::Cancelled))
            );
        }
    }

    #[tokio::test]
    async fn panicking_executor_reports_a_failure() {
        let cancel = CancellationToken::new();
        let (pool, mut rx) = WorkerPool::new(1, cancel.clone());
        let boom = FnExecutor::new(|_, _| panic!("boom"));
        pool.submit(job("boom", boom, &cancel));

        let event = finished(&mut rx).await;
        match event.kind {
            WorkerEventKind::Finished(JobOutcome::Failed(NodeExecutionError::ExecutionFailed { message })) => {
                assert!(message.contains("boom"), "{message}");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    fn exploding_driver() -> JobOutcome {
        panic!("driver exploded")
    }

    #[tokio::test]
    async fn panicking_container_driver_reports_a_failure() {
        let (pool, mut rx) = WorkerPool::new(1, CancellationToken::new());
        pool.spawn_container(NodeId::new("iter"), 1, async { exploding_driver() }.boxed());

        let event = finished(&mut rx).await;
        assert!(matches!(
            event.kind,
            WorkerEventKind::Finished(JobOutcome::Failed(NodeExecutionError::ExecutionFailed { .. }))
        ));
    }

    #[tokio::test]
    async fn child_pool_shares_slots_and_cancellation() {
        let cancel = CancellationToken::new();
        let (pool, _rx) = WorkerPool::new(3, cancel);
        let (child, mut child_rx) = pool.child();
        assert_eq!(child.available_slots(), 3);

        child.spawn_container(NodeId::new("loop"), 1, async { JobOutcome::succeeded(NodeOutputs::new()) }.boxed());
        let event = finished(&mut child_rx).await;
        assert_eq!(event.node_id.as_str(), "loop");

        pool.cancel();
        assert!(child.cancellation().is_cancelled());
    }
}
