use std::sync::Arc;
use std::time::Duration;

use cs_core::types::{LogStream, Task};
use cs_core::validation::{validate_submission, ValidationError};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::agent::{AgentError, AgentInvocation, ChunkSink};
use crate::prompts::build_prompt;
use crate::registry::AgentRegistry;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// How an execution ended.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutcome {
    Completed(Value),
    Failed(AgentError),
    Cancelled,
}

/// What an [`ExecutionHandle`] yields: zero or more chunks, then exactly one
/// `Done`.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    Chunk { stream: LogStream, data: String },
    Done(AgentOutcome),
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cloneable cancel switch for a running execution.
#[derive(Clone)]
pub struct Canceller {
    tx: Arc<watch::Sender<bool>>,
}

impl Canceller {
    fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx: Arc::new(tx) }, rx)
    }

    /// Request cancellation. Returns `true` only for the first request.
    pub fn cancel(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

// ---------------------------------------------------------------------------
// ExecutionHandle
// ---------------------------------------------------------------------------

/// A single in-flight agent invocation.
pub struct ExecutionHandle {
    task_id: Uuid,
    events: flume::Receiver<ExecutionEvent>,
    canceller: Canceller,
}

impl ExecutionHandle {
    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    /// Next chunk or the final `Done`. Returns `None` only after `Done` has
    /// been yielded (or if the execution task was torn down by the runtime).
    pub async fn next_event(&self) -> Option<ExecutionEvent> {
        self.events.recv_async().await.ok()
    }

    /// Best-effort stop. `Done(Cancelled)` still arrives exactly once.
    pub fn cancel(&self) -> bool {
        self.canceller.cancel()
    }

    pub fn canceller(&self) -> Canceller {
        self.canceller.clone()
    }
}

// ---------------------------------------------------------------------------
// AgentExecutor
// ---------------------------------------------------------------------------

/// Starts agent invocations and enforces the per-task timeout.
#[derive(Clone)]
pub struct AgentExecutor {
    registry: Arc<AgentRegistry>,
    timeout: Duration,
}

impl AgentExecutor {
    pub fn new(registry: Arc<AgentRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Begin executing `task` in the background.
    ///
    /// Validation, agent lookup and the agent's preflight happen here; any
    /// failure is returned before anything is spawned. Must be called from
    /// within a tokio runtime.
    pub fn start(&self, task: &Task) -> Result<ExecutionHandle, AgentError> {
        let payload =
            validate_submission(task.task_type, task.domain_id.as_deref(), &task.input_payload)?;
        let agent = self
            .registry
            .get(&task.agent)
            .ok_or_else(|| ValidationError::UnknownAgent(task.agent.clone()))?;

        let invocation = AgentInvocation {
            task_id: task.id,
            task_type: task.task_type,
            domain_id: task.domain_id.clone(),
            prompt: build_prompt(task.task_type, task.domain_id.as_deref(), &payload),
            payload,
        };
        agent.preflight(&invocation)?;

        let (tx, rx) = flume::unbounded();
        let (canceller, mut cancel_rx) = Canceller::new();
        let keep_alive = canceller.clone();
        let timeout = self.timeout;
        let task_id = task.id;
        let span = cs_telemetry::tracing_setup::task_span(&task.id, task.task_type.as_str(), agent.name());

        tokio::spawn(
            async move {
                let _keep_alive = keep_alive;
                let sink = ChunkSink::new(tx.clone());
                let mut run = tokio::spawn(
                    async move { agent.run(invocation, sink).await }.instrument(tracing::Span::current()),
                );
                let cancelled = async move {
                    let _ = cancel_rx.wait_for(|c| *c).await;
                };
                info!("agent started");

                let outcome = tokio::select! {
                    biased;
                    _ = cancelled => {
                        run.abort();
                        let _ = (&mut run).await;
                        AgentOutcome::Cancelled
                    }
                    joined = &mut run => match joined {
                        Ok(Ok(result)) => AgentOutcome::Completed(result),
                        Ok(Err(e)) => AgentOutcome::Failed(e),
                        Err(e) if e.is_panic() => {
                            AgentOutcome::Failed(AgentError::Protocol("agent panicked".into()))
                        }
                        Err(e) => AgentOutcome::Failed(AgentError::Internal(e.to_string())),
                    },
                    _ = tokio::time::sleep(timeout) => {
                        warn!(timeout_secs = timeout.as_secs(), "agent timed out, cancelling");
                        run.abort();
                        let _ = (&mut run).await;
                        AgentOutcome::Failed(AgentError::Timeout(timeout))
                    }
                };

                debug!(?outcome, "agent finished");
                if tx.send(ExecutionEvent::Done(outcome)).is_err() {
                    debug!("execution handle dropped before completion");
                }
            }
            .instrument(span),
        );

        Ok(ExecutionHandle {
            task_id,
            events: rx,
            canceller,
        })
    }
}
