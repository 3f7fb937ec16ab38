use std::time::Duration;

use async_trait::async_trait;
use cs_core::types::{FailureKind, LogStream, TaskType};
use cs_core::validation::ValidationError;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::executor::ExecutionEvent;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AgentError {
    #[error("agent unavailable: {0}")]
    Unavailable(String),
    #[error("agent protocol error: {0}")]
    Protocol(String),
    #[error("agent timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("invalid submission: {0}")]
    Validation(#[from] ValidationError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AgentError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            AgentError::Unavailable(_) => FailureKind::AgentUnavailable,
            AgentError::Protocol(_) => FailureKind::AgentProtocolError,
            AgentError::Timeout(_) => FailureKind::AgentTimeout,
            AgentError::Validation(_) => FailureKind::Validation,
            AgentError::Internal(_) => FailureKind::Internal,
        }
    }

    /// Human-readable detail without the kind prefix.
    pub fn detail(&self) -> String {
        match self {
            AgentError::Unavailable(m) | AgentError::Protocol(m) | AgentError::Internal(m) => {
                m.clone()
            }
            AgentError::Timeout(d) => format!("exceeded {}s", d.as_secs()),
            AgentError::Validation(e) => e.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// Everything an agent needs to perform one task.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub task_id: Uuid,
    pub task_type: TaskType,
    pub domain_id: Option<String>,
    pub payload: Value,
    /// Rendered prompt for this task type.
    pub prompt: String,
}

/// Where an agent writes its incremental output.
///
/// Chunks are delivered to the executor in call order and are never
/// dropped while the executor is alive.
#[derive(Clone)]
pub struct ChunkSink {
    tx: flume::Sender<ExecutionEvent>,
}

impl ChunkSink {
    pub(crate) fn new(tx: flume::Sender<ExecutionEvent>) -> Self {
        Self { tx }
    }

    /// Emit a chunk. Returns `false` if nobody is listening any more.
    pub fn emit(&self, stream: LogStream, data: impl Into<String>) -> bool {
        self.tx
            .send(ExecutionEvent::Chunk {
                stream,
                data: data.into(),
            })
            .is_ok()
    }

    pub fn stdout(&self, data: impl Into<String>) -> bool {
        self.emit(LogStream::Stdout, data)
    }

    pub fn stderr(&self, data: impl Into<String>) -> bool {
        self.emit(LogStream::Stderr, data)
    }

    /// Emit a `[PROGRESS]` line.
    pub fn progress(&self, message: &str) -> bool {
        self.stdout(format!("{} {message}\n", cs_bridge::log_stream::PROGRESS_PREFIX))
    }
}

// ---------------------------------------------------------------------------
// Agent trait
// ---------------------------------------------------------------------------

/// An external analysis capability.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Identifier used in task records and the registry.
    fn name(&self) -> &str;

    /// Cheap synchronous checks run before anything is spawned. A failure
    /// here fails the task without starting the agent.
    fn preflight(&self, _invocation: &AgentInvocation) -> Result<(), AgentError> {
        Ok(())
    }

    /// Perform the work, streaming output through `sink`.
    ///
    /// The future may be dropped at any await point when the task is
    /// cancelled or times out; implementations must release external
    /// resources on drop.
    async fn run(&self, invocation: AgentInvocation, sink: ChunkSink) -> Result<Value, AgentError>;
}
