use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Concurrency key shared by every codebase-wide analysis.
pub const GLOBAL_ANALYSIS_KEY: &str = "global:codebase-analysis";

// ---------------------------------------------------------------------------
// TaskType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    CodebaseAnalysis,
    Documentation,
    Requirements,
    BugsSecurity,
    Testing,
    Diagrams,
    Chat,
}

impl TaskType {
    /// Every variant, in declaration order.
    pub fn all() -> &'static [TaskType] {
        &[
            TaskType::CodebaseAnalysis,
            TaskType::Documentation,
            TaskType::Requirements,
            TaskType::BugsSecurity,
            TaskType::Testing,
            TaskType::Diagrams,
            TaskType::Chat,
        ]
    }

    /// Domain-scoped tasks need a `domain_id` and serialize per domain.
    pub fn is_domain_scoped(&self) -> bool {
        !matches!(self, TaskType::CodebaseAnalysis)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::CodebaseAnalysis => "codebase-analysis",
            TaskType::Documentation => "documentation",
            TaskType::Requirements => "requirements",
            TaskType::BugsSecurity => "bugs-security",
            TaskType::Testing => "testing",
            TaskType::Diagrams => "diagrams",
            TaskType::Chat => "chat",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derive the mutual-exclusion key for a submission.
///
/// Domain-scoped work is keyed `"<domain_id>:<type>"`; codebase-wide analysis
/// shares [`GLOBAL_ANALYSIS_KEY`]. `None` when `domain_id` does not fit the
/// type's scope.
pub fn concurrency_key(task_type: TaskType, domain_id: Option<&str>) -> Option<String> {
    match (task_type.is_domain_scoped(), domain_id) {
        (true, Some(domain)) => Some(format!("{domain}:{task_type}")),
        (false, None) => Some(GLOBAL_ANALYSIS_KEY.to_string()),
        _ => None,
    }
}

/// A domain given to codebase-wide work, or missing from domain-scoped work.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("domain {domain_id:?} does not fit the scope of {task_type} tasks")]
pub struct ScopeError {
    pub task_type: TaskType,
    pub domain_id: Option<String>,
}

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Returns `true` when a transition from `self` to `target` is valid.
    /// Transitions only move forward; terminal states are final.
    pub fn can_transition_to(&self, target: &TaskStatus) -> bool {
        matches!(
            (self, target),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Pending, TaskStatus::Failed)
                | (TaskStatus::Pending, TaskStatus::Cancelled)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(TaskStatus::Pending),
            "RUNNING" => Ok(TaskStatus::Running),
            "COMPLETED" => Ok(TaskStatus::Completed),
            "FAILED" => Ok(TaskStatus::Failed),
            "CANCELLED" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// FailureKind
// ---------------------------------------------------------------------------

/// Why a task ended in `FAILED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    Validation,
    AgentUnavailable,
    AgentProtocolError,
    AgentTimeout,
    ProcessRestarted,
    Internal,
}

impl FailureKind {
    /// Transient causes the UI may offer to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureKind::AgentUnavailable | FailureKind::AgentTimeout | FailureKind::ProcessRestarted
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Validation => "ValidationError",
            FailureKind::AgentUnavailable => "AgentUnavailable",
            FailureKind::AgentProtocolError => "AgentProtocolError",
            FailureKind::AgentTimeout => "AgentTimeout",
            FailureKind::ProcessRestarted => "ProcessRestarted",
            FailureKind::Internal => "InternalError",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// One unit of asynchronous analysis work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub concurrency_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_id: Option<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub agent: String,
    #[serde(default)]
    pub input_payload: serde_json::Value,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub failure_kind: Option<FailureKind>,
    #[serde(default)]
    pub retryable: bool,
    /// Identifier of the log buffer holding this task's output.
    pub log_handle: Uuid,
}

impl Task {
    /// Create a new `PENDING` task. The concurrency key is derived from the
    /// type and domain.
    pub fn new(
        task_type: TaskType,
        domain_id: Option<String>,
        agent: impl Into<String>,
        input_payload: serde_json::Value,
    ) -> Result<Self, ScopeError> {
        let Some(key) = concurrency_key(task_type, domain_id.as_deref()) else {
            return Err(ScopeError {
                task_type,
                domain_id,
            });
        };
        let id = Uuid::new_v4();
        Ok(Self {
            id,
            task_type,
            concurrency_key: key,
            domain_id,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            agent: agent.into(),
            input_payload,
            result: None,
            error: None,
            failure_kind: None,
            retryable: false,
            log_handle: id,
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move the task forward, stamping `started_at` / `finished_at`.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(&next) {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        match next {
            TaskStatus::Running => self.started_at = Some(Utc::now()),
            s if s.is_terminal() => self.finished_at = Some(Utc::now()),
            _ => {}
        }
        Ok(())
    }

    pub fn complete(&mut self, result: serde_json::Value) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Completed)?;
        self.result = Some(result);
        Ok(())
    }

    pub fn fail(&mut self, kind: FailureKind, message: &str) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Failed)?;
        self.error = Some(format!("{kind}: {message}"));
        self.failure_kind = Some(kind);
        self.retryable = kind.is_retryable();
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid task transition from {from} to {to}")]
pub struct TransitionError {
    pub from: TaskStatus,
    pub to: TaskStatus,
}

// ---------------------------------------------------------------------------
// Log chunks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl fmt::Display for LogStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogStream::Stdout => f.write_str("stdout"),
            LogStream::Stderr => f.write_str("stderr"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogChunk {
    pub stream: LogStream,
    pub data: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogBufferError {
    #[error("log buffer for task {0} is closed")]
    Closed(Uuid),
}

/// Append-only, gapless sequence of chunks for a single task.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    task_id: Uuid,
    chunks: Vec<LogChunk>,
    closed: bool,
}

impl LogBuffer {
    pub fn new(task_id: Uuid) -> Self {
        Self {
            task_id,
            chunks: Vec::new(),
            closed: false,
        }
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    /// Append a chunk, assigning the next sequence number.
    pub fn append(
        &mut self,
        stream: LogStream,
        data: impl Into<String>,
    ) -> Result<&LogChunk, LogBufferError> {
        if self.closed {
            return Err(LogBufferError::Closed(self.task_id));
        }
        let sequence = self.chunks.len() as u64;
        self.chunks.push(LogChunk {
            stream,
            data: data.into(),
            sequence,
            timestamp: Utc::now(),
        });
        Ok(&self.chunks[sequence as usize])
    }

    pub fn chunks(&self) -> &[LogChunk] {
        &self.chunks
    }

    /// Chunks with `sequence >= from`.
    pub fn chunks_from(&self, from: u64) -> &[LogChunk] {
        let start = (from as usize).min(self.chunks.len());
        &self.chunks[start..]
    }

    /// Sequence number the next append will receive.
    pub fn next_sequence(&self) -> u64 {
        self.chunks.len() as u64
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Concatenated chunk data in sequence order.
    pub fn to_text(&self) -> String {
        self.chunks.iter().map(|c| c.data.as_str()).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
