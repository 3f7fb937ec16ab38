use chrono::{DateTime, Utc};
use cs_core::types::{FailureKind, LogChunk, LogStream, Task, TaskType};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Task lifecycle and log events, as delivered to subscribers.
///
/// Serialised with an inline `type` tag, e.g.
/// `{"type":"task:log","taskId":"…","sequence":3,"data":"…"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TaskEvent {
    #[serde(rename = "task:started")]
    Started(StartedPayload),
    #[serde(rename = "task:progress")]
    Progress(ProgressPayload),
    #[serde(rename = "task:log")]
    Log(LogPayload),
    #[serde(rename = "task:completed")]
    Completed(CompletedPayload),
    #[serde(rename = "task:failed")]
    Failed(FailedPayload),
    #[serde(rename = "task:cancelled")]
    Cancelled(CancelledPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedPayload {
    pub task_id: Uuid,
    pub task_type: TaskType,
    pub domain_id: Option<String>,
    pub agent: String,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPayload {
    pub task_id: Uuid,
    pub task_type: TaskType,
    pub domain_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogPayload {
    pub task_id: Uuid,
    pub task_type: TaskType,
    pub domain_id: Option<String>,
    pub stream: LogStream,
    pub data: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPayload {
    pub task_id: Uuid,
    pub task_type: TaskType,
    pub domain_id: Option<String>,
    pub result: serde_json::Value,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedPayload {
    pub task_id: Uuid,
    pub task_type: TaskType,
    pub domain_id: Option<String>,
    pub error: String,
    pub failure_kind: Option<FailureKind>,
    pub retryable: bool,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledPayload {
    pub task_id: Uuid,
    pub task_type: TaskType,
    pub domain_id: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskEvent {
    pub fn started(task: &Task) -> Self {
        TaskEvent::Started(StartedPayload {
            task_id: task.id,
            task_type: task.task_type,
            domain_id: task.domain_id.clone(),
            agent: task.agent.clone(),
            started_at: task.started_at,
        })
    }

    pub fn log(task_id: Uuid, task_type: TaskType, domain_id: Option<String>, chunk: &LogChunk) -> Self {
        TaskEvent::Log(LogPayload {
            task_id,
            task_type,
            domain_id,
            stream: chunk.stream,
            data: chunk.data.clone(),
            sequence: chunk.sequence,
            timestamp: chunk.timestamp,
        })
    }

    /// Terminal event matching a task's final status, or `None` if the task
    /// has not finished.
    pub fn terminal(task: &Task) -> Option<Self> {
        use cs_core::types::TaskStatus;
        let event = match task.status {
            TaskStatus::Completed => TaskEvent::Completed(CompletedPayload {
                task_id: task.id,
                task_type: task.task_type,
                domain_id: task.domain_id.clone(),
                result: task.result.clone().unwrap_or(serde_json::Value::Null),
                finished_at: task.finished_at,
            }),
            TaskStatus::Failed => TaskEvent::Failed(FailedPayload {
                task_id: task.id,
                task_type: task.task_type,
                domain_id: task.domain_id.clone(),
                error: task.error.clone().unwrap_or_default(),
                failure_kind: task.failure_kind,
                retryable: task.retryable,
                finished_at: task.finished_at,
            }),
            TaskStatus::Cancelled => TaskEvent::Cancelled(CancelledPayload {
                task_id: task.id,
                task_type: task.task_type,
                domain_id: task.domain_id.clone(),
                finished_at: task.finished_at,
            }),
            TaskStatus::Pending | TaskStatus::Running => return None,
        };
        Some(event)
    }

    pub fn task_id(&self) -> Uuid {
        match self {
            TaskEvent::Started(p) => p.task_id,
            TaskEvent::Progress(p) => p.task_id,
            TaskEvent::Log(p) => p.task_id,
            TaskEvent::Completed(p) => p.task_id,
            TaskEvent::Failed(p) => p.task_id,
            TaskEvent::Cancelled(p) => p.task_id,
        }
    }

    pub fn domain_id(&self) -> Option<&str> {
        match self {
            TaskEvent::Started(p) => p.domain_id.as_deref(),
            TaskEvent::Progress(p) => p.domain_id.as_deref(),
            TaskEvent::Log(p) => p.domain_id.as_deref(),
            TaskEvent::Completed(p) => p.domain_id.as_deref(),
            TaskEvent::Failed(p) => p.domain_id.as_deref(),
            TaskEvent::Cancelled(p) => p.domain_id.as_deref(),
        }
    }

    /// The wire name carried in the `type` tag.
    pub fn name(&self) -> &'static str {
        match self {
            TaskEvent::Started(_) => "task:started",
            TaskEvent::Progress(_) => "task:progress",
            TaskEvent::Log(_) => "task:log",
            TaskEvent::Completed(_) => "task:completed",
            TaskEvent::Failed(_) => "task:failed",
            TaskEvent::Cancelled(_) => "task:cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskEvent::Completed(_) | TaskEvent::Failed(_) | TaskEvent::Cancelled(_)
        )
    }
}

/// Transport-level frames that are not task events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    Ping,
    /// The subscriber fell behind and its live stream was dropped; the
    /// client should refetch the full log buffer.
    StreamTruncated,
}

/// Which events a subscription wants.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EventFilter {
    #[default]
    All,
    Task(Uuid),
    Domain(String),
}

impl EventFilter {
    pub fn matches(&self, event: &TaskEvent) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Task(id) => event.task_id() == *id,
            EventFilter::Domain(domain) => event.domain_id() == Some(domain.as_str()),
        }
    }
}
