//! TaskScheduler -- admission control and the task state machine.
//!
//! Every submission is admitted or rejected under a single mutex, so the
//! check-and-set on a concurrency key is atomic with respect to concurrent
//! submissions. Admitted tasks go straight to RUNNING; there is no queue.
//! Each running task is driven by one tokio task that forwards executor
//! chunks to the [`LogMultiplexer`] and finalises the record on `Done`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cs_bridge::event_bus::{EventBus, Subscription};
use cs_bridge::log_stream::{LogMultiplexer, Replay};
use cs_bridge::protocol::{EventFilter, TaskEvent};
use cs_core::store::{StoreError, TaskStore};
use cs_core::types::{FailureKind, LogChunk, Task, TaskStatus, TaskType};
use cs_core::validation::{validate_submission, ValidationError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::AgentError;
use crate::executor::{AgentExecutor, AgentOutcome, Canceller, ExecutionEvent, ExecutionHandle};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid submission: {0}")]
    Validation(#[from] ValidationError),
    #[error("a task is already in progress for {key}")]
    AlreadyInProgress { key: String, existing_task_id: Uuid },
    #[error("capacity exceeded: {limit} tasks already running")]
    CapacityExceeded { limit: usize },
    #[error("task {0} not found")]
    NotFound(Uuid),
    #[error("task {id} is {status} and cannot be deleted")]
    NotTerminal { id: Uuid, status: TaskStatus },
    #[error("task {0} is still being finalised")]
    Finalising(Uuid),
    #[error("scheduler is shutting down")]
    ShuttingDown,
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

// ---------------------------------------------------------------------------
// Request / result types
// ---------------------------------------------------------------------------

/// A request to run one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    #[serde(rename = "type")]
    pub task_type: TaskType,
    #[serde(default)]
    pub domain_id: Option<String>,
    /// Agent identifier; the configured default when absent.
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub input_payload: serde_json::Value,
}

impl Submission {
    pub fn new(task_type: TaskType, domain_id: Option<&str>) -> Self {
        Self {
            task_type,
            domain_id: domain_id.map(String::from),
            agent: None,
            input_payload: serde_json::Value::Null,
        }
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.input_payload = payload;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The agent was asked to stop; CANCELLED follows through the normal
    /// completion path.
    Requested,
    /// The task had already finished. Nothing changed.
    AlreadyTerminal(TaskStatus),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Global cap on RUNNING tasks. `None` means unlimited.
    pub max_concurrent_tasks: Option<usize>,
    pub default_agent: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: None,
            default_agent: "claude-code".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// TaskScheduler
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SchedulerState {
    tasks: HashMap<Uuid, Task>,
    /// concurrency key -> occupying task
    keys: HashMap<String, Uuid>,
    running: HashMap<Uuid, Canceller>,
    /// Terminal tasks whose record, log and terminal event are not yet
    /// flushed.
    finalising: HashSet<Uuid>,
    shutting_down: bool,
}

struct Inner {
    state: Mutex<SchedulerState>,
    executor: AgentExecutor,
    logs: LogMultiplexer,
    store: Arc<dyn TaskStore>,
    config: SchedulerConfig,
}

/// Owns every task record and all status transitions. Cheap to clone.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<Inner>,
}

impl TaskScheduler {
    pub fn new(
        executor: AgentExecutor,
        logs: LogMultiplexer,
        store: Arc<dyn TaskStore>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SchedulerState::default()),
                executor,
                logs,
                store,
                config,
            }),
        }
    }

    pub fn event_bus(&self) -> &EventBus {
        self.inner.logs.bus()
    }

    pub fn logs(&self) -> &LogMultiplexer {
        &self.inner.logs
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Registered agent identifiers, sorted.
    pub fn agent_names(&self) -> Vec<String> {
        self.inner.executor.registry().names()
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Validate and admit a task.
    ///
    /// On success the returned record is the task as accepted (`PENDING`);
    /// by the time this returns it is already RUNNING. Must be called from
    /// within a tokio runtime.
    pub fn submit(&self, submission: Submission) -> Result<Task> {
        let inner = &self.inner;
        let domain_id = submission
            .domain_id
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(String::from);
        let payload = validate_submission(
            submission.task_type,
            domain_id.as_deref(),
            &submission.input_payload,
        )?;
        let agent = submission
            .agent
            .filter(|a| !a.trim().is_empty())
            .unwrap_or_else(|| inner.config.default_agent.clone());
        if !inner.executor.registry().contains(&agent) {
            return Err(ValidationError::UnknownAgent(agent).into());
        }
        let mut task = Task::new(submission.task_type, domain_id, agent, payload)
            .map_err(|e| SchedulerError::Internal(e.to_string()))?;
        let key = task.concurrency_key.clone();

        let mut guard = inner.state.lock().unwrap_or_else(|e| e.into_inner());
        let state = &mut *guard;
        if state.shutting_down {
            return Err(SchedulerError::ShuttingDown);
        }
        if let Some(existing) = state.keys.get(&key) {
            debug!(%key, existing = %existing, "submission rejected, key busy");
            return Err(SchedulerError::AlreadyInProgress {
                key,
                existing_task_id: *existing,
            });
        }
        if let Some(limit) = inner.config.max_concurrent_tasks {
            if state.running.len() >= limit {
                return Err(SchedulerError::CapacityExceeded { limit });
            }
        }

        let accepted = task.clone();
        task.transition(TaskStatus::Running)
            .map_err(|e| SchedulerError::Internal(e.to_string()))?;
        state.keys.insert(key.clone(), task.id);
        inner
            .logs
            .open(task.id, task.task_type, task.domain_id.clone());

        let started = inner.executor.start(&task);
        if let Ok(handle) = &started {
            state.running.insert(task.id, handle.canceller());
        }
        state.tasks.insert(task.id, task.clone());
        drop(guard);

        info!(task_id = %task.id, %key, agent = %task.agent, "task admitted");
        self.persist(&task);
        inner.logs.bus().publish(TaskEvent::started(&task));

        match started {
            Ok(handle) => {
                tokio::spawn(self.clone().drive(handle));
            }
            Err(error) => {
                warn!(task_id = %task.id, %error, "agent failed to start");
                self.finish(task.id, AgentOutcome::Failed(error));
            }
        }
        Ok(accepted)
    }

    async fn drive(self, handle: ExecutionHandle) {
        let task_id = handle.task_id();
        loop {
            match handle.next_event().await {
                Some(ExecutionEvent::Chunk { stream, data }) => {
                    if let Err(e) = self.inner.logs.append(task_id, stream, data) {
                        warn!(task_id = %task_id, error = %e, "dropping log chunk");
                    }
                }
                Some(ExecutionEvent::Done(outcome)) => {
                    self.finish(task_id, outcome);
                    return;
                }
                None => {
                    self.finish(
                        task_id,
                        AgentOutcome::Failed(AgentError::Protocol(
                            "execution ended without a result".into(),
                        )),
                    );
                    return;
                }
            }
        }
    }

    /// Apply a terminal outcome, release the key, then persist and publish.
    fn finish(&self, task_id: Uuid, outcome: AgentOutcome) {
        let task = {
            let mut guard = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            let state = &mut *guard;
            state.running.remove(&task_id);
            let Some(task) = state.tasks.get_mut(&task_id) else {
                return;
            };
            if task.is_terminal() {
                return;
            }
            let applied = match outcome {
                AgentOutcome::Completed(result) => task.complete(result),
                AgentOutcome::Failed(error) => task.fail(error.failure_kind(), &error.detail()),
                AgentOutcome::Cancelled => task.cancel(),
            };
            if let Err(e) = applied {
                warn!(task_id = %task_id, error = %e, "terminal transition rejected");
            }
            if state.keys.get(&task.concurrency_key) == Some(&task_id) {
                state.keys.remove(&task.concurrency_key);
            }
            let task = task.clone();
            state.finalising.insert(task_id);
            task
        };

        match task.status {
            TaskStatus::Failed => warn!(
                task_id = %task.id,
                error = task.error.as_deref().unwrap_or_default(),
                "task failed"
            ),
            status => info!(task_id = %task.id, %status, "task finished"),
        }
        self.flush_terminal(&task);
        self.inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .finalising
            .remove(&task_id);
    }

    /// Persist the final record and log, then close the buffer and publish
    /// the terminal event after every log event.
    fn flush_terminal(&self, task: &Task) {
        let logs = &self.inner.logs;
        let text = logs.text(&task.id).unwrap_or_default();
        self.persist(task);
        if let Err(e) = self.inner.store.save_log(&task.id, &text) {
            warn!(task_id = %task.id, error = %e, "failed to persist task log");
        }
        logs.close(&task.id, TaskEvent::terminal(task));
    }

    fn persist(&self, task: &Task) {
        if let Err(e) = self.inner.store.save_task(task) {
            warn!(task_id = %task.id, error = %e, "failed to persist task");
        }
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    /// Request cancellation of a running task. Idempotent; a no-op for
    /// finished tasks.
    pub fn cancel(&self, task_id: Uuid) -> Result<CancelOutcome> {
        let state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        let task = state
            .tasks
            .get(&task_id)
            .ok_or(SchedulerError::NotFound(task_id))?;
        if task.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal(task.status));
        }
        if let Some(canceller) = state.running.get(&task_id) {
            if canceller.cancel() {
                info!(task_id = %task_id, "cancellation requested");
            }
        }
        Ok(CancelOutcome::Requested)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// All PENDING or RUNNING tasks, oldest first.
    pub fn list_pending(&self) -> Vec<Task> {
        self.collect(|t| !t.is_terminal())
    }

    /// All known tasks, oldest first, optionally filtered by status.
    pub fn list_tasks(&self, status: Option<TaskStatus>) -> Vec<Task> {
        self.collect(|t| status.is_none_or(|s| t.status == s))
    }

    fn collect(&self, keep: impl Fn(&Task) -> bool) -> Vec<Task> {
        let state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut tasks: Vec<Task> = state.tasks.values().filter(|t| keep(t)).cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tasks
    }

    pub fn get_task(&self, task_id: &Uuid) -> Option<Task> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .tasks
            .get(task_id)
            .cloned()
    }

    /// Full log text: the live buffer while it exists, the persisted copy
    /// otherwise.
    pub fn get_logs(&self, task_id: &Uuid) -> Result<String> {
        if self.get_task(task_id).is_none() {
            return Err(SchedulerError::NotFound(*task_id));
        }
        if let Some(text) = self.inner.logs.text(task_id) {
            return Ok(text);
        }
        match self.inner.store.load_log(task_id) {
            Ok(text) => Ok(text.unwrap_or_default()),
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "failed to load persisted log");
                Ok(String::new())
            }
        }
    }

    /// Structured chunks with `sequence >= from`. Empty for tasks whose
    /// buffer is no longer in memory.
    pub fn get_log_chunks(&self, task_id: &Uuid, from: u64) -> Result<Vec<LogChunk>> {
        if self.get_task(task_id).is_none() {
            return Err(SchedulerError::NotFound(*task_id));
        }
        Ok(self
            .inner
            .logs
            .get_buffer_from(task_id, from)
            .unwrap_or_default())
    }

    /// Live events matching `filter`.
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.inner.logs.bus().subscribe(filter)
    }

    /// Buffered chunks from `from` plus a live subscription for the task.
    pub fn subscribe_logs(&self, task_id: Uuid, from: u64) -> Result<Option<Replay>> {
        if self.get_task(&task_id).is_none() {
            return Err(SchedulerError::NotFound(task_id));
        }
        Ok(self.inner.logs.subscribe_with_replay(task_id, from))
    }

    pub fn running_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .running
            .len()
    }

    /// The task occupying `key`, if any.
    pub fn is_key_busy(&self, key: &str) -> Option<Uuid> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys
            .get(key)
            .copied()
    }

    pub fn counts(&self) -> TaskCounts {
        let state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut counts = TaskCounts::default();
        for task in state.tasks.values() {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    // -----------------------------------------------------------------------
    // Deletion
    // -----------------------------------------------------------------------

    /// Remove a finished task and its log, in memory and in the store.
    pub fn delete(&self, task_id: &Uuid) -> Result<Task> {
        let removed = {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            let task = state
                .tasks
                .get(task_id)
                .ok_or(SchedulerError::NotFound(*task_id))?;
            if !task.is_terminal() {
                return Err(SchedulerError::NotTerminal {
                    id: *task_id,
                    status: task.status,
                });
            }
            if state.finalising.contains(task_id) {
                return Err(SchedulerError::Finalising(*task_id));
            }
            state.tasks.remove(task_id)
        };
        let task = removed.ok_or(SchedulerError::NotFound(*task_id))?;
        self.inner.logs.forget(task_id);
        if let Err(e) = self.inner.store.delete_task(task_id) {
            warn!(task_id = %task_id, error = %e, "failed to delete persisted task");
        }
        info!(task_id = %task_id, "task deleted");
        Ok(task)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Load persisted tasks at startup. Anything still PENDING or RUNNING
    /// has lost its executor and is resolved to FAILED(ProcessRestarted).
    /// Returns the tasks that were resolved this way.
    pub fn recover(&self) -> std::result::Result<Vec<Task>, StoreError> {
        let persisted = self.inner.store.list_all()?;
        let mut recovered = Vec::new();
        {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            for mut task in persisted {
                if state.tasks.contains_key(&task.id) {
                    continue;
                }
                if !task.is_terminal() {
                    if let Err(e) = task.fail(
                        FailureKind::ProcessRestarted,
                        "process restarted before the task finished",
                    ) {
                        warn!(task_id = %task.id, error = %e, "could not resolve recovered task");
                        continue;
                    }
                    recovered.push(task.clone());
                }
                state.tasks.insert(task.id, task);
            }
        }
        for task in &recovered {
            info!(task_id = %task.id, key = %task.concurrency_key, "resolved interrupted task");
            self.persist(task);
        }
        Ok(recovered)
    }

    /// Stop admitting work, cancel every running task and wait up to
    /// `grace` for them to reach a terminal state and be flushed. Returns the
    /// number of tasks still unsettled when the wait ended.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        let cancelled = {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            state.shutting_down = true;
            for canceller in state.running.values() {
                canceller.cancel();
            }
            state.running.len()
        };
        if cancelled > 0 {
            info!(count = cancelled, "cancelling running tasks for shutdown");
        }

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let remaining = {
                let state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
                state.running.len() + state.finalising.len()
            };
            if remaining == 0 || tokio::time::Instant::now() >= deadline {
                return remaining;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
