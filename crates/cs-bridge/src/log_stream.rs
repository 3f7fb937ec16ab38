use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use cs_core::types::{LogBuffer, LogBufferError, LogChunk, LogStream, TaskType};
use dashmap::DashMap;
use uuid::Uuid;

use crate::event_bus::{EventBus, Subscription};
use crate::protocol::{EventFilter, ProgressPayload, TaskEvent};

/// Lines with this prefix additionally publish `task:progress`.
pub const PROGRESS_PREFIX: &str = "[PROGRESS]";

/// Closed buffers kept in memory by [`LogMultiplexer::new`].
pub const DEFAULT_RETAINED_CLOSED: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogStreamError {
    #[error("no log buffer for task {0}")]
    UnknownTask(Uuid),
    #[error(transparent)]
    Buffer(#[from] LogBufferError),
}

struct TaskLog {
    buffer: LogBuffer,
    task_type: TaskType,
    domain_id: Option<String>,
}

/// Result of [`LogMultiplexer::subscribe_with_replay`].
pub struct Replay {
    /// Chunks already buffered at subscription time, in sequence order.
    pub chunks: Vec<LogChunk>,
    /// `true` if the buffer was already closed; no further live events for
    /// the task will arrive on `subscription`.
    pub closed: bool,
    /// Live task-scoped events published after `chunks`.
    pub subscription: Subscription,
}

/// Per-task log buffers with live fan-out through the [`EventBus`].
///
/// Each buffer sits behind its own mutex. Appends publish while holding it,
/// and replay subscriptions register while holding it, so a late subscriber
/// sees every chunk exactly once: either in the replay or live.
///
/// Open buffers are never evicted. Once more than `retain_closed` buffers are
/// closed, the oldest closed one is dropped; its text is expected to be in
/// the task store by then.
#[derive(Clone)]
pub struct LogMultiplexer {
    buffers: Arc<DashMap<Uuid, Arc<Mutex<TaskLog>>>>,
    closed: Arc<Mutex<VecDeque<Uuid>>>,
    retain_closed: usize,
    bus: EventBus,
}

impl LogMultiplexer {
    pub fn new(bus: EventBus) -> Self {
        Self::with_retention(bus, DEFAULT_RETAINED_CLOSED)
    }

    pub fn with_retention(bus: EventBus, retain_closed: usize) -> Self {
        Self {
            buffers: Arc::new(DashMap::new()),
            closed: Arc::new(Mutex::new(VecDeque::new())),
            retain_closed,
            bus,
        }
    }

    pub fn retain_closed(&self) -> usize {
        self.retain_closed
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Create the buffer for a task entering RUNNING. Re-opening an existing
    /// buffer is a no-op.
    pub fn open(&self, task_id: Uuid, task_type: TaskType, domain_id: Option<String>) {
        self.buffers.entry(task_id).or_insert_with(|| {
            Arc::new(Mutex::new(TaskLog {
                buffer: LogBuffer::new(task_id),
                task_type,
                domain_id,
            }))
        });
    }

    fn entry(&self, task_id: &Uuid) -> Result<Arc<Mutex<TaskLog>>, LogStreamError> {
        self.buffers
            .get(task_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or(LogStreamError::UnknownTask(*task_id))
    }

    /// Append a chunk, assign its sequence number and publish `task:log`
    /// (plus `task:progress` for progress lines).
    pub fn append(
        &self,
        task_id: Uuid,
        stream: LogStream,
        data: impl Into<String>,
    ) -> Result<LogChunk, LogStreamError> {
        let entry = self.entry(&task_id)?;
        let mut log = entry.lock().unwrap_or_else(|e| e.into_inner());
        let chunk = log.buffer.append(stream, data)?.clone();

        self.bus.publish(TaskEvent::log(
            task_id,
            log.task_type,
            log.domain_id.clone(),
            &chunk,
        ));
        if stream == LogStream::Stdout {
            if let Some(message) = progress_message(&chunk.data) {
                self.bus.publish(TaskEvent::Progress(ProgressPayload {
                    task_id,
                    task_type: log.task_type,
                    domain_id: log.domain_id.clone(),
                    message,
                }));
            }
        }
        tracing::debug!(task_id = %task_id, sequence = chunk.sequence, %stream, "log chunk appended");
        Ok(chunk)
    }

    /// Full ordered replay of a task's chunks.
    pub fn get_buffer(&self, task_id: &Uuid) -> Option<Vec<LogChunk>> {
        self.get_buffer_from(task_id, 0)
    }

    /// Chunks with `sequence >= from`.
    pub fn get_buffer_from(&self, task_id: &Uuid, from: u64) -> Option<Vec<LogChunk>> {
        let entry = self.entry(task_id).ok()?;
        let log = entry.lock().unwrap_or_else(|e| e.into_inner());
        Some(log.buffer.chunks_from(from).to_vec())
    }

    /// Concatenated text of everything appended so far.
    pub fn text(&self, task_id: &Uuid) -> Option<String> {
        let entry = self.entry(task_id).ok()?;
        let log = entry.lock().unwrap_or_else(|e| e.into_inner());
        Some(log.buffer.to_text())
    }

    pub fn is_closed(&self, task_id: &Uuid) -> Option<bool> {
        let entry = self.entry(task_id).ok()?;
        let log = entry.lock().unwrap_or_else(|e| e.into_inner());
        Some(log.buffer.is_closed())
    }

    /// Mark the buffer immutable and return its text for the persistence
    /// flush. If `terminal` is given it is published under the same lock, so
    /// no replay subscriber can miss it.
    pub fn close(&self, task_id: &Uuid, terminal: Option<TaskEvent>) -> Option<String> {
        let entry = self.entry(task_id).ok()?;
        let (text, newly_closed) = {
            let mut log = entry.lock().unwrap_or_else(|e| e.into_inner());
            let newly_closed = !log.buffer.is_closed();
            log.buffer.close();
            if let Some(event) = terminal {
                self.bus.publish(event);
            }
            (log.buffer.to_text(), newly_closed)
        };
        if newly_closed {
            self.evict_closed(*task_id);
        }
        Some(text)
    }

    fn evict_closed(&self, just_closed: Uuid) {
        let evicted: Vec<Uuid> = {
            let mut closed = self.closed.lock().unwrap_or_else(|e| e.into_inner());
            closed.push_back(just_closed);
            let excess = closed.len().saturating_sub(self.retain_closed);
            closed.drain(..excess).collect()
        };
        for id in evicted {
            self.buffers.remove(&id);
            tracing::debug!(task_id = %id, "evicted closed log buffer");
        }
    }

    /// Register a live subscription for `task_id` and return the chunks with
    /// `sequence >= from` buffered so far.
    ///
    /// Registration and the buffer snapshot happen atomically with respect
    /// to [`append`](Self::append): no chunk is lost or duplicated between
    /// the replay and the live stream.
    pub fn subscribe_with_replay(&self, task_id: Uuid, from: u64) -> Option<Replay> {
        let entry = self.entry(&task_id).ok()?;
        let log = entry.lock().unwrap_or_else(|e| e.into_inner());
        let subscription = self.bus.subscribe(EventFilter::Task(task_id));
        Some(Replay {
            chunks: log.buffer.chunks_from(from).to_vec(),
            closed: log.buffer.is_closed(),
            subscription,
        })
    }

    /// Drop a task's buffer from memory.
    pub fn forget(&self, task_id: &Uuid) -> bool {
        self.closed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|id| id != task_id);
        self.buffers.remove(task_id).is_some()
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }
}

/// Remainder of a `[PROGRESS]` line, trimmed.
pub fn progress_message(data: &str) -> Option<String> {
    let rest = data.trim_start().strip_prefix(PROGRESS_PREFIX)?;
    Some(rest.trim().to_string())
}
