use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use uuid::Uuid;

use crate::types::{Task, TaskStatus};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// TaskStore
// ---------------------------------------------------------------------------

/// Durable home for task records and their final log text.
///
/// The scheduler keeps the working copy in memory and flushes here on
/// terminal transitions; at startup it reads back whatever was left running.
pub trait TaskStore: Send + Sync {
    fn save_task(&self, task: &Task) -> Result<(), StoreError>;
    fn load_task(&self, id: &Uuid) -> Result<Option<Task>, StoreError>;
    /// Removes the record and its log. Returns `true` if a record existed.
    fn delete_task(&self, id: &Uuid) -> Result<bool, StoreError>;
    fn save_log(&self, task_id: &Uuid, text: &str) -> Result<(), StoreError>;
    fn load_log(&self, task_id: &Uuid) -> Result<Option<String>, StoreError>;
    fn list_all(&self) -> Result<Vec<Task>, StoreError>;

    fn list_by_status(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>, StoreError> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|t| statuses.contains(&t.status))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// JsonFileStore
// ---------------------------------------------------------------------------

/// File-system-backed task persistence.
///
/// Layout under `base_dir`:
///   `tasks/<id>.json` pretty-printed task record
///   `logs/<id>.log`   concatenated log text
pub struct JsonFileStore {
    base_dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn tasks_dir(&self) -> PathBuf {
        self.base_dir.join("tasks")
    }

    fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    fn task_path(&self, id: &Uuid) -> PathBuf {
        self.tasks_dir().join(format!("{}.json", id))
    }

    fn log_path(&self, id: &Uuid) -> PathBuf {
        self.logs_dir().join(format!("{}.log", id))
    }

    /// Write to a sibling temp file then rename, so a crash never leaves a
    /// half-written record behind.
    fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl TaskStore for JsonFileStore {
    fn save_task(&self, task: &Task) -> Result<(), StoreError> {
        std::fs::create_dir_all(self.tasks_dir())?;
        let json = serde_json::to_string_pretty(task)?;
        Self::write_atomic(&self.task_path(&task.id), json.as_bytes())
    }

    fn load_task(&self, id: &Uuid) -> Result<Option<Task>, StoreError> {
        let path = self.task_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&data)?))
    }

    fn delete_task(&self, id: &Uuid) -> Result<bool, StoreError> {
        let path = self.task_path(id);
        let existed = path.exists();
        if existed {
            std::fs::remove_file(path)?;
        }
        let log = self.log_path(id);
        if log.exists() {
            std::fs::remove_file(log)?;
        }
        Ok(existed)
    }

    fn save_log(&self, task_id: &Uuid, text: &str) -> Result<(), StoreError> {
        std::fs::create_dir_all(self.logs_dir())?;
        Self::write_atomic(&self.log_path(task_id), text.as_bytes())
    }

    fn load_log(&self, task_id: &Uuid) -> Result<Option<String>, StoreError> {
        let path = self.log_path(task_id);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(std::fs::read_to_string(path)?))
    }

    fn list_all(&self) -> Result<Vec<Task>, StoreError> {
        let dir = self.tasks_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut tasks = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = match std::fs::read_to_string(&path) {
                Ok(d) => d,
                Err(_) => continue,
            };
            match serde_json::from_str::<Task>(&data) {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable task record");
                }
            }
        }
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// In-process store used when persistence is disabled and in tests.
#[derive(Default)]
pub struct MemoryStore {
    tasks: Mutex<HashMap<Uuid, Task>>,
    logs: Mutex<HashMap<Uuid, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskStore for MemoryStore {
    fn save_task(&self, task: &Task) -> Result<(), StoreError> {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task.id, task.clone());
        Ok(())
    }

    fn load_task(&self, id: &Uuid) -> Result<Option<Task>, StoreError> {
        Ok(self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned())
    }

    fn delete_task(&self, id: &Uuid) -> Result<bool, StoreError> {
        self.logs.lock().unwrap_or_else(|e| e.into_inner()).remove(id);
        Ok(self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .is_some())
    }

    fn save_log(&self, task_id: &Uuid, text: &str) -> Result<(), StoreError> {
        self.logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(*task_id, text.to_string());
        Ok(())
    }

    fn load_log(&self, task_id: &Uuid) -> Result<Option<String>, StoreError> {
        Ok(self
            .logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_id)
            .cloned())
    }

    fn list_all(&self) -> Result<Vec<Task>, StoreError> {
        let mut tasks: Vec<Task> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
