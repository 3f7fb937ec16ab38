use cs_core::store::{JsonFileStore, TaskStore};
use cs_core::types::{FailureKind, Task, TaskStatus, TaskType};
use serde_json::json;

fn running_task(domain: &str) -> Task {
    let mut task = Task::new(TaskType::Documentation, Some(domain.into()), "scripted", json!({})).unwrap();
    task.transition(TaskStatus::Running).unwrap();
    task
}

#[test]
fn save_and_load_task() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileStore::new(dir.path());
    let task = running_task("d1");

    store.save_task(&task).unwrap();
    let loaded = store.load_task(&task.id).unwrap().expect("task exists");
    assert_eq!(loaded, task);
    assert!(dir.path().join("tasks").join(format!("{}.json", task.id)).exists());
}

#[test]
fn load_missing_task_is_none() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileStore::new(dir.path());
    assert!(store.load_task(&uuid::Uuid::new_v4()).unwrap().is_none());
    assert!(store.list_all().unwrap().is_empty());
}

#[test]
fn logs_persist_as_text() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileStore::new(dir.path());
    let task = running_task("d1");
    store.save_log(&task.id, "building context\ncalling model\n").unwrap();
    assert_eq!(
        store.load_log(&task.id).unwrap().as_deref(),
        Some("building context\ncalling model\n")
    );
}

#[test]
fn list_by_status_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let running = running_task("d1");
    let mut failed = running_task("d2");
    failed.fail(FailureKind::AgentUnavailable, "connection refused").unwrap();
    {
        let store = JsonFileStore::new(dir.path());
        store.save_task(&running).unwrap();
        store.save_task(&failed).unwrap();
    }

    let reopened = JsonFileStore::new(dir.path());
    let live = reopened
        .list_by_status(&[TaskStatus::Pending, TaskStatus::Running])
        .unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].id, running.id);
    assert_eq!(reopened.list_all().unwrap().len(), 2);
}

#[test]
fn corrupt_records_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileStore::new(dir.path());
    store.save_task(&running_task("d1")).unwrap();
    std::fs::write(dir.path().join("tasks").join("garbage.json"), "{not json").unwrap();
    assert_eq!(store.list_all().unwrap().len(), 1);
}

#[test]
fn delete_removes_task_and_log() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileStore::new(dir.path());
    let task = running_task("d1");
    store.save_task(&task).unwrap();
    store.save_log(&task.id, "x").unwrap();

    assert!(store.delete_task(&task.id).unwrap());
    assert!(store.load_task(&task.id).unwrap().is_none());
    assert!(store.load_log(&task.id).unwrap().is_none());
    assert!(!store.delete_task(&task.id).unwrap());
}
