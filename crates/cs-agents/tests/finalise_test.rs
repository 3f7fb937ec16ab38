use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use cs_agents::executor::AgentExecutor;
use cs_agents::registry::AgentRegistry;
use cs_agents::scheduler::{SchedulerConfig, SchedulerError, Submission, TaskScheduler};
use cs_agents::scripted::ScriptedAgent;
use cs_bridge::event_bus::EventBus;
use cs_bridge::log_stream::LogMultiplexer;
use cs_bridge::protocol::{EventFilter, TaskEvent};
use cs_core::store::{MemoryStore, StoreError, TaskStore};
use cs_core::types::{Task, TaskStatus, TaskType};
use uuid::Uuid;

/// Parks the first terminal `save_task` until the test releases it.
struct StallingStore {
    inner: MemoryStore,
    armed: AtomicBool,
    entered: Barrier,
    release: Barrier,
}

impl StallingStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            armed: AtomicBool::new(true),
            entered: Barrier::new(2),
            release: Barrier::new(2),
        }
    }
}

impl TaskStore for StallingStore {
    fn save_task(&self, task: &Task) -> Result<(), StoreError> {
        if task.is_terminal() && self.armed.swap(false, Ordering::SeqCst) {
            self.entered.wait();
            self.release.wait();
        }
        self.inner.save_task(task)
    }

    fn load_task(&self, id: &Uuid) -> Result<Option<Task>, StoreError> {
        self.inner.load_task(id)
    }

    fn delete_task(&self, id: &Uuid) -> Result<bool, StoreError> {
        self.inner.delete_task(id)
    }

    fn save_log(&self, task_id: &Uuid, text: &str) -> Result<(), StoreError> {
        self.inner.save_log(task_id, text)
    }

    fn load_log(&self, task_id: &Uuid) -> Result<Option<String>, StoreError> {
        self.inner.load_log(task_id)
    }

    fn list_all(&self) -> Result<Vec<Task>, StoreError> {
        self.inner.list_all()
    }
}

fn scheduler(agent: &ScriptedAgent, store: Arc<dyn TaskStore>, logs: LogMultiplexer) -> TaskScheduler {
    let registry = AgentRegistry::new().with_agent(Arc::new(agent.clone()));
    let executor = AgentExecutor::new(Arc::new(registry), Duration::from_secs(10));
    TaskScheduler::new(
        executor,
        logs,
        store,
        SchedulerConfig {
            max_concurrent_tasks: None,
            default_agent: "scripted".into(),
        },
    )
}

async fn wait_on(barrier: &Arc<StallingStore>, release: bool) {
    let store = Arc::clone(barrier);
    tokio::task::spawn_blocking(move || {
        if release {
            store.release.wait();
        } else {
            store.entered.wait();
        }
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delete_waits_for_terminal_flush() {
    let agent = ScriptedAgent::new("scripted").stdout("x");
    let store = Arc::new(StallingStore::new());
    let sched = scheduler(&agent, store.clone(), LogMultiplexer::new(EventBus::new()));
    let sub = sched.subscribe(EventFilter::All);

    let task = sched
        .submit(Submission::new(TaskType::Documentation, Some("d1")))
        .unwrap();
    wait_on(&store, false).await;

    // Terminal in memory, but the record, log and event are not flushed yet.
    assert_eq!(sched.get_task(&task.id).unwrap().status, TaskStatus::Completed);
    assert!(matches!(
        sched.delete(&task.id),
        Err(SchedulerError::Finalising(id)) if id == task.id
    ));

    wait_on(&store, true).await;

    let mut names = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("timed out waiting for terminal event")
            .expect("subscription closed");
        names.push(event.name());
        if event.is_terminal() {
            assert!(matches!(event, TaskEvent::Completed(_)));
            break;
        }
    }
    assert_eq!(names, ["task:started", "task:log", "task:completed"]);

    let deleted = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match sched.delete(&task.id) {
                Err(SchedulerError::Finalising(_)) => tokio::time::sleep(Duration::from_millis(10)).await,
                other => return other,
            }
        }
    })
    .await
    .unwrap()
    .unwrap();
    assert_eq!(deleted.status, TaskStatus::Completed);
    assert!(store.load_task(&task.id).unwrap().is_none());
    assert!(store.load_log(&task.id).unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_waits_for_terminal_flush() {
    let agent = ScriptedAgent::new("scripted").hang();
    let store = Arc::new(StallingStore::new());
    let sched = scheduler(&agent, store.clone(), LogMultiplexer::new(EventBus::new()));
    let task = sched
        .submit(Submission::new(TaskType::Testing, Some("d1")))
        .unwrap();

    let stopping = {
        let sched = sched.clone();
        tokio::spawn(async move { sched.shutdown(Duration::from_secs(5)).await })
    };
    wait_on(&store, false).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!stopping.is_finished());

    wait_on(&store, true).await;
    assert_eq!(stopping.await.unwrap(), 0);
    assert_eq!(
        store.load_task(&task.id).unwrap().unwrap().status,
        TaskStatus::Cancelled
    );
}

#[tokio::test]
async fn evicted_logs_are_served_from_the_store() {
    let agent = ScriptedAgent::new("scripted").stdout("one\n").stdout("two\n");
    let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::new());
    let sched = scheduler(
        &agent,
        Arc::clone(&store),
        LogMultiplexer::with_retention(EventBus::new(), 1),
    );
    let sub = sched.subscribe(EventFilter::All);

    let mut ids = Vec::new();
    for domain in ["d1", "d2"] {
        let task = sched
            .submit(Submission::new(TaskType::Diagrams, Some(domain)))
            .unwrap();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), sub.recv())
                .await
                .unwrap()
                .unwrap();
            if event.task_id() == task.id && event.is_terminal() {
                break;
            }
        }
        ids.push(task.id);
    }

    let (old, recent) = (ids[0], ids[1]);
    assert_eq!(sched.logs().buffer_count(), 1);
    assert!(sched.get_log_chunks(&old, 0).unwrap().is_empty());
    assert_eq!(sched.get_logs(&old).unwrap(), "one\ntwo\n");
    assert!(sched.subscribe_logs(old, 0).unwrap().is_none());

    assert_eq!(sched.get_log_chunks(&recent, 1).unwrap().len(), 1);
    assert!(sched.subscribe_logs(recent, 0).unwrap().unwrap().closed);
}
