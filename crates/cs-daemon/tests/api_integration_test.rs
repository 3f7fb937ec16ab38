use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use cs_agents::registry::AgentRegistry;
use cs_agents::scripted::ScriptedAgent;
use cs_core::config::Config;
use cs_core::store::{MemoryStore, TaskStore};
use cs_daemon::daemon::Daemon;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio_tungstenite::{connect_async, tungstenite::Message};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct TestDaemon {
    daemon: Arc<Daemon>,
    addr: SocketAddr,
    client: reqwest::Client,
    store: Arc<dyn TaskStore>,
}

impl TestDaemon {
    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{path}", self.addr)
    }

    async fn submit(&self, body: Value) -> reqwest::Response {
        self.client
            .post(self.url("/api/tasks"))
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    async fn submit_ok(&self, body: Value) -> String {
        let resp = self.submit(body).await;
        assert_eq!(resp.status(), 202);
        let json: Value = resp.json().await.unwrap();
        json["taskId"].as_str().unwrap().to_string()
    }

    async fn task(&self, id: &str) -> Value {
        self.client
            .get(self.url(&format!("/api/tasks/{id}")))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    async fn wait_status(&self, id: &str, status: &str) -> Value {
        for _ in 0..500 {
            let task = self.task(id).await;
            if task["status"] == status {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {id} never reached {status}");
    }
}

async fn start(agents: &[&ScriptedAgent], tweak: impl FnOnce(&mut Config)) -> TestDaemon {
    let mut config = Config::default();
    config.daemon.persist = false;
    config.orchestrator.default_agent = cs_agents::agent::Agent::name(agents[0]).to_string();
    tweak(&mut config);

    let mut registry = AgentRegistry::new();
    for agent in agents {
        registry = registry.with_agent(Arc::new((*agent).clone()));
    }
    let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::new());
    let daemon = Arc::new(Daemon::with_parts(config, registry, Arc::clone(&store)));
    let addr = daemon.start_embedded().await.unwrap();
    TestDaemon {
        daemon,
        addr,
        client: reqwest::Client::new(),
        store,
    }
}

type Ws = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Next JSON text frame, or `None` once the server closes.
async fn next_frame(ws: &mut Ws) -> Option<Value> {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame");
        match msg {
            Some(Ok(Message::Text(text))) => {
                return Some(serde_json::from_str(text.as_str()).unwrap())
            }
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(_)) => continue,
        }
    }
}

/// Next frame that is not a heartbeat.
async fn next_event(ws: &mut Ws) -> Option<Value> {
    loop {
        let frame = next_frame(ws).await?;
        if frame["type"] != "ping" {
            return Some(frame);
        }
    }
}

fn docs(domain: &str) -> Value {
    json!({"type": "documentation", "domainId": domain})
}

// ---------------------------------------------------------------------------
// REST
// ---------------------------------------------------------------------------

#[tokio::test]
async fn status_reports_version_agents_and_request_id() {
    let t = start(&[&ScriptedAgent::new("scripted")], |_| {}).await;
    let resp = t.client.get(t.url("/api/status")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.headers().get("x-request-id").is_some());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["agents"], json!(["scripted"]));
    assert_eq!(body["running"], 0);
}

#[tokio::test]
async fn submit_runs_to_completion() {
    let agent = ScriptedAgent::new("scripted")
        .stdout("building context\n")
        .succeed(json!({"summary": "ok"}));
    let t = start(&[&agent], |_| {}).await;

    let resp = t.submit(docs("d1")).await;
    assert_eq!(resp.status(), 202);
    let accepted: Value = resp.json().await.unwrap();
    assert_eq!(accepted["status"], "PENDING");
    assert_eq!(accepted["concurrencyKey"], "d1:documentation");
    let id = accepted["taskId"].as_str().unwrap();

    let task = t.wait_status(id, "COMPLETED").await;
    assert_eq!(task["result"], json!({"summary": "ok"}));
    assert_eq!(task["type"], "documentation");
    assert_eq!(task["domainId"], "d1");
    assert!(task["finishedAt"].is_string());

    let text = t
        .client
        .get(t.url(&format!("/api/tasks/{id}/logs")))
        .send()
        .await
        .unwrap();
    assert!(text.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
    assert_eq!(text.text().await.unwrap(), "building context\n");
}

#[tokio::test]
async fn conflicting_submission_is_409_with_existing_id() {
    let gate = Arc::new(Notify::new());
    let agent = ScriptedAgent::new("scripted").gate(Arc::clone(&gate));
    let t = start(&[&agent], |_| {}).await;

    let first = t.submit_ok(docs("d1")).await;
    let resp = t.submit(docs("d1")).await;
    assert_eq!(resp.status(), 409);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "AlreadyInProgress");
    assert_eq!(body["existingTaskId"], first.as_str());

    gate.notify_one();
    t.wait_status(&first, "COMPLETED").await;
    assert_eq!(t.submit(docs("d1")).await.status(), 202);
}

#[tokio::test]
async fn invalid_submissions_are_400() {
    let t = start(&[&ScriptedAgent::new("scripted")], |_| {}).await;

    for body in [
        json!({"type": "documentation"}),
        json!({"type": "codebase-analysis", "domainId": "d1"}),
        json!({"type": "chat", "domainId": "d1", "inputPayload": {}}),
        json!({"type": "not-a-type", "domainId": "d1"}),
        json!({"type": "testing", "domainId": "d1", "agent": "ghost"}),
    ] {
        let resp = t.submit(body.clone()).await;
        assert_eq!(resp.status(), 400, "{body}");
        let json: Value = resp.json().await.unwrap();
        assert_eq!(json["error"], "ValidationError", "{body}");
    }

    let malformed = t
        .client
        .post(t.url("/api/tasks"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(malformed.status(), 400);

    let all: Vec<Value> = t
        .client
        .get(t.url("/api/tasks"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(all.is_empty());
}

#[tokio::test]
async fn capacity_is_429() {
    let gate = Arc::new(Notify::new());
    let agent = ScriptedAgent::new("scripted").gate(Arc::clone(&gate));
    let t = start(&[&agent], |c| c.orchestrator.max_concurrent_tasks = Some(1)).await;

    let first = t.submit_ok(docs("d1")).await;
    let resp = t.submit(docs("d2")).await;
    assert_eq!(resp.status(), 429);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "CapacityExceeded");
    assert_eq!(body["limit"], 1);

    gate.notify_one();
    t.wait_status(&first, "COMPLETED").await;
}

#[tokio::test]
async fn unknown_task_is_404() {
    let t = start(&[&ScriptedAgent::new("scripted")], |_| {}).await;
    let id = uuid::Uuid::new_v4();
    for path in [format!("/api/tasks/{id}"), format!("/api/tasks/{id}/logs")] {
        let resp = t.client.get(t.url(&path)).send().await.unwrap();
        assert_eq!(resp.status(), 404, "{path}");
    }
    let cancel = t
        .client
        .post(t.url(&format!("/api/tasks/{id}/cancel")))
        .send()
        .await
        .unwrap();
    assert_eq!(cancel.status(), 404);
}

#[tokio::test]
async fn log_chunks_from_sequence() {
    let agent = ScriptedAgent::new("scripted")
        .stdout("a\n")
        .stderr("b\n")
        .stdout("c\n");
    let t = start(&[&agent], |_| {}).await;
    let id = t.submit_ok(docs("d1")).await;
    t.wait_status(&id, "COMPLETED").await;

    let chunks: Vec<Value> = t
        .client
        .get(t.url(&format!("/api/tasks/{id}/logs?from=1")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0]["sequence"], 1);
    assert_eq!(chunks[0]["stream"], "stderr");
    assert_eq!(chunks[1]["data"], "c\n");
}

#[tokio::test]
async fn cancel_running_task() {
    let agent = ScriptedAgent::new("scripted").stdout("working\n").hang();
    let t = start(&[&agent], |_| {}).await;
    let id = t.submit_ok(docs("d1")).await;
    t.wait_status(&id, "RUNNING").await;

    let resp = t
        .client
        .post(t.url(&format!("/api/tasks/{id}/cancel")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);

    let task = t.wait_status(&id, "CANCELLED").await;
    assert!(task["error"].is_null());

    let again = t
        .client
        .post(t.url(&format!("/api/tasks/{id}/cancel")))
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), 200);
    let body: Value = again.json().await.unwrap();
    assert_eq!(body["status"], "CANCELLED");

    // The key is free again.
    assert_eq!(t.submit(docs("d1")).await.status(), 202);
}

#[tokio::test]
async fn delete_requires_terminal_state() {
    let gate = Arc::new(Notify::new());
    let agent = ScriptedAgent::new("scripted").gate(Arc::clone(&gate));
    let t = start(&[&agent], |_| {}).await;
    let id = t.submit_ok(docs("d1")).await;

    let url = t.url(&format!("/api/tasks/{id}"));
    assert_eq!(t.client.delete(&url).send().await.unwrap().status(), 409);

    gate.notify_one();
    t.wait_status(&id, "COMPLETED").await;
    assert_eq!(t.client.delete(&url).send().await.unwrap().status(), 200);
    assert_eq!(t.client.get(&url).send().await.unwrap().status(), 404);
    let uuid: uuid::Uuid = id.parse().unwrap();
    assert!(t.store.load_task(&uuid).unwrap().is_none());
}

#[tokio::test]
async fn list_filters_and_pending() {
    let gate = Arc::new(Notify::new());
    let slow = ScriptedAgent::new("slow").gate(Arc::clone(&gate));
    let fast = ScriptedAgent::new("fast");
    let t = start(&[&slow, &fast], |_| {}).await;

    let running = t.submit_ok(docs("d1")).await;
    let done = t
        .submit_ok(json!({"type": "testing", "domainId": "d1", "agent": "fast"}))
        .await;
    t.wait_status(&done, "COMPLETED").await;

    let pending: Vec<Value> = t
        .client
        .get(t.url("/api/tasks/pending"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0]["id"], running.as_str());

    let completed: Vec<Value> = t
        .client
        .get(t.url("/api/tasks?status=completed"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0]["id"], done.as_str());

    let bad = t.client.get(t.url("/api/tasks?status=bogus")).send().await.unwrap();
    assert_eq!(bad.status(), 400);

    gate.notify_one();
    t.wait_status(&running, "COMPLETED").await;
}

// ---------------------------------------------------------------------------
// WebSockets
// ---------------------------------------------------------------------------

#[tokio::test]
async fn events_socket_streams_lifecycle_for_domain() {
    let agent = ScriptedAgent::new("scripted")
        .stdout("[PROGRESS] scanning\n")
        .succeed(json!({"summary": "ok"}));
    let t = start(&[&agent], |_| {}).await;
    let (mut ws, _) = connect_async(t.ws_url("/api/events/ws?domainId=d1")).await.unwrap();

    t.submit_ok(docs("other")).await;
    let id = t.submit_ok(docs("d1")).await;

    let mut names = Vec::new();
    loop {
        let event = next_event(&mut ws).await.expect("stream ended early");
        assert_eq!(event["taskId"], id.as_str(), "filtered to d1 only");
        let name = event["type"].as_str().unwrap().to_string();
        names.push(name.clone());
        if name == "task:completed" {
            assert_eq!(event["result"], json!({"summary": "ok"}));
            break;
        }
    }
    assert_eq!(
        names,
        vec!["task:started", "task:log", "task:progress", "task:completed"]
    );
}

#[tokio::test]
async fn events_socket_sends_heartbeat() {
    let t = start(&[&ScriptedAgent::new("scripted")], |c| c.orchestrator.heartbeat_secs = 1).await;
    let (mut ws, _) = connect_async(t.ws_url("/api/events/ws")).await.unwrap();
    let frame = next_frame(&mut ws).await.unwrap();
    assert_eq!(frame, json!({"type": "ping"}));
}

#[tokio::test]
async fn log_socket_replays_then_streams_until_terminal() {
    let gate = Arc::new(Notify::new());
    let agent = ScriptedAgent::new("scripted")
        .stdout("one\n")
        .stdout("two\n")
        .gate(Arc::clone(&gate))
        .stdout("three\n");
    let t = start(&[&agent], |_| {}).await;
    let id = t.submit_ok(docs("d1")).await;

    for _ in 0..500 {
        let chunks: Vec<Value> = t
            .client
            .get(t.url(&format!("/api/tasks/{id}/logs?from=0")))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if chunks.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let (mut ws, _) = connect_async(t.ws_url(&format!("/api/tasks/{id}/logs/ws?from=0")))
        .await
        .unwrap();
    let first = next_event(&mut ws).await.unwrap();
    let second = next_event(&mut ws).await.unwrap();
    assert_eq!((first["sequence"].clone(), first["data"].clone()), (json!(0), json!("one\n")));
    assert_eq!((second["sequence"].clone(), second["data"].clone()), (json!(1), json!("two\n")));

    gate.notify_one();
    let third = next_event(&mut ws).await.unwrap();
    assert_eq!(third["type"], "task:log");
    assert_eq!(third["sequence"], 2);
    let terminal = next_event(&mut ws).await.unwrap();
    assert_eq!(terminal["type"], "task:completed");
    assert!(next_event(&mut ws).await.is_none(), "socket closes after terminal");
}

#[tokio::test]
async fn log_socket_for_finished_task_replays_and_closes() {
    let agent = ScriptedAgent::new("scripted").stdout("a\n").stdout("b\n");
    let t = start(&[&agent], |_| {}).await;
    let id = t.submit_ok(docs("d1")).await;
    t.wait_status(&id, "COMPLETED").await;

    let (mut ws, _) = connect_async(t.ws_url(&format!("/api/tasks/{id}/logs/ws?from=1")))
        .await
        .unwrap();
    let replayed = next_event(&mut ws).await.unwrap();
    assert_eq!(replayed["data"], "b\n");
    assert_eq!(next_event(&mut ws).await.unwrap()["type"], "task:completed");
    assert!(next_event(&mut ws).await.is_none());
}

#[tokio::test]
async fn log_socket_for_unknown_task_is_rejected() {
    let t = start(&[&ScriptedAgent::new("scripted")], |_| {}).await;
    let url = t.ws_url(&format!("/api/tasks/{}/logs/ws", uuid::Uuid::new_v4()));
    assert!(connect_async(url).await.is_err());
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shutdown_cancels_running_tasks() {
    let agent = ScriptedAgent::new("scripted").hang();
    let t = start(&[&agent], |_| {}).await;
    let id = t.submit_ok(docs("d1")).await;
    t.wait_status(&id, "RUNNING").await;

    t.daemon.shutdown();
    let uuid: uuid::Uuid = id.parse().unwrap();
    let mut persisted = None;
    for _ in 0..500 {
        persisted = t.store.load_task(&uuid).unwrap();
        if persisted.as_ref().is_some_and(|task| task.is_terminal()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        persisted.unwrap().status,
        cs_core::types::TaskStatus::Cancelled
    );
    assert_eq!(t.submit(docs("d2")).await.status(), 503);
}
