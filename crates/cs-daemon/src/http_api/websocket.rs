use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use cs_bridge::event_bus::Subscription;
use cs_bridge::log_stream::Replay;
use cs_bridge::protocol::{ControlFrame, EventFilter, TaskEvent};
use cs_core::types::{LogChunk, LogStream, Task};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::state::ApiState;
use crate::api_error::ApiError;

type WsSender = SplitSink<WebSocket, Message>;
type WsReceiver = SplitStream<WebSocket>;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct EventsQuery {
    pub task_id: Option<Uuid>,
    pub domain_id: Option<String>,
}

impl EventsQuery {
    fn filter(self) -> EventFilter {
        match (self.task_id, self.domain_id) {
            (Some(id), _) => EventFilter::Task(id),
            (None, Some(domain)) if !domain.is_empty() => EventFilter::Domain(domain),
            _ => EventFilter::All,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct LogsWsQuery {
    pub from: Option<u64>,
}

/// WebSocket GET /api/events/ws -- live task events with heartbeat.
///
/// The subscription is registered before the upgrade completes, so every
/// event published after the handshake reaches the client.
pub(crate) async fn events_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ApiState>>,
    Query(query): Query<EventsQuery>,
) -> Response {
    let subscription = state.scheduler.subscribe(query.filter());
    let heartbeat = state.heartbeat;
    ws.on_upgrade(move |socket| handle_events_ws(socket, subscription, heartbeat))
}

async fn handle_events_ws(socket: WebSocket, subscription: Subscription, heartbeat: Duration) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    forward(&mut ws_tx, &mut ws_rx, &subscription, heartbeat, false).await;
}

/// WebSocket GET /api/tasks/{id}/logs/ws?from=N -- replay buffered chunks
/// from sequence `N`, then stream that task's live events until its
/// terminal event, then close.
pub(crate) async fn logs_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<LogsWsQuery>,
) -> Response {
    let Some(task) = state.scheduler.get_task(&id) else {
        return ApiError::NotFound(format!("task {id}")).into_response();
    };
    let from = query.from.unwrap_or(0);
    let replay = match state.scheduler.subscribe_logs(id, from) {
        Ok(replay) => replay,
        Err(e) => return ApiError::from(e).into_response(),
    };
    ws.on_upgrade(move |socket| handle_logs_ws(socket, state, task, from, replay))
}

async fn handle_logs_ws(
    socket: WebSocket,
    state: Arc<ApiState>,
    task: Task,
    from: u64,
    replay: Option<Replay>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let Some(replay) = replay else {
        // Only the persisted copy is left.
        if from == 0 {
            let text = state.scheduler.get_logs(&task.id).unwrap_or_default();
            if !text.is_empty() {
                let chunk = LogChunk {
                    stream: LogStream::Stdout,
                    data: text,
                    sequence: 0,
                    timestamp: task.finished_at.unwrap_or_else(Utc::now),
                };
                let event = TaskEvent::log(task.id, task.task_type, task.domain_id.clone(), &chunk);
                if !send_json(&mut ws_tx, &event).await {
                    return;
                }
            }
        }
        send_terminal(&mut ws_tx, &state, &task.id).await;
        let _ = ws_tx.send(Message::Close(None)).await;
        return;
    };

    debug!(task_id = %task.id, replayed = replay.chunks.len(), from, "log socket replay");
    for chunk in &replay.chunks {
        let event = TaskEvent::log(task.id, task.task_type, task.domain_id.clone(), chunk);
        if !send_json(&mut ws_tx, &event).await {
            return;
        }
    }

    if replay.closed {
        send_terminal(&mut ws_tx, &state, &task.id).await;
        let _ = ws_tx.send(Message::Close(None)).await;
        return;
    }

    forward(&mut ws_tx, &mut ws_rx, &replay.subscription, state.heartbeat, true).await;
}

/// Pump `subscription` into the socket until the client leaves, the
/// subscription ends, or (with `until_terminal`) a terminal event is sent.
async fn forward(
    ws_tx: &mut WsSender,
    ws_rx: &mut WsReceiver,
    subscription: &Subscription,
    heartbeat: Duration,
    until_terminal: bool,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);

    loop {
        tokio::select! {
            event = subscription.recv() => match event {
                Some(event) => {
                    let terminal = event.is_terminal();
                    if !send_json(ws_tx, &event).await {
                        return;
                    }
                    if until_terminal && terminal {
                        break;
                    }
                }
                None => {
                    if subscription.is_truncated() {
                        warn!(subscription = subscription.id(), "socket fell behind, closing stream");
                        let _ = send_json(ws_tx, &ControlFrame::StreamTruncated).await;
                    }
                    break;
                }
            },

            _ = ticker.tick() => {
                if !send_json(ws_tx, &ControlFrame::Ping).await {
                    return;
                }
            }

            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                _ => {}
            },
        }
    }
    let _ = ws_tx.send(Message::Close(None)).await;
}

async fn send_terminal(ws_tx: &mut WsSender, state: &ApiState, task_id: &Uuid) {
    if let Some(event) = state
        .scheduler
        .get_task(task_id)
        .as_ref()
        .and_then(TaskEvent::terminal)
    {
        let _ = send_json(ws_tx, &event).await;
    }
}

async fn send_json<T: Serialize>(ws_tx: &mut WsSender, value: &T) -> bool {
    match serde_json::to_string(value) {
        Ok(json) => ws_tx.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "failed to serialise frame");
            true
        }
    }
}
