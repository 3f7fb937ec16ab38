// ---------------------------------------------------------------------------
// HTTP API
// ---------------------------------------------------------------------------
//
// Thin transport adapter over the TaskScheduler. Handlers translate requests
// into scheduler calls and scheduler errors into `ApiError` responses; no
// task state lives here.

pub mod state;
mod status;
mod tasks;
mod websocket;

pub use state::ApiState;

use std::sync::Arc;

use axum::{
    http::{request::Parts, HeaderValue},
    middleware,
    routing::{get, post},
    Router,
};
use cs_telemetry::tracing_setup::request_id_middleware;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

/// Build the full API router with all REST and WebSocket routes.
pub fn api_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/status", get(status::get_status))
        .route("/api/tasks", get(tasks::list_tasks).post(tasks::create_task))
        .route("/api/tasks/pending", get(tasks::list_pending))
        .route(
            "/api/tasks/{id}",
            get(tasks::get_task).delete(tasks::delete_task),
        )
        .route("/api/tasks/{id}/cancel", post(tasks::cancel_task))
        .route("/api/tasks/{id}/logs", get(tasks::get_task_logs))
        .route("/api/tasks/{id}/logs/ws", get(websocket::logs_ws_handler))
        .route("/api/events/ws", get(websocket::events_ws_handler))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(localhost_cors())
        .with_state(state)
}

fn localhost_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(
            |origin: &HeaderValue, _request_parts: &Parts| {
                origin.to_str().is_ok_and(|o| {
                    o.starts_with("http://localhost")
                        || o.starts_with("http://127.0.0.1")
                        || o.starts_with("https://localhost")
                        || o.starts_with("https://127.0.0.1")
                })
            },
        ))
        .allow_methods(Any)
        .allow_headers(Any)
}
