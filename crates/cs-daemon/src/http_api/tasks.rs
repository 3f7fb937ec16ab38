use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use cs_agents::scheduler::{CancelOutcome, Submission};
use cs_core::types::{Task, TaskStatus};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::state::ApiState;
use crate::api_error::ApiError;

#[derive(Debug, Default, Deserialize)]
pub(crate) struct TaskListQuery {
    pub status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct LogsQuery {
    pub from: Option<u64>,
}

/// POST /api/tasks -- submit a task.
///
/// **Response:** 202 Accepted with `{taskId, status: "PENDING", concurrencyKey}`.
/// 409 when the concurrency key is busy (body carries `existingTaskId`),
/// 400 for invalid submissions, 429 when the global cap is reached.
pub(crate) async fn create_task(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<Submission>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(submission) = body.map_err(|e| ApiError::Validation(e.body_text()))?;
    let task = state.scheduler.submit(submission)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "taskId": task.id,
            "status": task.status,
            "concurrencyKey": task.concurrency_key,
        })),
    ))
}

/// GET /api/tasks -- all tasks, oldest first. `?status=RUNNING` filters.
pub(crate) async fn list_tasks(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<TaskListQuery>,
) -> Result<Json<Vec<Task>>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(TaskStatus::from_str)
        .transpose()
        .map_err(ApiError::Validation)?;
    Ok(Json(state.scheduler.list_tasks(status)))
}

/// GET /api/tasks/pending -- tasks that have not reached a terminal state.
pub(crate) async fn list_pending(State(state): State<Arc<ApiState>>) -> Json<Vec<Task>> {
    Json(state.scheduler.list_pending())
}

/// GET /api/tasks/{id}
pub(crate) async fn get_task(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Task>, ApiError> {
    state
        .scheduler
        .get_task(&id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("task {id}")))
}

/// GET /api/tasks/{id}/logs -- full log as `text/plain`, or the structured
/// chunks from `?from=N` onwards as JSON.
pub(crate) async fn get_task_logs(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<LogsQuery>,
) -> Result<Response, ApiError> {
    match query.from {
        Some(from) => {
            let chunks = state.scheduler.get_log_chunks(&id, from)?;
            Ok(Json(chunks).into_response())
        }
        None => {
            let text = state.scheduler.get_logs(&id)?;
            Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], text).into_response())
        }
    }
}

/// POST /api/tasks/{id}/cancel
///
/// **Response:** 202 when cancellation was requested, 200 with the task when
/// it had already finished.
pub(crate) async fn cancel_task(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    match state.scheduler.cancel(id)? {
        CancelOutcome::Requested => Ok((
            StatusCode::ACCEPTED,
            Json(json!({"taskId": id, "cancelRequested": true})),
        )
            .into_response()),
        CancelOutcome::AlreadyTerminal(status) => Ok((
            StatusCode::OK,
            Json(json!({"taskId": id, "cancelRequested": false, "status": status})),
        )
            .into_response()),
    }
}

/// DELETE /api/tasks/{id} -- remove a finished task and its log.
pub(crate) async fn delete_task(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(state.scheduler.delete(&id)?))
}
