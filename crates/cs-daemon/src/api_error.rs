//! HTTP API error types.
//!
//! Every error body is a JSON object with an `error` code; conflicts carry the
//! occupying task id and capacity rejections carry the limit.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use cs_agents::scheduler::SchedulerError;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("a task is already in progress for {key}")]
    AlreadyInProgress { key: String, existing_task_id: Uuid },

    #[error("capacity exceeded ({limit} running)")]
    CapacityExceeded { limit: usize },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::Validation(e) => ApiError::Validation(e.to_string()),
            SchedulerError::AlreadyInProgress {
                key,
                existing_task_id,
            } => ApiError::AlreadyInProgress {
                key,
                existing_task_id,
            },
            SchedulerError::CapacityExceeded { limit } => ApiError::CapacityExceeded { limit },
            SchedulerError::NotFound(id) => ApiError::NotFound(format!("task {id}")),
            e @ (SchedulerError::NotTerminal { .. } | SchedulerError::Finalising(_)) => {
                ApiError::Conflict(e.to_string())
            }
            e @ SchedulerError::ShuttingDown => ApiError::Unavailable(e.to_string()),
            SchedulerError::Internal(msg) => ApiError::InternalError(msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        let (status, body) = match self {
            ApiError::NotFound(_) => (
                StatusCode::NOT_FOUND,
                json!({"error": "NotFound", "message": message}),
            ),
            ApiError::Validation(_) => (
                StatusCode::BAD_REQUEST,
                json!({"error": "ValidationError", "message": message}),
            ),
            ApiError::AlreadyInProgress {
                key,
                existing_task_id,
            } => (
                StatusCode::CONFLICT,
                json!({
                    "error": "AlreadyInProgress",
                    "message": message,
                    "concurrencyKey": key,
                    "existingTaskId": existing_task_id,
                }),
            ),
            ApiError::CapacityExceeded { limit } => (
                StatusCode::TOO_MANY_REQUESTS,
                json!({"error": "CapacityExceeded", "message": message, "limit": limit}),
            ),
            ApiError::Conflict(_) => (
                StatusCode::CONFLICT,
                json!({"error": "Conflict", "message": message}),
            ),
            ApiError::Unavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({"error": "Unavailable", "message": message}),
            ),
            ApiError::InternalError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": "InternalError", "message": message}),
            ),
        };
        (status, Json(body)).into_response()
    }
}
