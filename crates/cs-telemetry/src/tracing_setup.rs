use axum::{body::Body, extract::Request, http::HeaderValue, middleware::Next, response::Response};
use tracing::Instrument;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Generate a trace ID (32 hex characters).
pub fn generate_trace_id() -> String {
    Uuid::new_v4().as_simple().to_string()
}

/// Axum middleware that injects `X-Request-Id` headers and runs the request
/// inside an `http_request` span.
///
/// An incoming `X-Request-Id` is reused; otherwise a new trace ID is
/// generated. The response always carries the header.
pub async fn request_id_middleware(mut request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(generate_trace_id);

    let header = HeaderValue::from_str(&request_id)
        .unwrap_or_else(|_| HeaderValue::from_static("unknown"));
    request.headers_mut().insert(REQUEST_ID_HEADER, header.clone());

    let span = tracing::info_span!(
        "http_request",
        trace_id = %request_id,
        method = %request.method(),
        path = %request.uri().path(),
    );

    let mut response = async move {
        tracing::debug!("processing request");
        let response = next.run(request).await;
        tracing::debug!(status = response.status().as_u16(), "request finished");
        response
    }
    .instrument(span)
    .await;

    response.headers_mut().insert(REQUEST_ID_HEADER, header);
    response
}

/// Span covering one task's execution. Agent and scheduler logs emitted
/// inside it carry the task id.
pub fn task_span(task_id: &Uuid, task_type: &str, agent: &str) -> tracing::Span {
    tracing::info_span!(
        "task",
        task_id = %task_id,
        task_type = %task_type,
        agent = %agent,
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
