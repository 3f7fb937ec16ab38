use std::sync::Arc;

use axum::{extract::State, Json};
use serde::Serialize;

use super::state::ApiState;
use cs_agents::scheduler::TaskCounts;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StatusResponse {
    version: &'static str,
    uptime_secs: u64,
    running: usize,
    tasks: TaskCounts,
    subscribers: usize,
    agents: Vec<String>,
}

/// GET /api/status
pub(crate) async fn get_status(State(state): State<Arc<ApiState>>) -> Json<StatusResponse> {
    let scheduler = &state.scheduler;
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.start_time.elapsed().as_secs(),
        running: scheduler.running_count(),
        tasks: scheduler.counts(),
        subscribers: scheduler.event_bus().subscriber_count(),
        agents: scheduler.agent_names(),
    })
}
