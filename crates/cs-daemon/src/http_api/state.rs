use std::time::{Duration, Instant};

use cs_agents::scheduler::TaskScheduler;

/// Shared application state for all HTTP/WS handlers.
pub struct ApiState {
    pub scheduler: TaskScheduler,
    /// Interval between `{"type":"ping"}` frames on event sockets.
    pub heartbeat: Duration,
    pub start_time: Instant,
}

impl ApiState {
    pub fn new(scheduler: TaskScheduler, heartbeat: Duration) -> Self {
        Self {
            scheduler,
            heartbeat,
            start_time: Instant::now(),
        }
    }
}
