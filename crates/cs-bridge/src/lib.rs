//! Event plumbing between the scheduler and whatever transport delivers
//! events to clients.
//!
//! - [`protocol`]: wire format of task lifecycle and log events
//! - [`event_bus`]: filtered pub/sub with bounded per-subscriber queues
//! - [`log_stream`]: per-task log buffers with live fan-out and replay

pub mod event_bus;
pub mod log_stream;
pub mod protocol;
