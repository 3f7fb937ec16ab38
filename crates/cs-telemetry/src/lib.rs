//! Logging and request tracing for codescope services.
//!
//! - **Logging**: human-readable and JSON output via `tracing-subscriber`
//! - **Tracing**: request-id middleware for axum and per-task spans so every
//!   log line emitted while a task runs can be correlated with it

pub mod logging;
pub mod tracing_setup;
