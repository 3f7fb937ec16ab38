//! Core data model for the codescope task orchestrator.
//!
//! - [`types`]: tasks, statuses, failure kinds and the log buffer
//! - [`validation`]: submission payload shape checks
//! - [`store`]: the persistence gateway for task records and logs
//! - [`config`]: `~/.codescope/config.toml` loading

pub mod config;
pub mod store;
pub mod types;
pub mod validation;
