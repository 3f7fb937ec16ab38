//! Agent execution and task scheduling.
//!
//! An [`agent::Agent`] performs the actual analysis work. The
//! [`executor::AgentExecutor`] wraps one invocation as a cancellable,
//! streaming unit with a timeout, and the [`scheduler::TaskScheduler`] owns
//! admission control and every task status transition.
//!
//! Concrete agents:
//! - [`command::CommandAgent`]: spawns a CLI code agent (`claude -p …`)
//! - [`llm::AnthropicAgent`]: streams from the Anthropic Messages API
//! - [`scripted::ScriptedAgent`]: deterministic agent for tests

pub mod agent;
pub mod command;
pub mod executor;
pub mod llm;
pub mod prompts;
pub mod registry;
pub mod scheduler;
pub mod scripted;
