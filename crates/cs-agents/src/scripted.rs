use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cs_core::types::LogStream;
use serde_json::{json, Value};
use tokio::sync::Notify;

use crate::agent::{Agent, AgentError, AgentInvocation, ChunkSink};

#[derive(Clone)]
enum Step {
    Chunk(LogStream, String),
    Sleep(Duration),
    Gate(Arc<Notify>),
}

#[derive(Clone)]
enum Ending {
    Succeed(Value),
    Fail(AgentError),
    Panic,
    Hang,
}

/// A deterministic agent for tests.
///
/// Plays back a fixed script of chunks, sleeps and gates, then ends with a
/// result, an error, a panic, or never ends at all. Counters record how many
/// runs started, finished on their own and were interrupted (the run future
/// dropped by a cancel or timeout).
#[derive(Clone)]
pub struct ScriptedAgent {
    name: String,
    steps: Vec<Step>,
    ending: Ending,
    preflight_error: Option<AgentError>,
    stats: Arc<ScriptStats>,
    invocations: Arc<Mutex<Vec<AgentInvocation>>>,
}

#[derive(Default)]
struct ScriptStats {
    started: AtomicUsize,
    finished: AtomicUsize,
    interrupted: AtomicUsize,
}

impl ScriptedAgent {
    /// An agent that succeeds immediately with `{"summary":"ok"}`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            ending: Ending::Succeed(json!({"summary": "ok"})),
            preflight_error: None,
            stats: Arc::new(ScriptStats::default()),
            invocations: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn stdout(mut self, data: impl Into<String>) -> Self {
        self.steps.push(Step::Chunk(LogStream::Stdout, data.into()));
        self
    }

    pub fn stderr(mut self, data: impl Into<String>) -> Self {
        self.steps.push(Step::Chunk(LogStream::Stderr, data.into()));
        self
    }

    pub fn sleep(mut self, duration: Duration) -> Self {
        self.steps.push(Step::Sleep(duration));
        self
    }

    /// Block until `gate` is notified.
    pub fn gate(mut self, gate: Arc<Notify>) -> Self {
        self.steps.push(Step::Gate(gate));
        self
    }

    pub fn succeed(mut self, result: Value) -> Self {
        self.ending = Ending::Succeed(result);
        self
    }

    pub fn fail(mut self, error: AgentError) -> Self {
        self.ending = Ending::Fail(error);
        self
    }

    pub fn panic(mut self) -> Self {
        self.ending = Ending::Panic;
        self
    }

    /// Never finish on its own; only a cancel or timeout ends the run.
    pub fn hang(mut self) -> Self {
        self.ending = Ending::Hang;
        self
    }

    pub fn fail_preflight(mut self, error: AgentError) -> Self {
        self.preflight_error = Some(error);
        self
    }

    pub fn started(&self) -> usize {
        self.stats.started.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.stats.finished.load(Ordering::SeqCst)
    }

    pub fn interrupted(&self) -> usize {
        self.stats.interrupted.load(Ordering::SeqCst)
    }

    /// Invocations received so far, in order.
    pub fn invocations(&self) -> Vec<AgentInvocation> {
        self.invocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Counts the run as interrupted unless disarmed.
struct InterruptGuard {
    stats: Arc<ScriptStats>,
    armed: bool,
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if self.armed {
            self.stats.interrupted.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn preflight(&self, _invocation: &AgentInvocation) -> Result<(), AgentError> {
        match &self.preflight_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    async fn run(&self, invocation: AgentInvocation, sink: ChunkSink) -> Result<Value, AgentError> {
        self.stats.started.fetch_add(1, Ordering::SeqCst);
        self.invocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(invocation);
        let mut guard = InterruptGuard {
            stats: Arc::clone(&self.stats),
            armed: true,
        };

        for step in &self.steps {
            match step {
                Step::Chunk(stream, data) => {
                    sink.emit(*stream, data.clone());
                }
                Step::Sleep(d) => tokio::time::sleep(*d).await,
                Step::Gate(gate) => gate.notified().await,
            }
        }

        let ending = self.ending.clone();
        if matches!(ending, Ending::Hang) {
            std::future::pending::<()>().await;
        }

        guard.armed = false;
        self.stats.finished.fetch_add(1, Ordering::SeqCst);
        match ending {
            Ending::Succeed(v) => Ok(v),
            Ending::Fail(e) => Err(e),
            Ending::Panic => panic!("scripted agent panic"),
            Ending::Hang => Err(AgentError::Internal("unreachable hang".into())),
        }
    }
}
