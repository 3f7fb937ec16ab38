use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use cs_core::config::{expand_home, CommandAgentConfig};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use crate::agent::{Agent, AgentError, AgentInvocation, ChunkSink};

/// Number of trailing stderr lines quoted in a failure message.
const STDERR_TAIL_LINES: usize = 5;

/// Runs a CLI code agent as a child process, one per task.
///
/// The prompt is passed as the final argument. Stdout and stderr are streamed
/// line by line. The child is killed if the run is cancelled or times out.
pub struct CommandAgent {
    name: String,
    binary: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    workdir: Option<PathBuf>,
}

impl CommandAgent {
    pub fn new(name: impl Into<String>, binary: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            binary: binary.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            workdir: None,
        }
    }

    pub fn from_config(name: &str, cfg: &CommandAgentConfig) -> Self {
        Self {
            name: name.to_string(),
            binary: cfg.binary.clone(),
            args: cfg.args.clone(),
            env: cfg.env.clone(),
            workdir: cfg.workdir.as_deref().map(expand_home),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    fn command(&self, prompt: &str) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.args)
            .arg(prompt)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait]
impl Agent for CommandAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn preflight(&self, _invocation: &AgentInvocation) -> Result<(), AgentError> {
        if let Some(dir) = &self.workdir {
            if !dir.is_dir() {
                return Err(AgentError::Unavailable(format!(
                    "working directory {} does not exist",
                    dir.display()
                )));
            }
        }
        Ok(())
    }

    async fn run(&self, invocation: AgentInvocation, sink: ChunkSink) -> Result<Value, AgentError> {
        let mut child = self.command(&invocation.prompt).spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AgentError::Unavailable(format!("`{}` not found on PATH", self.binary))
            } else {
                AgentError::Unavailable(format!("failed to spawn `{}`: {e}", self.binary))
            }
        })?;
        info!(binary = %self.binary, pid = child.id(), "agent process spawned");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Internal("child stdout was not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AgentError::Internal("child stderr was not captured".into()))?;
        let mut out_lines = BufReader::new(stdout).lines();
        let mut err_lines = BufReader::new(stderr).lines();

        let mut output = String::new();
        let mut last_line: Option<String> = None;
        let mut stderr_tail: Vec<String> = Vec::new();
        let (mut out_done, mut err_done) = (false, false);

        while !(out_done && err_done) {
            tokio::select! {
                line = out_lines.next_line(), if !out_done => match line {
                    Ok(Some(line)) => {
                        sink.stdout(format!("{line}\n"));
                        output.push_str(&line);
                        output.push('\n');
                        if !line.trim().is_empty() {
                            last_line = Some(line);
                        }
                    }
                    Ok(None) => out_done = true,
                    Err(e) => return Err(AgentError::Protocol(format!("unreadable stdout: {e}"))),
                },
                line = err_lines.next_line(), if !err_done => match line {
                    Ok(Some(line)) => {
                        sink.stderr(format!("{line}\n"));
                        if stderr_tail.len() == STDERR_TAIL_LINES {
                            stderr_tail.remove(0);
                        }
                        stderr_tail.push(line);
                    }
                    Ok(None) => err_done = true,
                    Err(e) => return Err(AgentError::Protocol(format!("unreadable stderr: {e}"))),
                },
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| AgentError::Internal(format!("failed to wait for agent: {e}")))?;
        debug!(%status, "agent process exited");

        if !status.success() {
            let mut message = format!("`{}` exited with {status}", self.binary);
            if !stderr_tail.is_empty() {
                message.push_str(": ");
                message.push_str(&stderr_tail.join(" | "));
            }
            return Err(AgentError::Protocol(message));
        }

        Ok(parse_result(last_line.as_deref(), output))
    }
}

/// The final stdout line if it is a JSON object or array, else the whole
/// output wrapped as `{"output": …}`.
pub fn parse_result(last_line: Option<&str>, output: String) -> Value {
    if let Some(line) = last_line {
        if let Ok(value) = serde_json::from_str::<Value>(line.trim()) {
            if value.is_object() || value.is_array() {
                return value;
            }
        }
    }
    json!({ "output": output })
}
