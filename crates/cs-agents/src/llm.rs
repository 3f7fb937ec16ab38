//! Anthropic Messages API agent.
//!
//! Requests are sent with `stream: true`; text deltas from the server-sent
//! event stream are forwarded as stdout chunks as they arrive.

use async_trait::async_trait;
use cs_core::config::AnthropicAgentConfig;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::agent::{Agent, AgentError, AgentInvocation, ChunkSink};
use crate::prompts::system_prompt;

const ANTHROPIC_VERSION: &str = "2023-06-01";

// ---------------------------------------------------------------------------
// SSE events
// ---------------------------------------------------------------------------

/// The subset of Messages API stream events this agent acts on.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        message: MessageStart,
    },
    ContentBlockDelta {
        delta: Delta,
    },
    MessageDelta {
        delta: MessageDeltaBody,
    },
    MessageStop,
    Error {
        error: ApiErrorBody,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MessageStart {
    #[serde(default)]
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delta {
    TextDelta {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MessageDeltaBody {
    #[serde(default)]
    pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ApiErrorBody {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub message: String,
}

/// Parse one SSE line. Returns `Ok(None)` for blank lines, comments,
/// `event:` lines and anything that is not a `data:` payload.
pub fn parse_sse_line(line: &str) -> Result<Option<StreamEvent>, AgentError> {
    let line = line.trim_end_matches('\r');
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(None);
    };
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return Ok(None);
    }
    serde_json::from_str(data)
        .map(Some)
        .map_err(|e| AgentError::Protocol(format!("malformed stream event: {e}")))
}

// ---------------------------------------------------------------------------
// AnthropicAgent
// ---------------------------------------------------------------------------

pub struct AnthropicAgent {
    name: String,
    client: reqwest::Client,
    model: String,
    max_tokens: u32,
    api_key_env: String,
    api_key: Option<String>,
    base_url: String,
}

impl AnthropicAgent {
    pub fn from_config(name: &str, cfg: &AnthropicAgentConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self {
            name: name.to_string(),
            client,
            model: cfg.model.clone(),
            max_tokens: cfg.max_tokens,
            api_key_env: cfg.api_key_env.clone(),
            api_key: None,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Use an explicit key instead of reading `api_key_env`.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Override the base URL (useful for testing with a mock server).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn resolve_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var(&self.api_key_env).ok())
            .filter(|k| !k.trim().is_empty())
    }

    pub fn build_request_body(&self, invocation: &AgentInvocation) -> Value {
        json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "stream": true,
            "system": system_prompt(invocation.task_type),
            "messages": [{ "role": "user", "content": invocation.prompt }],
        })
    }
}

#[async_trait]
impl Agent for AnthropicAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn preflight(&self, _invocation: &AgentInvocation) -> Result<(), AgentError> {
        if self.resolve_key().is_none() {
            return Err(AgentError::Unavailable(format!(
                "API key not set (expected in ${})",
                self.api_key_env
            )));
        }
        Ok(())
    }

    async fn run(&self, invocation: AgentInvocation, sink: ChunkSink) -> Result<Value, AgentError> {
        let key = self
            .resolve_key()
            .ok_or_else(|| AgentError::Unavailable("API key not set".into()))?;
        let body = self.build_request_body(&invocation);
        let url = format!("{}/v1/messages", self.base_url);

        let resp = self
            .client
            .post(&url)
            .header("x-api-key", key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Unavailable(format!("request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let message = format!("API returned {}: {}", status.as_u16(), text.trim());
            // 529 is Anthropic's "overloaded".
            return if status.as_u16() == 429 || status.is_server_error() {
                Err(AgentError::Unavailable(message))
            } else {
                Err(AgentError::Protocol(message))
            };
        }

        let mut stream = resp.bytes_stream();
        let mut buffer = String::new();
        let mut output = String::new();
        let mut model = self.model.clone();
        let mut stop_reason: Option<String> = None;
        let mut stopped = false;

        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| AgentError::Unavailable(format!("stream interrupted: {e}")))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(line_end) = buffer.find('\n') {
                let line: String = buffer.drain(..=line_end).collect();
                let Some(event) = parse_sse_line(&line)? else {
                    continue;
                };
                match event {
                    StreamEvent::MessageStart { message } if !message.model.is_empty() => {
                        model = message.model;
                    }
                    StreamEvent::ContentBlockDelta {
                        delta: Delta::TextDelta { text },
                    } => {
                        output.push_str(&text);
                        sink.stdout(text);
                    }
                    StreamEvent::MessageDelta { delta } => {
                        if delta.stop_reason.is_some() {
                            stop_reason = delta.stop_reason;
                        }
                    }
                    StreamEvent::MessageStop => stopped = true,
                    StreamEvent::Error { error } => {
                        warn!(kind = %error.kind, "anthropic stream error");
                        return Err(if error.kind == "overloaded_error" {
                            AgentError::Unavailable(error.message)
                        } else {
                            AgentError::Protocol(format!("{}: {}", error.kind, error.message))
                        });
                    }
                    _ => {}
                }
            }
        }

        if !stopped {
            return Err(AgentError::Protocol(
                "stream ended before message_stop".into(),
            ));
        }
        debug!(%model, ?stop_reason, bytes = output.len(), "anthropic stream complete");

        let parsed = crate::command::parse_result(
            output.lines().rev().find(|l| !l.trim().is_empty()),
            output.clone(),
        );
        let mut result = match parsed {
            Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("result".into(), other);
                map
            }
        };
        result.entry("model").or_insert(Value::String(model));
        if let Some(reason) = stop_reason {
            result.entry("stopReason").or_insert(Value::String(reason));
        }
        Ok(Value::Object(result))
    }
}
