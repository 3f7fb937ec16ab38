use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from `~/.codescope/config.toml`.
///
/// API keys are never stored here; agent tables name the environment
/// variable to read the key from at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default = "default_agents")]
    pub agents: BTreeMap<String, AgentConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            daemon: DaemonConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            agents: default_agents(),
        }
    }
}

impl Config {
    /// Load config from `~/.codescope/config.toml`, falling back to defaults
    /// when the file does not exist. Environment overrides are applied last.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        let mut cfg = if path.exists() {
            Self::parse_file(&path)?
        } else {
            Config::default()
        };
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let mut cfg = Self::parse_file(&path)?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a TOML document without touching the environment.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.orchestrator.validate()?;
        for (name, agent) in &self.agents {
            agent.validate(name)?;
        }
        if !self.agents.contains_key(&self.orchestrator.default_agent) {
            return Err(ConfigError::Validation(format!(
                "orchestrator.default_agent '{}' is not a configured agent",
                self.orchestrator.default_agent
            )));
        }
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply `CS_*` overrides using `lookup` as the environment. Unparseable
    /// values are ignored with a warning.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(key, value = %raw, "ignoring unparseable config override");
                    None
                }
            }
        }

        if let Some(v) = parsed::<usize>("CS_MAX_CONCURRENT_TASKS", lookup("CS_MAX_CONCURRENT_TASKS")) {
            self.orchestrator.max_concurrent_tasks = if v == 0 { None } else { Some(v) };
        }
        if let Some(v) = parsed("CS_TASK_TIMEOUT_SECS", lookup("CS_TASK_TIMEOUT_SECS")) {
            self.orchestrator.task_timeout_secs = v;
        }
        if let Some(v) = parsed("CS_SUBSCRIBER_QUEUE_CAP", lookup("CS_SUBSCRIBER_QUEUE_CAP")) {
            self.orchestrator.subscriber_queue_cap = v;
        }
        if let Some(v) = parsed("CS_PORT", lookup("CS_PORT")) {
            self.daemon.port = v;
        }
        if let Some(dir) = lookup("CS_DATA_DIR").filter(|d| !d.trim().is_empty()) {
            self.daemon.data_dir = dir;
        }
    }

    fn parse_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".codescope")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_project_name")]
    pub project_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

fn default_project_name() -> String {
    "codescope".into()
}
fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_daemon_host")]
    pub host: String,
    #[serde(default = "default_daemon_port")]
    pub port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_true")]
    pub persist: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: default_daemon_host(),
            port: default_daemon_port(),
            data_dir: default_data_dir(),
            persist: true,
        }
    }
}

impl DaemonConfig {
    /// `data_dir` with a leading `~` expanded to the home directory.
    pub fn resolved_data_dir(&self) -> PathBuf {
        expand_home(&self.data_dir)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_daemon_host() -> String {
    "127.0.0.1".into()
}
fn default_daemon_port() -> u16 {
    9090
}
fn default_data_dir() -> String {
    "~/.codescope/data".into()
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Global cap on simultaneously running tasks. `None` means unlimited.
    #[serde(default)]
    pub max_concurrent_tasks: Option<usize>,
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,
    /// Per-subscriber live queue length. `0` disables the bound.
    #[serde(default = "default_queue_cap")]
    pub subscriber_queue_cap: usize,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,
    /// Finished tasks whose log buffers stay in memory for chunk replay.
    /// Older logs are served from the store as plain text.
    #[serde(default = "default_retained_logs")]
    pub retained_log_buffers: usize,
    #[serde(default = "default_agent_name")]
    pub default_agent: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: None,
            task_timeout_secs: default_task_timeout(),
            subscriber_queue_cap: default_queue_cap(),
            heartbeat_secs: default_heartbeat(),
            retained_log_buffers: default_retained_logs(),
            default_agent: default_agent_name(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.task_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "orchestrator.task_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.heartbeat_secs == 0 {
            return Err(ConfigError::Validation(
                "orchestrator.heartbeat_secs must be greater than zero".into(),
            ));
        }
        if self.max_concurrent_tasks == Some(0) {
            return Err(ConfigError::Validation(
                "orchestrator.max_concurrent_tasks must be at least 1 when set".into(),
            ));
        }
        Ok(())
    }
}

fn default_task_timeout() -> u64 {
    600
}
fn default_queue_cap() -> usize {
    1024
}
fn default_retained_logs() -> usize {
    256
}
fn default_heartbeat() -> u64 {
    30
}
fn default_agent_name() -> String {
    "claude-code".into()
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

/// One `[agents.<name>]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AgentConfig {
    Command(CommandAgentConfig),
    Anthropic(AnthropicAgentConfig),
}

impl AgentConfig {
    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        match self {
            AgentConfig::Command(c) if c.binary.trim().is_empty() => Err(ConfigError::Validation(
                format!("agents.{name}.binary must not be empty"),
            )),
            AgentConfig::Anthropic(a) if a.model.trim().is_empty() => Err(ConfigError::Validation(
                format!("agents.{name}.model must not be empty"),
            )),
            AgentConfig::Anthropic(a) if a.max_tokens == 0 => Err(ConfigError::Validation(
                format!("agents.{name}.max_tokens must be greater than zero"),
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandAgentConfig {
    #[serde(default)]
    pub binary: String,
    /// Arguments placed before the prompt.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub workdir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnthropicAgentConfig {
    #[serde(default)]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_anthropic_url")]
    pub base_url: String,
}

fn default_max_tokens() -> u32 {
    4096
}
fn default_api_key_env() -> String {
    "ANTHROPIC_API_KEY".into()
}
fn default_anthropic_url() -> String {
    "https://api.anthropic.com".into()
}

fn default_agents() -> BTreeMap<String, AgentConfig> {
    let mut agents = BTreeMap::new();
    agents.insert(
        "claude-code".to_string(),
        AgentConfig::Command(CommandAgentConfig {
            binary: "claude".into(),
            args: vec!["-p".into()],
            env: BTreeMap::new(),
            workdir: None,
        }),
    );
    agents.insert(
        "anthropic".to_string(),
        AgentConfig::Anthropic(AnthropicAgentConfig {
            model: "claude-sonnet-4-20250514".into(),
            max_tokens: default_max_tokens(),
            api_key_env: default_api_key_env(),
            base_url: default_anthropic_url(),
        }),
    );
    agents
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    }
    if let Some(rest) = path.strip_prefix("~/") {
        return dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest);
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_home_leaves_absolute_paths() {
        assert_eq!(expand_home("/var/data"), PathBuf::from("/var/data"));
        assert!(!expand_home("~/x").to_string_lossy().starts_with('~'));
    }
}
