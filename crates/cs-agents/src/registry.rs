use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use cs_core::config::AgentConfig;
use tracing::debug;

use crate::agent::Agent;
use crate::command::CommandAgent;
use crate::llm::AnthropicAgent;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("duplicate agent name: `{0}`")]
    DuplicateAgent(String),
    #[error("agent `{name}` could not be built: {reason}")]
    Build { name: String, reason: String },
}

/// Maps agent identifiers to their implementations.
#[derive(Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one agent per `[agents.<name>]` table.
    pub fn from_config(agents: &BTreeMap<String, AgentConfig>) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for (name, cfg) in agents {
            let agent: Arc<dyn Agent> = match cfg {
                AgentConfig::Command(c) => Arc::new(CommandAgent::from_config(name, c)),
                AgentConfig::Anthropic(a) => Arc::new(
                    AnthropicAgent::from_config(name, a).map_err(|e| RegistryError::Build {
                        name: name.clone(),
                        reason: e.to_string(),
                    })?,
                ),
            };
            registry.register(agent)?;
        }
        Ok(registry)
    }

    /// Add an agent under its own [`Agent::name`].
    pub fn register(&mut self, agent: Arc<dyn Agent>) -> Result<(), RegistryError> {
        let name = agent.name().to_string();
        if self.agents.contains_key(&name) {
            return Err(RegistryError::DuplicateAgent(name));
        }
        debug!(agent = %name, "registered agent");
        self.agents.insert(name, agent);
        Ok(())
    }

    /// Builder-style [`register`](Self::register) that replaces any existing
    /// agent with the same name.
    pub fn with_agent(mut self, agent: Arc<dyn Agent>) -> Self {
        self.agents.insert(agent.name().to_string(), agent);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedAgent;

    #[test]
    fn default_config_registers_builtin_agents() {
        let cfg = cs_core::config::Config::default();
        let registry = AgentRegistry::from_config(&cfg.agents).unwrap();
        assert_eq!(registry.names(), vec!["anthropic".to_string(), "claude-code".to_string()]);
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut registry = AgentRegistry::new();
        registry.register(Arc::new(ScriptedAgent::new("x"))).unwrap();
        assert!(matches!(
            registry.register(Arc::new(ScriptedAgent::new("x"))),
            Err(RegistryError::DuplicateAgent(_))
        ));
        assert!(registry.contains("x"));
        assert!(registry.get("y").is_none());
    }
}
