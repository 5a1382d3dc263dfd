//! Agent manager for orchestrating multiple agents.
//!
//! The `AgentManager` is responsible for:
//! - Registering agent instances by name
//! - Looking up agents by name
//! - Providing fallback logic when agents are unavailable

use crate::agents::base::{Agent, AgentError, AgentStream, ExecutionContext};
use crate::agents::factory::AgentFactory;
use rd_protocol::agent_models::AgentProfile;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Registry of agent adapters, keyed by agent name.
#[derive(Clone, Default)]
pub struct AgentManager {
    agents: HashMap<String, Arc<dyn Agent>>,
    fallback_agent_name: Option<String>,
}

impl AgentManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from `.repodoc/agents/*.md` profiles.
    ///
    /// Command agents are started in `project_root`.
    pub fn from_profiles(profiles: &[AgentProfile], project_root: &Path) -> Self {
        let mut manager = Self::new();
        for profile in profiles {
            manager.register(profile.name.clone(), AgentFactory::create(profile, project_root));
        }
        manager
    }

    /// Register (or replace) an agent under `name`.
    pub fn register(&mut self, name: impl Into<String>, agent: Arc<dyn Agent>) {
        self.agents.insert(name.into(), agent);
    }

    /// Builder form of [`register`](Self::register).
    pub fn with_agent(mut self, name: impl Into<String>, agent: Arc<dyn Agent>) -> Self {
        self.register(name, agent);
        self
    }

    /// Set the fallback agent to use when the requested agent is unavailable.
    pub fn with_fallback(mut self, agent_name: impl Into<String>) -> Self {
        self.fallback_agent_name = Some(agent_name.into());
        self
    }

    pub fn get_agent(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(name).cloned()
    }

    /// Execute with the named agent.
    ///
    /// 1. Look up the requested agent
    /// 2. Check if it's available
    /// 3. If unavailable and a fallback is configured, try the fallback agent
    /// 4. Execute with the selected agent
    pub async fn execute(
        &self,
        agent_name: &str,
        context: &ExecutionContext,
    ) -> Result<AgentStream, AgentError> {
        let Some(agent) = self.get_agent(agent_name) else {
            return Err(AgentError::NotAvailable(format!(
                "Agent '{}' not found in registry",
                agent_name
            )));
        };

        if agent.check_availability().await {
            return agent.execute(context).await;
        }

        if let Some(fallback_name) = self.fallback_agent_name.as_deref() {
            if fallback_name != agent_name {
                if let Some(fallback_agent) = self.get_agent(fallback_name) {
                    if fallback_agent.check_availability().await {
                        tracing::warn!(
                            agent = agent_name,
                            fallback = fallback_name,
                            "Agent unavailable, using fallback"
                        );
                        return fallback_agent.execute(context).await;
                    }
                }
            }
        }

        Err(AgentError::NotAvailable(format!(
            "Agent '{}' is not available and no fallback succeeded",
            agent_name
        )))
    }

    /// List all registered agent names, sorted.
    pub fn list_agents(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_agent(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::adapters::MockAgent;
    use crate::agents::base::AgentEvent;
    use tokio_stream::StreamExt;

    fn profile(name: &str) -> AgentProfile {
        AgentProfile {
            name: name.to_string(),
            description: format!("Test agent {}", name),
            model: "test-model".to_string(),
            command: None,
            args: vec![],
            system_prompt: "Test prompt".to_string(),
        }
    }

    fn context() -> ExecutionContext {
        ExecutionContext::new("structure", "test instruction")
            .with_expected_outputs(vec!["structure".into()])
    }

    #[test]
    fn test_from_profiles() {
        let manager = AgentManager::from_profiles(&[profile("b"), profile("a")], Path::new("."));
        assert!(manager.has_agent("a"));
        assert!(manager.has_agent("b"));
        assert!(!manager.has_agent("c"));
        assert_eq!(manager.list_agents(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_execute_success() {
        let manager = AgentManager::new().with_agent("analyst", Arc::new(MockAgent::success()));
        let events: Vec<_> = manager
            .execute("analyst", &context())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(events.last(), Some(&Ok(AgentEvent::Completed)));
    }

    #[tokio::test]
    async fn test_execute_not_found() {
        let manager = AgentManager::new();
        let result = manager.execute("nonexistent", &context()).await;
        assert!(matches!(result, Err(AgentError::NotAvailable(_))));
    }

    #[tokio::test]
    async fn test_execute_uses_fallback() {
        let fallback = MockAgent::success();
        let manager = AgentManager::new()
            .with_agent("primary", Arc::new(MockAgent::unavailable()))
            .with_agent("fallback", Arc::new(fallback.clone()))
            .with_fallback("fallback");

        let stream = manager.execute("primary", &context()).await;
        assert!(stream.is_ok());
        assert_eq!(fallback.calls(), 1);
    }

    #[tokio::test]
    async fn test_execute_unavailable_without_fallback() {
        let manager = AgentManager::new().with_agent("primary", Arc::new(MockAgent::unavailable()));
        let result = manager.execute("primary", &context()).await;
        assert!(matches!(result, Err(AgentError::NotAvailable(_))));
    }
}
