//! Agent factory for creating agent instances from profiles.

use crate::agents::adapters::{CommandAgent, MockAgent};
use crate::agents::base::Agent;
use rd_protocol::agent_models::AgentProfile;
use std::path::Path;
use std::sync::Arc;

/// Factory for creating agent instances based on profiles.
pub struct AgentFactory;

impl AgentFactory {
    /// Create an agent from a profile.
    ///
    /// Profiles with a `command` become [`CommandAgent`]s started in
    /// `project_root`; profiles without one are served by a placeholder
    /// [`MockAgent`].
    ///
    /// # Examples
    ///
    /// ```
    /// use rd_core::agents::AgentFactory;
    /// use rd_protocol::agent_models::AgentProfile;
    ///
    /// let profile = AgentProfile {
    ///     name: "structure-analyst".to_string(),
    ///     description: "Maps the repository".to_string(),
    ///     model: "gpt-5.2".to_string(),
    ///     command: None,
    ///     args: vec![],
    ///     system_prompt: "You map repositories.".to_string(),
    /// };
    ///
    /// let agent = AgentFactory::create(&profile, std::path::Path::new("."));
    /// ```
    pub fn create(profile: &AgentProfile, project_root: &Path) -> Arc<dyn Agent> {
        match &profile.command {
            Some(command) => Arc::new(
                CommandAgent::new(
                    profile.name.clone(),
                    command.clone(),
                    profile.args.clone(),
                    profile.system_prompt.clone(),
                )
                .with_working_dir(project_root),
            ),
            None => {
                tracing::debug!(agent = %profile.name, "No command configured, using placeholder agent");
                Arc::new(MockAgent::success())
            }
        }
    }
}
