//! Aggregated configuration.

use rd_protocol::agent_models::AgentProfile;
use rd_protocol::config_models::GlobalConfig;
use rd_protocol::pipeline_models::PipelineDefinition;
use std::path::{Path, PathBuf};

/// Everything loaded from a project's `.repodoc/` directory.
///
/// - `config.toml`: engine and storage settings
/// - `agents/*.md`: agent profiles
/// - `pipelines/*.yaml`: pipeline definitions, already structurally validated
///
/// # Example
///
/// ```rust,no_run
/// use rd_core::config::loader::load_config;
/// use std::path::Path;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = load_config(Path::new(".")).await?;
/// println!("Loaded {} agents and {} pipelines",
///          config.agents.len(),
///          config.pipelines.len());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub global: GlobalConfig,

    /// Sorted by name.
    pub agents: Vec<AgentProfile>,

    /// Sorted by name.
    pub pipelines: Vec<PipelineDefinition>,
}

impl AppConfig {
    pub fn pipeline(&self, name: &str) -> Option<&PipelineDefinition> {
        self.pipelines.iter().find(|p| p.name == name)
    }

    /// Runs directory, resolved against the project root when relative.
    pub fn runs_dir(&self, project_root: &Path) -> PathBuf {
        let dir = PathBuf::from(&self.global.storage.runs_dir);
        if dir.is_absolute() {
            dir
        } else {
            project_root.join(dir)
        }
    }
}
