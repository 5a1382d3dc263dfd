//! Configuration file loader for the `.repodoc/` directory structure.
//!
//! Loads:
//! - `config.toml`: engine and storage settings
//! - `agents/*.md`: agent profiles with YAML front matter
//! - `pipelines/*.yaml`: pipeline definitions

use crate::config::error::ConfigError;
use crate::config::error::ConfigResult;
use crate::config::models::AppConfig;
use crate::pipeline;
use gray_matter::engine::YAML;
use gray_matter::Matter;
use rd_protocol::agent_models::AgentProfile;
use rd_protocol::config_models::GlobalConfig;
use rd_protocol::pipeline_models::PipelineDefinition;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Name of the project configuration directory.
pub const CONFIG_DIR: &str = ".repodoc";

/// Loads all configuration from `<root>/.repodoc/`.
///
/// Missing directories or files fall back to defaults rather than errors.
/// Pipelines are structurally validated as they are loaded.
///
/// # Errors
///
/// Returns `ConfigError` if:
/// - Files exist but cannot be read
/// - Files have invalid syntax (TOML, YAML, or Markdown front matter)
/// - A pipeline is malformed, or two files share an agent or pipeline name
///
/// # Example
///
/// ```rust,no_run
/// use rd_core::config::loader::load_config;
/// use std::path::Path;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = load_config(Path::new(".")).await?;
/// println!("Loaded {} agents", config.agents.len());
/// # Ok(())
/// # }
/// ```
pub async fn load_config(root: &Path) -> ConfigResult<AppConfig> {
    let config_dir = root.join(CONFIG_DIR);

    if !config_dir.exists() {
        return Ok(AppConfig::default());
    }

    let global = load_global_config(&config_dir)?;
    let agents = load_agents(&config_dir)?;
    let pipelines = load_pipelines(&config_dir)?;

    tracing::debug!(
        agents = agents.len(),
        pipelines = pipelines.len(),
        dir = %config_dir.display(),
        "Loaded configuration"
    );

    Ok(AppConfig {
        global,
        agents,
        pipelines,
    })
}

fn load_global_config(config_dir: &Path) -> ConfigResult<GlobalConfig> {
    let config_path = config_dir.join("config.toml");

    if !config_path.exists() {
        return Ok(GlobalConfig::default());
    }

    let content = read_file(&config_path)?;
    toml::from_str(&content).map_err(|source| ConfigError::TomlParse {
        path: config_path,
        source,
    })
}

fn read_file(path: &Path) -> ConfigResult<String> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
        path: path.to_path_buf(),
        source,
    })
}

/// Files directly inside `dir` with one of `extensions`, sorted by path.
fn files_with_extension(dir: &Path, extensions: &[&str]) -> ConfigResult<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|source| ConfigError::DirectoryWalk {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        let ext = path.extension().and_then(|s| s.to_str());
        if ext.is_some_and(|ext| extensions.contains(&ext)) {
            files.push(path.to_path_buf());
        }
    }
    Ok(files)
}

fn load_agents(config_dir: &Path) -> ConfigResult<Vec<AgentProfile>> {
    let mut agents: Vec<AgentProfile> = Vec::new();
    let mut seen = HashSet::new();

    for path in files_with_extension(&config_dir.join("agents"), &["md"])? {
        let content = read_file(&path)?;

        let matter = Matter::<YAML>::new();
        let result = matter.parse(&content);

        let mut agent: AgentProfile = result
            .data
            .ok_or_else(|| ConfigError::MarkdownParse {
                path: path.clone(),
                reason: "Missing YAML front matter".to_string(),
            })?
            .deserialize()
            .map_err(|e| ConfigError::MarkdownParse {
                path: path.clone(),
                reason: format!("Failed to deserialize front matter: {}", e),
            })?;

        agent.system_prompt = result.content;

        if !seen.insert(agent.name.clone()) {
            return Err(ConfigError::Duplicate {
                kind: "agent",
                name: agent.name,
                path,
            });
        }
        agents.push(agent);
    }

    agents.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(agents)
}

fn load_pipelines(config_dir: &Path) -> ConfigResult<Vec<PipelineDefinition>> {
    let mut pipelines: Vec<PipelineDefinition> = Vec::new();
    let mut seen = HashSet::new();

    for path in files_with_extension(&config_dir.join("pipelines"), &["yaml", "yml"])? {
        let content = read_file(&path)?;

        let definition: PipelineDefinition =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::YamlParse {
                path: path.clone(),
                source,
            })?;

        pipeline::validate(&definition).map_err(|source| ConfigError::InvalidPipeline {
            path: path.clone(),
            source,
        })?;

        if !seen.insert(definition.name.clone()) {
            return Err(ConfigError::Duplicate {
                kind: "pipeline",
                name: definition.name,
                path,
            });
        }
        pipelines.push(definition);
    }

    pipelines.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(pipelines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const PIPELINE: &str = r#"name: quick-scan
entry: structure
stages:
  - name: structure
    kind: agent
    agent: structure-analyst
    inputs: [repo_ref]
    outputs: [structure, gap_detected]
routes:
  - { from: structure, to: END }
"#;

    fn config_dir(root: &Path) -> PathBuf {
        let dir = root.join(CONFIG_DIR);
        fs::create_dir_all(dir.join("agents")).expect("Failed to create agents dir");
        fs::create_dir_all(dir.join("pipelines")).expect("Failed to create pipelines dir");
        dir
    }

    #[tokio::test]
    async fn test_load_config_acceptance() {
        let dir = tempdir().expect("Failed to create temp dir");
        let cfg = config_dir(dir.path());

        fs::write(
            cfg.join("config.toml"),
            "[engine]\npause_timeout_minutes = 1\nmax_retries = 5\n\n[storage]\nruns_dir = \"runs\"\n",
        )
        .expect("Failed to write config.toml");

        let agent_md = r#"---
name: structure-analyst
description: Maps modules and entrypoints
model: gpt-5.2
command: ./agents/structure.sh
args: ["--fast"]
---

You are a senior engineer mapping an unfamiliar repository."#;
        fs::write(cfg.join("agents/structure-analyst.md"), agent_md)
            .expect("Failed to write agent file");
        fs::write(cfg.join("pipelines/quick-scan.yaml"), PIPELINE)
            .expect("Failed to write pipeline file");

        let config = load_config(dir.path()).await.expect("Failed to load config");

        assert_eq!(config.global.engine.pause_timeout_minutes, 1);
        assert_eq!(config.global.engine.max_retries, 5);
        assert_eq!(config.global.engine.stage_timeout_seconds, 600);
        assert_eq!(config.global.storage.runs_dir, "runs");

        assert_eq!(config.agents.len(), 1);
        let agent = &config.agents[0];
        assert_eq!(agent.name, "structure-analyst");
        assert_eq!(agent.command.as_deref(), Some("./agents/structure.sh"));
        assert_eq!(agent.args, vec!["--fast".to_string()]);
        assert!(agent.system_prompt.contains("senior engineer"));

        let pipeline = config.pipeline("quick-scan").expect("pipeline loaded");
        assert_eq!(pipeline.entry, "structure");
        assert_eq!(pipeline.stages[0].inputs, vec!["repo_ref".to_string()]);
    }

    #[tokio::test]
    async fn test_load_config_empty_directory() {
        let dir = tempdir().expect("Failed to create temp dir");
        let config = load_config(dir.path())
            .await
            .expect("Should handle missing .repodoc");

        assert_eq!(config.global, GlobalConfig::default());
        assert!(config.agents.is_empty());
        assert!(config.pipelines.is_empty());
    }

    #[tokio::test]
    async fn test_load_config_invalid_toml() {
        let dir = tempdir().expect("Failed to create temp dir");
        let cfg = config_dir(dir.path());
        fs::write(cfg.join("config.toml"), "[engine\nmax_retries = ")
            .expect("Failed to write config.toml");

        match load_config(dir.path()).await {
            Err(ConfigError::TomlParse { path, .. }) => assert!(path.ends_with("config.toml")),
            other => panic!("Expected TomlParse error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_load_config_invalid_yaml() {
        let dir = tempdir().expect("Failed to create temp dir");
        let cfg = config_dir(dir.path());
        fs::write(cfg.join("pipelines/test.yaml"), "name: test\n  invalid: [yaml")
            .expect("Failed to write pipeline file");

        match load_config(dir.path()).await {
            Err(ConfigError::YamlParse { path, .. }) => assert!(path.ends_with("test.yaml")),
            other => panic!("Expected YamlParse error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_load_config_rejects_malformed_pipeline() {
        let dir = tempdir().expect("Failed to create temp dir");
        let cfg = config_dir(dir.path());
        let broken = PIPELINE.replace("entry: structure", "entry: nowhere");
        fs::write(cfg.join("pipelines/broken.yaml"), broken).expect("Failed to write pipeline");

        match load_config(dir.path()).await {
            Err(ConfigError::InvalidPipeline { source, .. }) => {
                assert!(source.to_string().contains("nowhere"))
            }
            other => panic!("Expected InvalidPipeline error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_load_config_duplicate_pipeline() {
        let dir = tempdir().expect("Failed to create temp dir");
        let cfg = config_dir(dir.path());
        fs::write(cfg.join("pipelines/a.yaml"), PIPELINE).expect("write");
        fs::write(cfg.join("pipelines/b.yml"), PIPELINE).expect("write");

        match load_config(dir.path()).await {
            Err(ConfigError::Duplicate { kind, name, .. }) => {
                assert_eq!(kind, "pipeline");
                assert_eq!(name, "quick-scan");
            }
            other => panic!("Expected Duplicate error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_load_config_agent_no_frontmatter() {
        let dir = tempdir().expect("Failed to create temp dir");
        let cfg = config_dir(dir.path());
        fs::write(cfg.join("agents/test.md"), "Just plain markdown content")
            .expect("Failed to write agent file");

        match load_config(dir.path()).await {
            Err(ConfigError::MarkdownParse { path, reason }) => {
                assert!(path.ends_with("test.md"));
                assert!(reason.contains("Missing YAML front matter"));
            }
            other => panic!("Expected MarkdownParse error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_load_config_agent_invalid_frontmatter() {
        let dir = tempdir().expect("Failed to create temp dir");
        let cfg = config_dir(dir.path());
        let invalid = "---\nname: test-agent\n---\n\nAgent content";
        fs::write(cfg.join("agents/test.md"), invalid).expect("Failed to write agent file");

        match load_config(dir.path()).await {
            Err(ConfigError::MarkdownParse { reason, .. }) => {
                assert!(reason.contains("Failed to deserialize"))
            }
            other => panic!("Expected MarkdownParse error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_load_config_ignores_non_matching_files() {
        let dir = tempdir().expect("Failed to create temp dir");
        let cfg = config_dir(dir.path());
        fs::write(cfg.join("agents/readme.txt"), "Not a markdown file").expect("write");
        fs::write(cfg.join("pipelines/notes.txt"), "Not a yaml file").expect("write");
        fs::write(
            cfg.join("agents/valid.md"),
            "---\nname: valid-agent\ndescription: Valid agent\n---\n\nValid content",
        )
        .expect("write");

        let config = load_config(dir.path())
            .await
            .expect("Should ignore non-matching files");
        assert_eq!(config.agents.len(), 1);
        assert!(config.agents[0].command.is_none());
        assert!(config.pipelines.is_empty());
    }
}
