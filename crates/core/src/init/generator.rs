//! Directory structure and file generation for `.repodoc/`.

use super::error::{InitError, InitResult};
use super::templates::{get_template, list_templates};
use crate::config::CONFIG_DIR;
use std::fs;
use std::path::{Path, PathBuf};

/// Agent kept by `--minimal`.
const MINIMAL_AGENTS: &[&str] = &["agents/structure-analyst.md", "agents/sde-writer.md"];

/// Pipeline kept by `--minimal`.
const MINIMAL_PIPELINE: &str = "pipelines/quick-scan.yaml";

/// Options for initializing a `.repodoc/` directory.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Project root; `.repodoc/` is created inside it.
    pub target_dir: PathBuf,

    /// Overwrite an existing `.repodoc/` directory.
    pub force: bool,

    /// Only write the quick-scan pipeline and the agents it needs.
    pub minimal: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            target_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            force: false,
            minimal: false,
        }
    }
}

/// Generate the `.repodoc/` directory structure.
///
/// ```text
/// .repodoc/
/// ├── config.toml
/// ├── agents/
/// │   ├── structure-analyst.md
/// │   ├── sde-writer.md
/// │   ├── web-researcher.md (unless minimal)
/// │   └── pm-writer.md (unless minimal)
/// └── pipelines/
///     ├── quick-scan.yaml
///     └── repository-analysis.yaml (unless minimal)
/// ```
///
/// # Errors
///
/// - `.repodoc/` already exists and `force` is not set
/// - a template is missing from the embedded assets
/// - file system operations fail
pub async fn generate_project_structure(options: InitOptions) -> InitResult<PathBuf> {
    let project_dir = options.target_dir.join(CONFIG_DIR);

    if project_dir.exists() && !options.force {
        return Err(InitError::DirectoryExists(project_dir));
    }

    for sub in ["agents", "pipelines"] {
        let path = project_dir.join(sub);
        fs::create_dir_all(&path).map_err(|source| InitError::DirectoryCreate { path, source })?;
    }

    write_template_file(&project_dir, "config.toml")?;

    let (agents, pipelines) = if options.minimal {
        (
            MINIMAL_AGENTS.iter().map(|s| s.to_string()).collect(),
            vec![MINIMAL_PIPELINE.to_string()],
        )
    } else {
        (list_templates("agents/"), list_templates("pipelines/"))
    };
    for path in agents.iter().chain(pipelines.iter()) {
        write_template_file(&project_dir, path)?;
    }

    tracing::info!(path = %project_dir.display(), minimal = options.minimal, "Project initialized");
    Ok(project_dir)
}

fn write_template_file(project_dir: &Path, template_path: &str) -> InitResult<()> {
    let content = get_template(template_path)
        .ok_or_else(|| InitError::TemplateNotFound(template_path.to_string()))?;

    let target_path = project_dir.join(template_path);
    if let Some(parent) = target_path.parent() {
        fs::create_dir_all(parent).map_err(|source| InitError::DirectoryCreate {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    fs::write(&target_path, content).map_err(|source| InitError::FileWrite {
        path: target_path,
        source,
    })
}
