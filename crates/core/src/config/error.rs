//! Errors raised while loading `.repodoc/`.

use crate::pipeline::PipelineError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read a configuration file from disk.
    #[error("Failed to read config file at {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse TOML file at {path}: {source}")]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Failed to parse YAML file at {path}: {source}")]
    YamlParse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    /// Failed to parse Markdown front matter.
    #[error("Failed to parse Markdown front matter in {path}: {reason}")]
    MarkdownParse { path: PathBuf, reason: String },

    #[error("Failed to traverse directory {path}: {source}")]
    DirectoryWalk {
        path: PathBuf,
        source: walkdir::Error,
    },

    /// A pipeline file parsed but is structurally inconsistent.
    #[error("Invalid pipeline in {path}: {source}")]
    InvalidPipeline {
        path: PathBuf,
        source: PipelineError,
    },

    /// Two files define the same agent or pipeline name.
    #[error("Duplicate {kind} '{name}' in {path}")]
    Duplicate {
        kind: &'static str,
        name: String,
        path: PathBuf,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;
