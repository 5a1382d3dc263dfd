//! Agent profile models for `.repodoc/agents/*.md`.
//!
//! Agents are defined as Markdown files with YAML front matter. The front
//! matter describes how the agent is invoked; the body is its system prompt.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Represents an analysis agent's profile and system prompt.
///
/// # Example
///
/// ```markdown
/// ---
/// name: structure-analyst
/// description: Maps modules, entrypoints and data models
/// model: gpt-5.2
/// command: ./agents/structure.py
/// ---
///
/// You are a senior engineer mapping an unfamiliar repository.
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, TS)]
pub struct AgentProfile {
    /// Unique identifier for this agent.
    ///
    /// Used to bind agent-kind stages in pipeline definitions.
    pub name: String,

    /// Human-readable description of the agent's purpose.
    pub description: String,

    /// Model the agent runs on. Informational for the engine.
    #[serde(default)]
    pub model: String,

    /// Executable that implements the agent.
    ///
    /// When absent the agent is backed by a placeholder implementation that
    /// echoes its declared outputs.
    #[serde(default)]
    pub command: Option<String>,

    /// Extra arguments passed to `command`.
    #[serde(default)]
    pub args: Vec<String>,

    /// The body of the .md file, not part of the front matter.
    #[serde(skip)]
    pub system_prompt: String,
}
