//! Pipeline configuration models for `.repodoc/pipelines/*.yaml`.
//!
//! A pipeline is a graph of named stages plus an ordered table of route
//! rules that decides which stage follows each completed one.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// How a stage performs its work.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, TS)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// A deterministic step implemented inside the engine.
    Step,
    /// An invocation of an external analysis agent.
    Agent,
}

/// A named unit of work in the pipeline graph.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
#[serde(rename_all = "kebab-case")]
pub struct StageDefinition {
    /// Unique within the pipeline.
    pub name: String,

    pub kind: StageKind,

    #[serde(default)]
    pub description: String,

    /// Agent invoked by an agent-kind stage. Defaults to the stage name.
    #[serde(default)]
    pub agent: Option<String>,

    /// Built-in step run by a step-kind stage. Defaults to the stage name.
    #[serde(default)]
    pub step: Option<String>,

    /// Context keys that must be present before the stage runs.
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Context keys passed along when present, never required.
    #[serde(default)]
    pub optional_inputs: Vec<String>,

    /// Context keys this stage is the sole writer of.
    #[serde(default)]
    pub outputs: Vec<String>,

    /// Overrides the engine's per-attempt timeout.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    /// Overrides the engine's retry bound.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl StageDefinition {
    /// Name of the agent or step this stage is bound to.
    pub fn target(&self) -> &str {
        let bound = match self.kind {
            StageKind::Agent => self.agent.as_deref(),
            StageKind::Step => self.step.as_deref(),
        };
        bound.unwrap_or(&self.name)
    }
}

/// Marker for the end of a pipeline; deserializes only from the literal string "END".
#[derive(Debug, Clone, Copy, PartialEq, Eq, TS)]
pub struct TerminalMarker;

impl<'de> Deserialize<'de> for TerminalMarker {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s == "END" {
            Ok(TerminalMarker)
        } else {
            Err(serde::de::Error::custom(format!("expected END, got {s}")))
        }
    }
}

impl Serialize for TerminalMarker {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str("END")
    }
}

/// Where a route rule sends the run.
///
/// `#[serde(untagged)]` keeps the YAML terse: `to: END` or `to: web_search`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
#[serde(untagged)]
pub enum NextStage {
    /// The run is complete.
    Terminal(TerminalMarker),

    /// Continue with the named stage.
    Stage(String),
}

impl NextStage {
    pub fn stage(name: impl Into<String>) -> Self {
        Self::Stage(name.into())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal(_))
    }
}

/// A predicate over the run context.
///
/// ```yaml
/// when: { truthy: gap_detected }
/// when: { all: [ { truthy: run_sde }, { present: structure } ] }
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
#[serde(rename_all = "snake_case")]
pub enum RouteCondition {
    /// Key is present and not null/false/0/""/[]/{}.
    Truthy(String),
    /// Key is absent or falsy.
    Falsy(String),
    /// Key is present (any value, including null).
    Present(String),
    /// Key is absent.
    Absent(String),
    /// Key is present and equal to `value`.
    Equals {
        key: String,
        value: serde_json::Value,
    },
    All(Vec<RouteCondition>),
    Any(Vec<RouteCondition>),
    Not(Box<RouteCondition>),
}

/// Map-form (de)serialization for route guards.
///
/// serde_yaml reads externally tagged enums only from `!tag` syntax, so
/// guards pass through a `serde_json::Value`, which accepts the
/// `{ truthy: key }` form from either format.
mod guard {
    use super::RouteCondition;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(value: &Option<RouteCondition>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let json = value
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(serde::ser::Error::custom)?;
        json.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<RouteCondition>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<serde_json::Value>::deserialize(deserializer)? {
            None => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}

/// One row of the routing table.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
pub struct RouteRule {
    /// Stage whose completion this rule applies to.
    pub from: String,

    /// Guard; a rule without one always matches.
    #[serde(default, with = "guard", skip_serializing_if = "Option::is_none")]
    #[ts(as = "Option<RouteCondition>")]
    pub when: Option<RouteCondition>,

    pub to: NextStage,
}

/// Defines a full analysis pipeline.
///
/// # Example
///
/// ```yaml
/// name: repository-analysis
/// entry: structure
/// stages:
///   - name: structure
///     kind: agent
///     agent: structure-analyst
///     inputs: [repo_ref]
///     outputs: [structure, gap_detected]
///   - name: web_search
///     kind: agent
///     agent: web-researcher
///     inputs: [structure]
///     outputs: [web_findings]
///   - name: sde_report
///     kind: agent
///     agent: sde-writer
///     inputs: [structure]
///     optional-inputs: [web_findings]
///     outputs: [sde_report]
/// routes:
///   - { from: structure, when: { truthy: gap_detected }, to: web_search }
///   - { from: structure, to: sde_report }
///   - { from: web_search, to: sde_report }
///   - { from: sde_report, to: END }
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
#[serde(rename_all = "kebab-case")]
pub struct PipelineDefinition {
    /// Unique name identifying this pipeline.
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Stage a new run starts at.
    pub entry: String,

    pub stages: Vec<StageDefinition>,

    /// Evaluated in declaration order; the first matching rule wins.
    pub routes: Vec<RouteRule>,
}

impl PipelineDefinition {
    pub fn stage(&self, name: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.name == name)
    }
}
