//! Pipeline validation and routing.

pub mod router;

pub use router::Router;

use rd_protocol::pipeline_models::{NextStage, PipelineDefinition, StageKind};
use rd_protocol::run_models::OPERATOR_NOTES_KEY;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Structural defects in a pipeline definition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("stage '{0}' is defined more than once")]
    DuplicateStage(String),

    #[error("entry stage '{0}' is not defined")]
    UnknownEntry(String),

    #[error("route starts at undefined stage '{0}'")]
    UnknownRouteSource(String),

    #[error("route from '{from}' targets undefined stage '{to}'")]
    UnknownRouteTarget { from: String, to: String },

    /// Every context key has exactly one writer.
    #[error("output '{key}' is declared by both '{first}' and '{second}'")]
    SharedOutput {
        key: String,
        first: String,
        second: String,
    },

    /// The key is written by the controller, never by a stage.
    #[error("stage '{stage}' declares reserved output '{key}'")]
    ReservedOutput { stage: String, key: String },

    #[error("stage '{stage}' is bound to unknown {kind} '{target}'")]
    UnboundTarget {
        stage: String,
        kind: &'static str,
        target: String,
    },
}

/// Check the definition is internally consistent.
///
/// Route coverage is not checked here: a stage without outgoing rules fails
/// the run with `UnknownStage` when it completes.
pub fn validate(pipeline: &PipelineDefinition) -> Result<(), PipelineError> {
    let mut names = HashSet::new();
    for stage in &pipeline.stages {
        if !names.insert(stage.name.as_str()) {
            return Err(PipelineError::DuplicateStage(stage.name.clone()));
        }
    }

    if !names.contains(pipeline.entry.as_str()) {
        return Err(PipelineError::UnknownEntry(pipeline.entry.clone()));
    }

    for rule in &pipeline.routes {
        if !names.contains(rule.from.as_str()) {
            return Err(PipelineError::UnknownRouteSource(rule.from.clone()));
        }
        if let NextStage::Stage(to) = &rule.to {
            if !names.contains(to.as_str()) {
                return Err(PipelineError::UnknownRouteTarget {
                    from: rule.from.clone(),
                    to: to.clone(),
                });
            }
        }
    }

    let mut owners: HashMap<&str, &str> = HashMap::new();
    for stage in &pipeline.stages {
        for key in &stage.outputs {
            if key == OPERATOR_NOTES_KEY {
                return Err(PipelineError::ReservedOutput {
                    stage: stage.name.clone(),
                    key: key.clone(),
                });
            }
            if let Some(first) = owners.insert(key.as_str(), stage.name.as_str()) {
                return Err(PipelineError::SharedOutput {
                    key: key.clone(),
                    first: first.to_string(),
                    second: stage.name.clone(),
                });
            }
        }
    }

    Ok(())
}

/// Check every stage is bound to an agent or step that exists.
pub fn validate_bindings(
    pipeline: &PipelineDefinition,
    has_agent: impl Fn(&str) -> bool,
    has_step: impl Fn(&str) -> bool,
) -> Result<(), PipelineError> {
    for stage in &pipeline.stages {
        let (kind, known) = match stage.kind {
            StageKind::Agent => ("agent", has_agent(stage.target())),
            StageKind::Step => ("step", has_step(stage.target())),
        };
        if !known {
            return Err(PipelineError::UnboundTarget {
                stage: stage.name.clone(),
                kind,
                target: stage.target().to_string(),
            });
        }
    }
    Ok(())
}
