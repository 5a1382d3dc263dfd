//! Conditional router.
//!
//! After a stage checkpoints, the router picks the next stage from the
//! pipeline's routing table. Rules for the completed stage are tried in
//! declaration order and the first whose guard holds wins. The decision
//! depends only on the rule table and the context snapshot it is given.

use crate::error::StageError;
use rd_protocol::pipeline_models::{NextStage, PipelineDefinition, RouteCondition};
use rd_protocol::run_models::RunContext;
use serde_json::Value;

/// Routing view over a pipeline definition.
#[derive(Debug, Clone, Copy)]
pub struct Router<'a> {
    pipeline: &'a PipelineDefinition,
}

impl<'a> Router<'a> {
    pub fn new(pipeline: &'a PipelineDefinition) -> Self {
        Self { pipeline }
    }

    /// Select the stage that follows `completed_stage`.
    ///
    /// # Errors
    ///
    /// - `UnknownStage` if no rule starts at `completed_stage`
    /// - `NoRoute` if rules exist but none matches `context`
    pub fn next(&self, completed_stage: &str, context: &RunContext) -> Result<NextStage, StageError> {
        let mut candidates = self
            .pipeline
            .routes
            .iter()
            .filter(|rule| rule.from == completed_stage)
            .peekable();

        if candidates.peek().is_none() {
            return Err(StageError::UnknownStage(completed_stage.to_string()));
        }

        candidates
            .find(|rule| rule.when.as_ref().map_or(true, |c| evaluate(c, context)))
            .map(|rule| rule.to.clone())
            .ok_or_else(|| StageError::NoRoute(completed_stage.to_string()))
    }
}

/// Evaluate a route guard against the context.
pub fn evaluate(condition: &RouteCondition, context: &RunContext) -> bool {
    match condition {
        RouteCondition::Truthy(key) => context.get(key).is_some_and(is_truthy),
        RouteCondition::Falsy(key) => !context.get(key).is_some_and(is_truthy),
        RouteCondition::Present(key) => context.contains_key(key),
        RouteCondition::Absent(key) => !context.contains_key(key),
        RouteCondition::Equals { key, value } => context.get(key) == Some(value),
        RouteCondition::All(conditions) => conditions.iter().all(|c| evaluate(c, context)),
        RouteCondition::Any(conditions) => conditions.iter().any(|c| evaluate(c, context)),
        RouteCondition::Not(inner) => !evaluate(inner, context),
    }
}

/// `null`, `false`, `0`, `""`, `[]` and `{}` are falsy; everything else is truthy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
