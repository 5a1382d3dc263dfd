//! Built-in deterministic pipeline steps.
//!
//! Step-kind stages run inside the engine instead of calling out to an
//! agent. They receive the same declared input subset an agent would and
//! return the context entries they produce.

use async_trait::async_trait;
use rd_protocol::run_models::RunContext;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Derives `run_sde` / `run_pm` from the requested personas.
pub const PERSONA_ROUTER: &str = "persona-router";

/// Lists which report keys made it into the context.
pub const COLLECT_ARTIFACTS: &str = "collect-artifacts";

#[async_trait]
pub trait DeterministicStep: Send + Sync {
    /// Produce output entries from `inputs`.
    ///
    /// An `Err` fails the stage permanently.
    async fn run(&self, inputs: &RunContext) -> Result<RunContext, String>;
}

/// Registry of step implementations, keyed by step name.
#[derive(Clone, Default)]
pub struct StepRegistry {
    steps: HashMap<String, Arc<dyn DeterministicStep>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry containing every built-in step.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(PERSONA_ROUTER, Arc::new(PersonaRouter));
        registry.register(COLLECT_ARTIFACTS, Arc::new(CollectArtifacts));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, step: Arc<dyn DeterministicStep>) {
        self.steps.insert(name.into(), step);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DeterministicStep>> {
        self.steps.get(name).cloned()
    }

    pub fn has_step(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }
}

/// Reads `target_personas` (e.g. `["sde"]`) and sets one flag per persona.
///
/// Without `target_personas` both reports are requested.
pub struct PersonaRouter;

#[async_trait]
impl DeterministicStep for PersonaRouter {
    async fn run(&self, inputs: &RunContext) -> Result<RunContext, String> {
        let (run_sde, run_pm) = match inputs.get("target_personas") {
            None | Some(Value::Null) => (true, true),
            Some(Value::Array(personas)) => {
                let mut flags = (false, false);
                for persona in personas {
                    match persona.as_str().map(str::to_ascii_lowercase).as_deref() {
                        Some("sde") => flags.0 = true,
                        Some("pm") => flags.1 = true,
                        _ => return Err(format!("unknown persona {}", persona)),
                    }
                }
                flags
            }
            Some(other) => return Err(format!("target_personas must be a list, got {}", other)),
        };

        let mut out = RunContext::new();
        out.insert("run_sde".to_string(), json!(run_sde));
        out.insert("run_pm".to_string(), json!(run_pm));
        Ok(out)
    }
}

/// Writes `artifacts`: the sorted names of the non-null inputs it was given.
pub struct CollectArtifacts;

#[async_trait]
impl DeterministicStep for CollectArtifacts {
    async fn run(&self, inputs: &RunContext) -> Result<RunContext, String> {
        let present: Vec<&str> = inputs
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, _)| k.as_str())
            .collect();

        let mut out = RunContext::new();
        out.insert("artifacts".to_string(), json!(present));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(pairs: &[(&str, Value)]) -> RunContext {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[tokio::test]
    async fn test_persona_router_defaults_to_both() {
        let out = PersonaRouter.run(&RunContext::new()).await.unwrap();
        assert_eq!(out["run_sde"], json!(true));
        assert_eq!(out["run_pm"], json!(true));
    }

    #[tokio::test]
    async fn test_persona_router_single_persona() {
        let out = PersonaRouter
            .run(&ctx(&[("target_personas", json!(["PM"]))]))
            .await
            .unwrap();
        assert_eq!(out["run_sde"], json!(false));
        assert_eq!(out["run_pm"], json!(true));
    }

    #[tokio::test]
    async fn test_persona_router_rejects_unknown_persona() {
        let err = PersonaRouter
            .run(&ctx(&[("target_personas", json!(["cfo"]))]))
            .await
            .unwrap_err();
        assert!(err.contains("cfo"));

        assert!(PersonaRouter
            .run(&ctx(&[("target_personas", json!("sde"))]))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_collect_artifacts() {
        let out = CollectArtifacts
            .run(&ctx(&[
                ("sde_report", json!("# SDE")),
                ("pm_report", json!(null)),
                ("diagrams", json!(["a.mmd"])),
            ]))
            .await
            .unwrap();
        assert_eq!(out["artifacts"], json!(["diagrams", "sde_report"]));
    }

    #[test]
    fn test_registry_builtins() {
        let registry = StepRegistry::with_builtins();
        assert!(registry.has_step(PERSONA_ROUTER));
        assert!(registry.has_step(COLLECT_ARTIFACTS));
        assert!(registry.get("nope").is_none());
    }
}
