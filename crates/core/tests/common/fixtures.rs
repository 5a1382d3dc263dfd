//! Test fixtures: pipelines, settings and an engine harness.

#![allow(dead_code)]

use chrono::Utc;
use rd_core::agents::base::Agent;
use rd_core::agents::manager::AgentManager;
use rd_core::clock::ManualClock;
use rd_core::executor::StageExecutor;
use rd_core::steps::StepRegistry;
use rd_core::store::{InMemoryRunStore, RunStore};
use rd_core::OrchestrationEngine;
use rd_protocol::config_models::EngineSettings;
use rd_protocol::event_models::ProgressEvent;
use rd_protocol::pipeline_models::{
    NextStage, PipelineDefinition, RouteCondition, RouteRule, StageDefinition, StageKind,
    TerminalMarker,
};
use rd_protocol::run_models::{Run, RunContext};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub fn agent_stage(name: &str, inputs: &[&str], optional: &[&str], outputs: &[&str]) -> StageDefinition {
    let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    StageDefinition {
        name: name.to_string(),
        kind: StageKind::Agent,
        description: format!("Run the {name} stage"),
        agent: None,
        step: None,
        inputs: strings(inputs),
        optional_inputs: strings(optional),
        outputs: strings(outputs),
        timeout_seconds: None,
        max_retries: None,
    }
}

pub fn route(from: &str, when: Option<RouteCondition>, to: &str) -> RouteRule {
    RouteRule {
        from: from.to_string(),
        when,
        to: if to == "END" {
            NextStage::Terminal(TerminalMarker)
        } else {
            NextStage::stage(to)
        },
    }
}

/// structure -> [web_search if gap_detected] -> sde_report -> pm_report -> END
pub fn analysis_pipeline() -> PipelineDefinition {
    PipelineDefinition {
        name: "analysis".to_string(),
        description: "Repository analysis".to_string(),
        entry: "structure".to_string(),
        stages: vec![
            agent_stage("structure", &["repo_ref"], &[], &["structure", "gap_detected"]),
            agent_stage("web_search", &["structure"], &[], &["web_findings"]),
            agent_stage("sde_report", &["structure"], &["web_findings"], &["sde_report"]),
            agent_stage("pm_report", &["structure"], &["web_findings"], &["pm_report"]),
        ],
        routes: vec![
            route(
                "structure",
                Some(RouteCondition::Truthy("gap_detected".into())),
                "web_search",
            ),
            route("structure", None, "sde_report"),
            route("web_search", None, "sde_report"),
            route("sde_report", None, "pm_report"),
            route("pm_report", None, "END"),
        ],
    }
}

/// Defaults with near-zero backoff, fast polling and a one minute pause timeout.
pub fn fast_settings() -> EngineSettings {
    EngineSettings {
        pause_timeout_minutes: 1,
        max_retries: 3,
        backoff_initial_ms: 1,
        backoff_max_ms: 5,
        poll_interval_ms: 10,
        lease_renew_interval_ms: 10,
        ..EngineSettings::default()
    }
}

pub fn context(pairs: &[(&str, Value)]) -> RunContext {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

pub fn repo_context() -> RunContext {
    context(&[("repo_ref", Value::from("r1"))])
}

/// An engine over a shared store with a manual clock.
pub struct Harness {
    pub store: Arc<dyn RunStore>,
    pub clock: ManualClock,
    pub engine: Arc<OrchestrationEngine>,
}

impl Harness {
    pub fn new(pipeline: PipelineDefinition, agents: Vec<(&str, Arc<dyn Agent>)>) -> Self {
        Self::with_settings(pipeline, agents, fast_settings())
    }

    pub fn with_settings(
        pipeline: PipelineDefinition,
        agents: Vec<(&str, Arc<dyn Agent>)>,
        settings: EngineSettings,
    ) -> Self {
        Self::with_store(
            Arc::new(InMemoryRunStore::new()),
            ManualClock::new(Utc::now()),
            pipeline,
            agents,
            settings,
        )
    }

    pub fn with_store(
        store: Arc<dyn RunStore>,
        clock: ManualClock,
        pipeline: PipelineDefinition,
        agents: Vec<(&str, Arc<dyn Agent>)>,
        settings: EngineSettings,
    ) -> Self {
        let mut manager = AgentManager::new();
        for (name, agent) in agents {
            manager.register(name, agent);
        }
        let executor = StageExecutor::new(manager, StepRegistry::with_builtins(), Duration::from_secs(5));
        let engine = OrchestrationEngine::new(store.clone(), executor, settings)
            .with_clock(Arc::new(clock.clone()))
            .with_pipeline(pipeline)
            .expect("fixture pipeline is valid");
        Self {
            store,
            clock,
            engine: Arc::new(engine),
        }
    }

    pub async fn create(&self, pipeline: &str) -> Uuid {
        self.engine.create_run(pipeline).await.unwrap().run_id
    }

    pub async fn run(&self, run_id: Uuid) -> Run {
        self.engine.get_run(run_id).await.unwrap()
    }

    pub async fn events(&self, run_id: Uuid) -> Vec<ProgressEvent> {
        self.store.events_since(run_id, 1).await.unwrap()
    }
}
