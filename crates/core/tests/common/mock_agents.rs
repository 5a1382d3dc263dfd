//! Scripted agents for deterministic testing.

#![allow(dead_code)]

use async_trait::async_trait;
use rd_core::agents::base::{Agent, AgentError, AgentEvent, AgentStream, ExecutionContext};
use rd_core::agents::MockAgent;
use rd_protocol::run_models::RunContext;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Structure analyst reporting `gap_detected`.
pub fn structure_agent(gap_detected: bool) -> MockAgent {
    MockAgent::with_outputs(outputs(&[
        ("structure", json!({ "modules": ["api", "storage"], "entrypoints": ["main"] })),
        ("gap_detected", json!(gap_detected)),
    ]))
}

pub fn outputs(pairs: &[(&str, Value)]) -> RunContext {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

/// An agent that blocks inside `execute` until released.
///
/// Lets a test act while a stage is in flight: wait for [`entered`](Self::entered),
/// do something, then [`release`](Self::release).
#[derive(Clone)]
pub struct GatedAgent {
    outputs: RunContext,
    entered: Arc<Notify>,
    gate: Arc<Notify>,
    calls: Arc<AtomicUsize>,
}

impl GatedAgent {
    pub fn new(outputs: RunContext) -> Self {
        Self {
            outputs,
            entered: Arc::new(Notify::new()),
            gate: Arc::new(Notify::new()),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Resolves once an invocation is blocked on the gate.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Let the blocked invocation finish.
    pub fn release(&self) {
        self.gate.notify_one();
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for GatedAgent {
    async fn check_availability(&self) -> bool {
        true
    }

    async fn execute(&self, _context: &ExecutionContext) -> Result<AgentStream, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outputs = self.outputs.clone();
        let entered = Arc::clone(&self.entered);
        let gate = Arc::clone(&self.gate);

        let stream = async_stream::stream! {
            entered.notify_one();
            gate.notified().await;
            yield Ok(AgentEvent::Thought("released".to_string()));
            for (key, value) in outputs {
                yield Ok(AgentEvent::Output { key, value });
            }
            yield Ok(AgentEvent::Completed);
        };
        Ok(Box::pin(stream))
    }
}
