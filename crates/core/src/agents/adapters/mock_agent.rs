//! Mock agent implementation.
//!
//! Used for agent profiles without a `command` and throughout the tests.

use crate::agents::base::{Agent, AgentError, AgentEvent, AgentStream, ExecutionContext};
use async_trait::async_trait;
use rd_protocol::run_models::RunContext;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Debug)]
enum Script {
    /// Emit a placeholder for every expected output.
    Placeholder,
    /// Emit exactly these outputs.
    Outputs(RunContext),
    /// Replay a fixed event list.
    Events(Vec<Result<AgentEvent, AgentError>>),
    /// Fail permanently.
    Fail(String),
}

#[derive(Clone)]
pub struct MockAgent {
    available: bool,
    script: Script,
    transient_failures: u32,
    delay: Option<Duration>,
    invocations: Arc<Mutex<Vec<ExecutionContext>>>,
}

impl MockAgent {
    pub fn new(available: bool, events: Vec<Result<AgentEvent, AgentError>>) -> Self {
        Self::with_script(available, Script::Events(events))
    }

    fn with_script(available: bool, script: Script) -> Self {
        Self {
            available,
            script,
            transient_failures: 0,
            delay: None,
            invocations: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Produces a placeholder value for each expected output.
    pub fn success() -> Self {
        Self::with_script(true, Script::Placeholder)
    }

    /// Produces exactly `outputs`, regardless of what the stage expects.
    pub fn with_outputs(outputs: RunContext) -> Self {
        Self::with_script(true, Script::Outputs(outputs))
    }

    pub fn unavailable() -> Self {
        Self::with_script(false, Script::Events(Vec::new()))
    }

    pub fn failing() -> Self {
        Self::with_script(true, Script::Fail("Mock failure".to_string()))
    }

    /// Fail the first `n` invocations with a transient error.
    pub fn flaky(mut self, n: u32) -> Self {
        self.transient_failures = n;
        self
    }

    /// Sleep before answering.
    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of times `execute` was called.
    pub fn calls(&self) -> usize {
        self.lock_invocations().len()
    }

    /// Contexts received so far, oldest first.
    pub fn invocations(&self) -> Vec<ExecutionContext> {
        self.lock_invocations().clone()
    }

    fn lock_invocations(&self) -> std::sync::MutexGuard<'_, Vec<ExecutionContext>> {
        self.invocations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn script_events(&self, context: &ExecutionContext) -> Vec<Result<AgentEvent, AgentError>> {
        let thought = Ok(AgentEvent::Thought(format!(
            "Mock agent working on '{}'",
            context.stage
        )));
        match &self.script {
            Script::Placeholder => {
                let mut events = vec![thought];
                events.extend(context.expected_outputs.iter().map(|key| {
                    Ok(AgentEvent::Output {
                        key: key.clone(),
                        value: serde_json::json!({ "placeholder": true, "stage": context.stage }),
                    })
                }));
                events.push(Ok(AgentEvent::Completed));
                events
            }
            Script::Outputs(outputs) => {
                let mut events = vec![thought];
                events.extend(outputs.iter().map(|(key, value)| {
                    Ok(AgentEvent::Output {
                        key: key.clone(),
                        value: value.clone(),
                    })
                }));
                events.push(Ok(AgentEvent::Completed));
                events
            }
            Script::Events(events) => events.clone(),
            Script::Fail(message) => vec![thought, Err(AgentError::ExecutionError(message.clone()))],
        }
    }
}

#[async_trait]
impl Agent for MockAgent {
    async fn check_availability(&self) -> bool {
        self.available
    }

    async fn execute(&self, context: &ExecutionContext) -> Result<AgentStream, AgentError> {
        if !self.available {
            return Err(AgentError::NotAvailable("Mock agent not available".to_string()));
        }

        let call = {
            let mut invocations = self.lock_invocations();
            invocations.push(context.clone());
            invocations.len() as u32
        };

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if call <= self.transient_failures {
            let err = AgentError::Transient(format!("Mock transient failure #{}", call));
            return Ok(Box::pin(tokio_stream::iter(vec![Err(err)])));
        }

        Ok(Box::pin(tokio_stream::iter(self.script_events(context))))
    }
}
