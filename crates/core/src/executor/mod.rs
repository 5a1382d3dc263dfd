//! Single-stage execution and retry policy.
//!
//! The executor runs exactly one attempt of one stage. It never touches the
//! run record; the engine decides what to do with the result.

use crate::agents::base::{AgentError, AgentEvent, ExecutionContext};
use crate::agents::manager::AgentManager;
use crate::error::StageError;
use crate::steps::StepRegistry;
use rd_protocol::config_models::EngineSettings;
use rd_protocol::pipeline_models::{StageDefinition, StageKind};
use rd_protocol::run_models::RunContext;
use std::time::Duration;
use tokio_stream::StreamExt;
use uuid::Uuid;

/// Exponential backoff between attempts of the same stage.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1 for the second attempt).
    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.max(1.0).powi(retry.saturating_sub(1) as i32);
        let millis = (self.initial_delay.as_millis() as f64 * factor)
            .min(self.max_delay.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }

    /// Total attempts allowed for `stage`, honoring its override.
    pub fn max_attempts(&self, stage: &StageDefinition) -> u32 {
        stage.max_retries.unwrap_or(self.max_retries).saturating_add(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&EngineSettings::default())
    }
}

impl From<&EngineSettings> for RetryPolicy {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_delay: Duration::from_millis(settings.backoff_initial_ms),
            max_delay: Duration::from_millis(settings.backoff_max_ms),
            multiplier: settings.backoff_multiplier,
        }
    }
}

/// Outcome of one stage attempt.
#[derive(Debug, Clone)]
pub struct StageAttempt {
    /// Produced context entries, or the classified failure.
    pub result: Result<RunContext, StageError>,
    /// Agent thoughts, tool calls and messages, in order.
    pub transcript: Vec<String>,
}

impl StageAttempt {
    fn failed(error: StageError) -> Self {
        Self {
            result: Err(error),
            transcript: Vec::new(),
        }
    }
}

/// Runs one stage attempt against agents or built-in steps.
#[derive(Clone)]
pub struct StageExecutor {
    agents: AgentManager,
    steps: StepRegistry,
    default_timeout: Duration,
}

impl StageExecutor {
    pub fn new(agents: AgentManager, steps: StepRegistry, default_timeout: Duration) -> Self {
        Self {
            agents,
            steps,
            default_timeout,
        }
    }

    pub fn agents(&self) -> &AgentManager {
        &self.agents
    }

    pub fn steps(&self) -> &StepRegistry {
        &self.steps
    }

    /// Execute `stage` once against `context`.
    ///
    /// Required inputs are checked before anything is invoked, and only the
    /// declared inputs (plus optional inputs that are present) are passed on.
    pub async fn execute(
        &self,
        run_id: Uuid,
        stage: &StageDefinition,
        context: &RunContext,
        attempt: u32,
    ) -> StageAttempt {
        let inputs = match select_inputs(stage, context) {
            Ok(inputs) => inputs,
            Err(e) => return StageAttempt::failed(e),
        };

        let timeout = stage
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        let work = async {
            match stage.kind {
                StageKind::Agent => self.run_agent(run_id, stage, inputs, attempt).await,
                StageKind::Step => self.run_step(stage, &inputs).await,
            }
        };

        let mut outcome = match tokio::time::timeout(timeout, work).await {
            Ok(outcome) => outcome,
            Err(_) => StageAttempt::failed(StageError::StageTimeout {
                stage: stage.name.clone(),
                seconds: timeout.as_secs(),
            }),
        };

        if let Ok(delta) = &outcome.result {
            if let Some(key) = delta.keys().find(|k| !stage.outputs.contains(k)) {
                outcome.result = Err(StageError::OwnershipViolation {
                    stage: stage.name.clone(),
                    key: key.clone(),
                });
            }
        }
        outcome
    }

    async fn run_agent(
        &self,
        run_id: Uuid,
        stage: &StageDefinition,
        inputs: RunContext,
        attempt: u32,
    ) -> StageAttempt {
        let context = ExecutionContext::new(stage.name.clone(), stage.description.clone())
            .with_run_id(run_id)
            .with_inputs(inputs)
            .with_expected_outputs(stage.outputs.clone())
            .with_attempt(attempt);

        let mut transcript = Vec::new();
        let mut stream = match self.agents.execute(stage.target(), &context).await {
            Ok(stream) => stream,
            Err(e) => {
                return StageAttempt {
                    result: Err(classify(&stage.name, e)),
                    transcript,
                }
            }
        };

        let mut delta = RunContext::new();
        let mut message = String::new();
        while let Some(event) = stream.next().await {
            match event {
                Ok(AgentEvent::Thought(text)) => transcript.push(format!("[thought] {}", text)),
                Ok(AgentEvent::ToolCall(tool)) => transcript.push(format!("[tool] {}", tool)),
                Ok(AgentEvent::MessageChunk(chunk)) => message.push_str(&chunk),
                Ok(AgentEvent::Output { key, value }) => {
                    delta.insert(key, value);
                }
                Ok(AgentEvent::Completed) => break,
                Err(e) => {
                    if !message.is_empty() {
                        transcript.push(format!("[message] {}", message));
                    }
                    return StageAttempt {
                        result: Err(classify(&stage.name, e)),
                        transcript,
                    };
                }
            }
        }

        if !message.is_empty() {
            transcript.push(format!("[message] {}", message));
        }
        StageAttempt {
            result: Ok(delta),
            transcript,
        }
    }

    async fn run_step(&self, stage: &StageDefinition, inputs: &RunContext) -> StageAttempt {
        let Some(step) = self.steps.get(stage.target()) else {
            return StageAttempt::failed(StageError::Execution {
                stage: stage.name.clone(),
                message: format!("unknown step '{}'", stage.target()),
            });
        };

        let result = step.run(inputs).await.map_err(|message| StageError::Execution {
            stage: stage.name.clone(),
            message,
        });
        StageAttempt {
            result,
            transcript: Vec::new(),
        }
    }
}

/// The declared input subset of `context`.
pub fn select_inputs(stage: &StageDefinition, context: &RunContext) -> Result<RunContext, StageError> {
    let mut inputs = RunContext::new();
    for key in &stage.inputs {
        let value = context.get(key).ok_or_else(|| StageError::MissingDependency {
            stage: stage.name.clone(),
            key: key.clone(),
        })?;
        inputs.insert(key.clone(), value.clone());
    }
    for key in &stage.optional_inputs {
        if let Some(value) = context.get(key) {
            inputs.insert(key.clone(), value.clone());
        }
    }
    Ok(inputs)
}

fn classify(stage: &str, error: AgentError) -> StageError {
    if error.is_retryable() {
        StageError::Transient {
            stage: stage.to_string(),
            message: error.to_string(),
        }
    } else {
        StageError::Execution {
            stage: stage.to_string(),
            message: error.to_string(),
        }
    }
}
