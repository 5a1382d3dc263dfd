//! Base Agent trait and supporting types.

use async_trait::async_trait;
use rd_protocol::run_models::RunContext;
use std::pin::Pin;
use thiserror::Error;
use tokio_stream::Stream;
use uuid::Uuid;

/// Everything an agent receives for one stage attempt.
///
/// `inputs` holds only the context keys the stage declared, never the
/// whole run context.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub run_id: Uuid,

    /// Stage being executed.
    pub stage: String,

    /// The agent's system prompt.
    pub instruction: String,

    /// Declared input subset of the run context.
    pub inputs: RunContext,

    /// Keys the stage is expected to produce.
    pub expected_outputs: Vec<String>,

    /// 1-based attempt number for this stage.
    pub attempt: u32,
}

impl ExecutionContext {
    /// Create a new ExecutionContext for `stage`.
    ///
    /// Defaults:
    /// - run_id: nil
    /// - inputs, expected_outputs: empty
    /// - attempt: 1
    pub fn new(stage: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::nil(),
            stage: stage.into(),
            instruction: instruction.into(),
            inputs: RunContext::new(),
            expected_outputs: Vec::new(),
            attempt: 1,
        }
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn with_inputs(mut self, inputs: RunContext) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_expected_outputs(mut self, outputs: Vec<String>) -> Self {
        self.expected_outputs = outputs;
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Thought(String),
    ToolCall(String),
    MessageChunk(String),
    /// One produced context entry.
    Output {
        key: String,
        value: serde_json::Value,
    },
    Completed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("Agent not available: {0}")]
    NotAvailable(String),
    #[error("API call failed: {0}")]
    ApiError(String),
    #[error("Stream parsing error: {0}")]
    StreamParseError(String),
    #[error("Execution failed: {0}")]
    ExecutionError(String),
    /// The agent reports the failure may clear up on retry.
    #[error("Transient failure: {0}")]
    Transient(String),
}

impl AgentError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::ApiError(_))
    }
}

pub type AgentStream = Pin<Box<dyn Stream<Item = Result<AgentEvent, AgentError>> + Send>>;

/// An external analysis agent.
///
/// Implementations must be safe to invoke again with the same context: the
/// executor retries timed-out and transient attempts.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn check_availability(&self) -> bool;
    async fn execute(&self, context: &ExecutionContext) -> Result<AgentStream, AgentError>;
}
