//! Error types for stage execution and engine operations.

use crate::store::StoreError;
use rd_protocol::run_models::{FailureKind, RunStatus};
use thiserror::Error;
use uuid::Uuid;

/// A failure produced while executing or routing a single stage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StageError {
    /// The pipeline references a stage it does not define.
    #[error("Unknown stage '{0}'")]
    UnknownStage(String),

    /// Route rules exist for the stage but none matched the context.
    #[error("No route matched after stage '{0}'")]
    NoRoute(String),

    /// A stage wrote a key outside its declared outputs.
    #[error("Stage '{stage}' wrote context key '{key}' which it does not own")]
    OwnershipViolation { stage: String, key: String },

    /// A required input was absent before dispatch.
    #[error("Stage '{stage}' requires context key '{key}' which is missing")]
    MissingDependency { stage: String, key: String },

    /// An attempt exceeded the per-stage timeout.
    #[error("Stage '{stage}' exceeded its {seconds}s execution timeout")]
    StageTimeout { stage: String, seconds: u64 },

    /// The agent reported a failure that may succeed when retried.
    #[error("Stage '{stage}' failed transiently: {message}")]
    Transient { stage: String, message: String },

    /// The agent or step failed permanently.
    #[error("Stage '{stage}' failed: {message}")]
    Execution { stage: String, message: String },
}

impl StageError {
    /// Whether the executor may re-invoke the stage.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StageTimeout { .. } | Self::Transient { .. })
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::UnknownStage(_) => FailureKind::UnknownStage,
            Self::NoRoute(_) => FailureKind::NoRoute,
            Self::OwnershipViolation { .. } => FailureKind::OwnershipViolation,
            Self::MissingDependency { .. } => FailureKind::MissingDependency,
            Self::StageTimeout { .. } => FailureKind::StageTimeout,
            Self::Transient { .. } => FailureKind::Transient,
            Self::Execution { .. } => FailureKind::Execution,
        }
    }
}

/// Errors returned to callers of the engine and controller.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Run {0} not found")]
    RunNotFound(Uuid),

    /// Another driver holds the run's lease.
    #[error("Run {0} is being driven by another worker")]
    RunLocked(Uuid),

    /// The driver's lease was taken over while it worked on the run.
    #[error("Lost the lease on run {0} to another worker")]
    LeaseLost(Uuid),

    /// A control request does not apply to the run's current status.
    #[error("Cannot {action} run {run_id} while it is {status}")]
    InvalidTransition {
        run_id: Uuid,
        action: &'static str,
        status: RunStatus,
    },

    #[error("Unknown pipeline '{0}'")]
    UnknownPipeline(String),

    /// The pipeline definition is malformed.
    #[error("Invalid pipeline '{pipeline}': {reason}")]
    InvalidPipeline { pipeline: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Type alias for Result with EngineError.
pub type EngineResult<T> = Result<T, EngineError>;
