//! Runtime analysis run models.
//!
//! A [`Run`] is the durable record of one execution of a pipeline against one
//! analysis target. It is persisted after every stage boundary so a restarted
//! process can continue exactly where the previous one stopped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use ts_rs::TS;
use uuid::Uuid;

/// Accumulated stage outputs, keyed by context key.
///
/// A `BTreeMap` keeps serialization deterministic, which the router relies on
/// for reproducible decisions over a persisted snapshot.
pub type RunContext = BTreeMap<String, serde_json::Value>;

/// Context key holding operator instructions added while a run is live.
///
/// Only the controller writes it; stages read it as an optional input.
pub const OPERATOR_NOTES_KEY: &str = "operator_notes";

/// Lifecycle status of a run.
///
/// Normal progression: Pending -> Running -> Completed
///
/// - Paused: suspended at a stage boundary by an operator
/// - Failed: a stage failed permanently
/// - Cancelled: stopped by an operator or by the pause timeout
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, TS)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Run has been created but not started yet.
    Pending,

    /// Run is actively executing stages.
    Running,

    /// Run is suspended between stages.
    Paused,

    /// Run reached the terminal marker of its pipeline.
    Completed,

    /// A stage failed and the run stopped.
    Failed,

    /// The run was cancelled.
    Cancelled,
}

impl RunStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run was cancelled.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, TS)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// An operator issued a cancel request.
    Operator,

    /// The run stayed paused past its deadline.
    PauseTimeout,
}

/// Classification of a permanent stage failure.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, TS)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The pipeline references a stage it does not define.
    UnknownStage,
    /// No route rule matched after a stage completed.
    NoRoute,
    /// A stage wrote a context key it does not own.
    OwnershipViolation,
    /// A required input was absent from the context.
    MissingDependency,
    /// The stage kept exceeding its execution timeout.
    StageTimeout,
    /// The agent kept reporting transient failures.
    Transient,
    /// The agent or step failed permanently.
    Execution,
}

/// Diagnostic record of the failure that stopped a run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct RunFailure {
    /// Stage that was executing when the run failed.
    pub stage: String,

    pub kind: FailureKind,

    pub message: String,

    /// Attempts made for the failing stage, including the last one.
    pub attempts: u32,
}

/// The durable state of a single analysis run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct Run {
    /// Unique identifier, immutable for the lifetime of the run.
    #[ts(type = "string")]
    pub run_id: Uuid,

    /// Name of the pipeline definition driving this run.
    pub pipeline_name: String,

    pub status: RunStatus,

    /// Stage last entered, or about to run.
    pub current_stage: String,

    /// Accumulated outputs of all checkpointed stages.
    #[serde(default)]
    pub context: RunContext,

    /// Stages checkpointed so far, in execution order.
    #[serde(default)]
    pub completed_stages: Vec<String>,

    /// When the pending or active pause was requested.
    #[serde(default)]
    pub pause_requested_at: Option<DateTime<Utc>>,

    /// When a paused run is cancelled automatically.
    #[serde(default)]
    pub pause_deadline: Option<DateTime<Utc>>,

    #[serde(default)]
    pub cancel_reason: Option<CancelReason>,

    #[serde(default)]
    pub failure: Option<RunFailure>,

    /// Incremented on every durable write; used for compare-and-swap.
    #[serde(default)]
    pub revision: u64,

    /// Sequence number of the last progress event committed with this record.
    #[serde(default)]
    pub last_sequence: u64,

    /// Terminal run this one was restarted from.
    #[serde(default)]
    #[ts(type = "string | null")]
    pub restarted_from: Option<Uuid>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Run {
    /// Create a pending run positioned at `entry_stage`.
    pub fn new(pipeline_name: impl Into<String>, entry_stage: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            pipeline_name: pipeline_name.into(),
            status: RunStatus::Pending,
            current_stage: entry_stage.into(),
            context: RunContext::new(),
            completed_stages: Vec::new(),
            pause_requested_at: None,
            pause_deadline: None,
            cancel_reason: None,
            failure: None,
            revision: 0,
            last_sequence: 0,
            restarted_from: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// A pause was requested while a stage was in flight and has not been applied yet.
    pub fn has_pending_pause(&self) -> bool {
        self.status == RunStatus::Running && self.pause_requested_at.is_some()
    }
}
