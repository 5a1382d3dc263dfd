//! Progress event models.
//!
//! Every state transition of a run is recorded as an immutable
//! [`ProgressEvent`]. Events carry a per-run sequence number that starts at 1
//! and has no gaps, so an observer can reconnect with the last number it saw
//! and continue without duplicates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

/// The kind of transition an event records.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, TS)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEventType {
    /// An attempt of a stage began.
    StageStarted,
    /// A stage finished and its checkpoint was persisted.
    StageCompleted,
    /// A stage failed permanently; the run is failed.
    StageFailed,
    /// The run was suspended at a stage boundary.
    Paused,
    /// A paused run continued.
    Resumed,
    /// The run was cancelled by an operator or by the pause timeout.
    Cancelled,
    /// The run reached the end of its pipeline.
    Completed,
    /// Free-form diagnostic output (agent thoughts, retries, discarded output).
    Log,
}

impl ProgressEventType {
    /// Events that close a run's stream.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::StageFailed | Self::Cancelled | Self::Completed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::StageStarted => "stage_started",
            Self::StageCompleted => "stage_completed",
            Self::StageFailed => "stage_failed",
            Self::Paused => "paused",
            Self::Resumed => "resumed",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
            Self::Log => "log",
        }
    }
}

/// An immutable, ordered record of something that happened to a run.
///
/// Serialized example:
/// ```json
/// {
///   "run_id": "uuid-here",
///   "sequence_number": 3,
///   "event_type": "stage_completed",
///   "payload": { "stage": "structure", "outputs": ["structure", "gap_detected"] },
///   "timestamp": "2026-01-01T00:00:00Z"
/// }
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct ProgressEvent {
    #[ts(type = "string")]
    pub run_id: Uuid,

    /// Strictly increasing, gap-free per run, starting at 1.
    pub sequence_number: u64,

    pub event_type: ProgressEventType,

    pub payload: serde_json::Value,

    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    /// Stage named in the payload, if any.
    pub fn stage(&self) -> Option<&str> {
        self.payload.get("stage").and_then(|v| v.as_str())
    }
}
