//! Operator command protocol.
//!
//! Live observers (a dashboard, the CLI) control runs by sending an [`Op`]
//! and receive a [`Reply`]. Progress itself is not pushed through this
//! channel; observers pull it by subscribing to a run's event log.
//!
//! Uses tagged enum serialization for TypeScript compatibility:
//! ```json
//! {
//!   "type": "pauseRun",
//!   "payload": { "run_id": "uuid-here", "timeout_minutes": 10 }
//! }
//! ```

use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

use crate::run_models::{Run, RunContext, RunStatus};

/// Commands sent from an observer to the engine.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum Op {
    /// Create and start a run of the named pipeline.
    StartRun {
        pipeline_name: String,
        /// Pointers supplied by ingestion (repository reference, personas...).
        initial_context: RunContext,
    },

    /// Suspend a running run at its next stage boundary.
    PauseRun {
        #[ts(type = "string")]
        run_id: Uuid,
        /// Overrides the configured auto-cancel timeout for this pause.
        #[serde(default)]
        timeout_minutes: Option<u64>,
    },

    /// Continue a paused run from its current stage.
    ResumeRun {
        #[ts(type = "string")]
        run_id: Uuid,
    },

    /// Stop a run. An in-flight stage finishes but its output is discarded.
    CancelRun {
        #[ts(type = "string")]
        run_id: Uuid,
    },

    /// Attach an operator instruction to a live run.
    ///
    /// Stored under the controller-owned `operator_notes` context key, which
    /// report stages read as an optional input.
    AddContext {
        #[ts(type = "string")]
        run_id: Uuid,
        text: String,
        /// What the instruction applies to; `global` when omitted.
        #[serde(default)]
        scope: Option<String>,
    },

    /// Start a new run from where a cancelled or failed run stopped.
    RestartRun {
        #[ts(type = "string")]
        run_id: Uuid,
    },

    /// Request the current state of one run.
    GetRun {
        #[ts(type = "string")]
        run_id: Uuid,
    },

    /// Request the state of every known run.
    ListRuns,
}

/// Replies sent from the engine to an observer.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum Reply {
    /// A run was created and its driver launched.
    RunStarted {
        #[ts(type = "string")]
        run_id: Uuid,
    },

    /// A control request was accepted.
    Accepted {
        #[ts(type = "string")]
        run_id: Uuid,
        status: RunStatus,
    },

    /// Snapshot of one run.
    RunState { run: Box<Run> },

    /// Snapshot of all runs.
    Runs { runs: Vec<Run> },

    /// The command was rejected; the run is unchanged.
    Rejected { reason: String },
}
