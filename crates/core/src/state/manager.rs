//! Run manager for driving many runs concurrently.
//!
//! The RunManager owns one background task per live run. Each task calls
//! [`OrchestrationEngine::drive`] until the run is terminal, parking between
//! polls while the run is paused and backing off while another worker holds
//! the run's lease. A task removes itself from the manager when it stops.
//! Control requests go through the engine's controller and then wake the
//! run's task.

use crate::engine::{DriveOutcome, OrchestrationEngine};
use crate::error::{EngineError, EngineResult};
use crate::progress::EventStream;
use rd_protocol::ipc::{Op, Reply};
use rd_protocol::run_models::{Run, RunContext, RunStatus};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use uuid::Uuid;

struct Driver {
    wake: Arc<Notify>,
    handle: JoinHandle<()>,
}

/// Launches and controls runs in background tasks.
///
/// Runs share nothing but the engine's store, so any number of them proceed
/// in parallel.
pub struct RunManager {
    engine: Arc<OrchestrationEngine>,

    /// Driver task per run, indexed by run id.
    drivers: Arc<Mutex<HashMap<Uuid, Driver>>>,
}

impl RunManager {
    pub fn new(engine: Arc<OrchestrationEngine>) -> Self {
        Self {
            engine,
            drivers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn engine(&self) -> &Arc<OrchestrationEngine> {
        &self.engine
    }

    /// Create a run of `pipeline_name`, start it and drive it in the background.
    ///
    /// # Returns
    ///
    /// The run as persisted when it entered `running`.
    pub async fn start_run(&self, pipeline_name: &str, initial_context: RunContext) -> EngineResult<Run> {
        let run = self.engine.create_run(pipeline_name).await?;
        let run = self.engine.activate(run.run_id, initial_context).await?;
        self.launch(run.run_id).await;
        Ok(run)
    }

    /// Spawn a driver task for `run_id` unless one is already live.
    pub async fn launch(&self, run_id: Uuid) {
        let mut drivers = self.drivers.lock().await;
        if drivers
            .get(&run_id)
            .is_some_and(|driver| !driver.handle.is_finished())
        {
            return;
        }

        // The lock is held until the entry is in, so the task's own removal
        // cannot run first.
        let wake = Arc::new(Notify::new());
        let handle = tokio::spawn(drive_loop(
            Arc::clone(&self.engine),
            Arc::clone(&self.drivers),
            run_id,
            Arc::clone(&wake),
        ));
        drivers.insert(run_id, Driver { wake, handle });
    }

    /// Continue a cancelled or failed run as a new run driven in the background.
    pub async fn restart(&self, run_id: Uuid) -> EngineResult<Run> {
        let run = self.engine.restart_run(run_id).await?;
        self.launch(run.run_id).await;
        Ok(run)
    }

    /// Add an operator note; stages started from now on can read it.
    pub async fn add_context(&self, run_id: Uuid, text: &str, scope: Option<&str>) -> EngineResult<Run> {
        self.engine.controller().add_context(run_id, text, scope).await
    }

    /// Pause a running run at its next stage boundary.
    pub async fn pause(&self, run_id: Uuid, timeout_minutes: Option<u64>) -> EngineResult<Run> {
        let run = self.engine.controller().request_pause(run_id, timeout_minutes).await?;
        self.wake(run_id).await;
        Ok(run)
    }

    /// Resume a paused run; its driver continues from the current stage.
    pub async fn resume(&self, run_id: Uuid) -> EngineResult<Run> {
        let result = self.engine.controller().request_resume(run_id).await;
        self.wake(run_id).await;
        let run = result?;
        self.launch(run_id).await;
        Ok(run)
    }

    /// Cancel a run. A stage in flight finishes but its output is discarded.
    pub async fn cancel(&self, run_id: Uuid) -> EngineResult<Run> {
        let run = self.engine.controller().request_cancel(run_id).await?;
        self.wake(run_id).await;
        Ok(run)
    }

    async fn wake(&self, run_id: Uuid) {
        if let Some(driver) = self.drivers.lock().await.get(&run_id) {
            driver.wake.notify_one();
        }
    }

    pub async fn get(&self, run_id: Uuid) -> EngineResult<Run> {
        self.engine.get_run(run_id).await
    }

    pub async fn list(&self) -> EngineResult<Vec<Run>> {
        self.engine.list_runs().await
    }

    pub fn subscribe(&self, run_id: Uuid, from_sequence: u64) -> EventStream {
        self.engine.subscribe(run_id, from_sequence)
    }

    /// Wait until the run is terminal and return its final state.
    ///
    /// A paused run only becomes terminal once it is resumed and finishes,
    /// or is cancelled.
    pub async fn wait(&self, run_id: Uuid) -> EngineResult<Run> {
        let mut events = self.subscribe(run_id, 1);
        while let Some(event) = events.next().await {
            event?;
        }
        self.get(run_id).await
    }

    /// Re-launch drivers for every persisted run that was left running or paused.
    ///
    /// Failed, completed and cancelled runs are never restarted.
    pub async fn recover(&self) -> EngineResult<Vec<Uuid>> {
        let mut recovered = Vec::new();
        for run in self.list().await? {
            if matches!(run.status, RunStatus::Running | RunStatus::Paused) {
                if self.engine.pipeline(&run.pipeline_name).is_none() {
                    tracing::warn!(run_id = %run.run_id, pipeline = %run.pipeline_name, "Skipping run of unknown pipeline");
                    continue;
                }
                tracing::info!(run_id = %run.run_id, status = %run.status, stage = %run.current_stage, "Recovering run");
                self.launch(run.run_id).await;
                recovered.push(run.run_id);
            }
        }
        Ok(recovered)
    }

    /// Number of driver tasks still running.
    pub async fn active_count(&self) -> usize {
        let drivers = self.drivers.lock().await;
        drivers.values().filter(|d| !d.handle.is_finished()).count()
    }

    /// Stop every driver task. Runs stay as persisted and can be recovered.
    pub async fn shutdown(&self) {
        let mut drivers = self.drivers.lock().await;
        for (_, driver) in drivers.drain() {
            driver.handle.abort();
        }
    }

    /// Handle one operator command.
    pub async fn handle_op(&self, op: Op) -> Reply {
        let result = match op {
            Op::StartRun {
                pipeline_name,
                initial_context,
            } => self
                .start_run(&pipeline_name, initial_context)
                .await
                .map(|run| Reply::RunStarted { run_id: run.run_id }),
            Op::PauseRun {
                run_id,
                timeout_minutes,
            } => self.pause(run_id, timeout_minutes).await.map(accepted),
            Op::ResumeRun { run_id } => self.resume(run_id).await.map(accepted),
            Op::CancelRun { run_id } => self.cancel(run_id).await.map(accepted),
            Op::AddContext {
                run_id,
                text,
                scope,
            } => self
                .add_context(run_id, &text, scope.as_deref())
                .await
                .map(accepted),
            Op::RestartRun { run_id } => self
                .restart(run_id)
                .await
                .map(|run| Reply::RunStarted { run_id: run.run_id }),
            Op::GetRun { run_id } => self
                .get(run_id)
                .await
                .map(|run| Reply::RunState { run: Box::new(run) }),
            Op::ListRuns => self.list().await.map(|runs| Reply::Runs { runs }),
        };
        result.unwrap_or_else(|e| Reply::Rejected {
            reason: e.to_string(),
        })
    }
}

fn accepted(run: Run) -> Reply {
    Reply::Accepted {
        run_id: run.run_id,
        status: run.status,
    }
}

async fn drive_loop(
    engine: Arc<OrchestrationEngine>,
    drivers: Arc<Mutex<HashMap<Uuid, Driver>>>,
    run_id: Uuid,
    wake: Arc<Notify>,
) {
    drive_until_settled(&engine, run_id, &wake).await;

    let mut drivers = drivers.lock().await;
    if drivers
        .get(&run_id)
        .is_some_and(|driver| Arc::ptr_eq(&driver.wake, &wake))
    {
        drivers.remove(&run_id);
    }
}

async fn drive_until_settled(engine: &OrchestrationEngine, run_id: Uuid, wake: &Notify) {
    let poll = Duration::from_millis(engine.settings().poll_interval_ms);
    loop {
        match engine.drive(run_id).await {
            Ok(DriveOutcome::Paused) => {
                tokio::select! {
                    _ = wake.notified() => {}
                    _ = tokio::time::sleep(poll) => {}
                }
            }
            Ok(outcome) => {
                tracing::info!(run_id = %run_id, ?outcome, "Run finished");
                return;
            }
            Err(EngineError::RunLocked(_) | EngineError::LeaseLost(_)) => {
                tracing::debug!(run_id = %run_id, "Run is locked by another worker");
                tokio::time::sleep(poll).await;
            }
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "Driver stopped");
                return;
            }
        }
    }
}
