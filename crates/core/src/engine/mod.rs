//! Orchestration engine.
//!
//! The engine drives a run one stage at a time. Each *tick* runs under the
//! run's driver lease:
//!
//! 1. Load the run; a terminal run is left alone.
//! 2. Apply a pending pause, or check the deadline of a paused run.
//! 3. Record `stage_started` and execute the current stage.
//! 4. On success merge the output, route, and checkpoint the context together
//!    with the next stage. Retryable failures are retried with backoff; any
//!    other failure fails the run.
//!
//! The lease is renewed on a heartbeat while a stage executes or waits out a
//! retry backoff, and every commit made during a tick is fenced on it: a
//! driver whose lease was taken over gets [`EngineError::LeaseLost`] and
//! its work is dropped.
//!
//! Because every tick starts from the persisted record, [`OrchestrationEngine::drive`]
//! can be re-invoked after a restart and continues at `current_stage`
//! without replaying checkpointed stages.

use crate::agents::manager::AgentManager;
use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::control::PauseController;
use crate::error::{EngineError, EngineResult, StageError};
use crate::executor::{RetryPolicy, StageExecutor};
use crate::pipeline::{self, Router};
use crate::progress::{EventStream, ProgressEmitter};
use crate::state::run::{self, Applied};
use crate::steps::StepRegistry;
use crate::store::{NewEvent, RunStore, StoreError};
use rd_protocol::config_models::EngineSettings;
use rd_protocol::pipeline_models::{PipelineDefinition, StageDefinition};
use rd_protocol::run_models::{Run, RunContext, RunStatus};
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Where a call to [`OrchestrationEngine::drive`] left the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveOutcome {
    Completed,
    Failed,
    Cancelled,
    /// The run is suspended; drive it again after a resume or to check the deadline.
    Paused,
}

impl DriveOutcome {
    fn from_status(status: RunStatus) -> Option<Self> {
        match status {
            RunStatus::Completed => Some(Self::Completed),
            RunStatus::Failed => Some(Self::Failed),
            RunStatus::Cancelled => Some(Self::Cancelled),
            RunStatus::Paused => Some(Self::Paused),
            RunStatus::Pending | RunStatus::Running => None,
        }
    }
}

enum Tick {
    Continue,
    Done(DriveOutcome),
}

/// Drives runs of validated pipelines against a [`RunStore`].
pub struct OrchestrationEngine {
    store: Arc<dyn RunStore>,
    emitter: ProgressEmitter,
    controller: PauseController,
    executor: StageExecutor,
    pipelines: HashMap<String, PipelineDefinition>,
    settings: EngineSettings,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    worker_id: Uuid,
}

impl OrchestrationEngine {
    /// Create an engine with no pipelines, using the system clock.
    pub fn new(store: Arc<dyn RunStore>, executor: StageExecutor, settings: EngineSettings) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let emitter = ProgressEmitter::new(
            store.clone(),
            Duration::from_millis(settings.poll_interval_ms),
        );
        let controller = PauseController::new(store.clone(), emitter.clone(), clock.clone(), &settings);
        Self {
            store,
            emitter,
            controller,
            executor,
            pipelines: HashMap::new(),
            retry: RetryPolicy::from(&settings),
            settings,
            clock,
            worker_id: Uuid::new_v4(),
        }
    }

    /// Build an engine from a loaded project configuration.
    ///
    /// Agents come from the project's profiles, steps are the built-ins.
    pub fn from_config(
        config: &AppConfig,
        project_root: &Path,
        store: Arc<dyn RunStore>,
    ) -> EngineResult<Self> {
        let settings = config.global.engine.clone();
        let executor = StageExecutor::new(
            AgentManager::from_profiles(&config.agents, project_root),
            StepRegistry::with_builtins(),
            Duration::from_secs(settings.stage_timeout_seconds),
        );
        let mut engine = Self::new(store, executor, settings);
        for definition in &config.pipelines {
            engine.add_pipeline(definition.clone())?;
        }
        Ok(engine)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.controller = PauseController::new(
            self.store.clone(),
            self.emitter.clone(),
            clock.clone(),
            &self.settings,
        );
        self.clock = clock;
        self
    }

    /// Builder form of [`add_pipeline`](Self::add_pipeline).
    pub fn with_pipeline(mut self, definition: PipelineDefinition) -> EngineResult<Self> {
        self.add_pipeline(definition)?;
        Ok(self)
    }

    /// Register a pipeline after checking its structure and bindings.
    pub fn add_pipeline(&mut self, definition: PipelineDefinition) -> EngineResult<()> {
        let agents = self.executor.agents();
        let steps = self.executor.steps();
        pipeline::validate(&definition)
            .and_then(|_| {
                pipeline::validate_bindings(
                    &definition,
                    |name| agents.has_agent(name),
                    |name| steps.has_step(name),
                )
            })
            .map_err(|e| EngineError::InvalidPipeline {
                pipeline: definition.name.clone(),
                reason: e.to_string(),
            })?;
        self.pipelines.insert(definition.name.clone(), definition);
        Ok(())
    }

    pub fn pipeline(&self, name: &str) -> Option<&PipelineDefinition> {
        self.pipelines.get(name)
    }

    /// Registered pipeline names, sorted.
    pub fn pipeline_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pipelines.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn controller(&self) -> &PauseController {
        &self.controller
    }

    pub fn emitter(&self) -> &ProgressEmitter {
        &self.emitter
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Persist a new `pending` run positioned at the pipeline's entry stage.
    pub async fn create_run(&self, pipeline_name: &str) -> EngineResult<Run> {
        let definition = self
            .pipelines
            .get(pipeline_name)
            .ok_or_else(|| EngineError::UnknownPipeline(pipeline_name.to_string()))?;
        let run = Run::new(&definition.name, &definition.entry, self.clock.now());
        self.store.insert(&run).await?;
        tracing::info!(run_id = %run.run_id, pipeline = pipeline_name, "Run created");
        Ok(run)
    }

    /// `pending -> running`, seeding the context. Does not drive.
    pub async fn activate(&self, run_id: Uuid, initial_context: RunContext) -> EngineResult<Run> {
        let applied = self
            .apply(run_id, |run| run::start(run, initial_context.clone()).map(Some))
            .await?;
        tracing::info!(run_id = %run_id, stage = %applied.run.current_stage, "Run started");
        Ok(applied.run)
    }

    /// Continue a cancelled or failed run as a new run.
    ///
    /// The new run starts at the stage the old one stopped on, seeded with
    /// its context and checkpointed stages, and is left `running` but not
    /// driven. The old run is not modified.
    pub async fn restart_run(&self, run_id: Uuid) -> EngineResult<Run> {
        let source = self.get_run(run_id).await?;
        if !self.pipelines.contains_key(&source.pipeline_name) {
            return Err(EngineError::UnknownPipeline(source.pipeline_name));
        }
        let restarted = run::restart_from(&source, self.clock.now())?;
        self.store.insert(&restarted).await?;
        tracing::info!(
            run_id = %restarted.run_id,
            restarted_from = %run_id,
            stage = %restarted.current_stage,
            "Run restarted"
        );
        self.activate(restarted.run_id, source.context).await
    }

    /// Start a pending run and drive it until it finishes or pauses.
    pub async fn start(&self, run_id: Uuid, initial_context: RunContext) -> EngineResult<DriveOutcome> {
        self.activate(run_id, initial_context).await?;
        self.drive(run_id).await
    }

    /// Drive the run until it is terminal or paused.
    ///
    /// Fails fast with [`EngineError::RunLocked`] if another worker holds the
    /// run's lease.
    pub async fn drive(&self, run_id: Uuid) -> EngineResult<DriveOutcome> {
        loop {
            if let Tick::Done(outcome) = self.tick(run_id).await? {
                tracing::debug!(run_id = %run_id, ?outcome, "Drive finished");
                return Ok(outcome);
            }
        }
    }

    pub async fn get_run(&self, run_id: Uuid) -> EngineResult<Run> {
        self.store.load(run_id).await.map_err(not_found)
    }

    pub async fn list_runs(&self) -> EngineResult<Vec<Run>> {
        Ok(self.store.list().await?)
    }

    /// Ordered events of a run from `from_sequence` on. See [`ProgressEmitter::subscribe`].
    pub fn subscribe(&self, run_id: Uuid, from_sequence: u64) -> EventStream {
        self.emitter.subscribe(run_id, from_sequence)
    }

    async fn tick(&self, run_id: Uuid) -> EngineResult<Tick> {
        self.acquire_lease(run_id).await?;
        let result = self.tick_locked(run_id).await;
        if let Err(e) = self.store.release_lease(run_id, self.worker_id).await {
            tracing::warn!(run_id = %run_id, error = %e, "Failed to release lease");
        }
        result
    }

    async fn acquire_lease(&self, run_id: Uuid) -> EngineResult<()> {
        match self.lease(run_id).await? {
            true => Ok(()),
            false => Err(EngineError::RunLocked(run_id)),
        }
    }

    /// Extend a lease this worker already holds.
    async fn renew_lease(&self, run_id: Uuid) -> EngineResult<()> {
        match self.lease(run_id).await? {
            true => Ok(()),
            false => {
                tracing::warn!(run_id = %run_id, worker = %self.worker_id, "Lease taken over by another worker");
                Err(EngineError::LeaseLost(run_id))
            }
        }
    }

    async fn lease(&self, run_id: Uuid) -> EngineResult<bool> {
        let ttl = chrono::Duration::seconds(self.settings.lease_ttl_seconds as i64);
        self.store
            .try_acquire_lease(run_id, self.worker_id, self.clock.now(), ttl)
            .await
            .map(|lease| lease.is_some())
            .map_err(not_found)
    }

    fn renew_interval(&self) -> Duration {
        let third_of_ttl = Duration::from_secs(self.settings.lease_ttl_seconds) / 3;
        Duration::from_millis(self.settings.lease_renew_interval_ms)
            .min(third_of_ttl)
            .max(Duration::from_millis(1))
    }

    /// Await `work` while renewing the lease on `run_id`.
    ///
    /// If a renewal finds the lease taken over, `work` is dropped and
    /// [`EngineError::LeaseLost`] returned.
    async fn holding_lease<T>(&self, run_id: Uuid, work: impl Future<Output = T>) -> EngineResult<T> {
        let period = self.renew_interval();
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(work);

        loop {
            tokio::select! {
                output = &mut work => return Ok(output),
                _ = heartbeat.tick() => self.renew_lease(run_id).await?,
            }
        }
    }

    async fn tick_locked(&self, run_id: Uuid) -> EngineResult<Tick> {
        let mut run = self.get_run(run_id).await?;

        let status = run.status;
        let pause_pending = run.has_pending_pause();
        match status {
            RunStatus::Pending => {
                return Err(EngineError::InvalidTransition {
                    run_id,
                    action: "drive",
                    status,
                })
            }
            RunStatus::Paused => run = self.controller.check_pause_timeout(run_id).await?,
            RunStatus::Running if pause_pending => {
                run = self.controller.apply_pending_pause(run_id).await?
            }
            _ => {}
        }
        if let Some(outcome) = DriveOutcome::from_status(run.status) {
            return Ok(Tick::Done(outcome));
        }

        let definition = self
            .pipelines
            .get(&run.pipeline_name)
            .ok_or_else(|| EngineError::UnknownPipeline(run.pipeline_name.clone()))?;

        match definition.stage(&run.current_stage) {
            Some(stage) => self.run_stage(run_id, definition, stage).await?,
            None => {
                let stage = run.current_stage.clone();
                let error = StageError::UnknownStage(stage.clone());
                tracing::error!(run_id = %run_id, stage = %stage, error = %error, "Run failed");
                let now = self.clock.now();
                self.apply_fenced(run_id, |run| Ok(Some(run::fail(run, &stage, &error, 0, &[], now))))
                    .await?;
            }
        }
        Ok(Tick::Continue)
    }

    /// Run every attempt of `stage` and record the outcome.
    async fn run_stage(
        &self,
        run_id: Uuid,
        definition: &PipelineDefinition,
        stage: &StageDefinition,
    ) -> EngineResult<()> {
        let max_attempts = self.retry.max_attempts(stage);
        let mut attempt = 1;

        loop {
            if attempt > 1 {
                self.renew_lease(run_id).await?;
            }

            let started = self
                .apply_fenced(run_id, |run| Ok(run::begin_attempt(run, &stage.name, attempt, max_attempts)))
                .await?;
            if !started.committed {
                tracing::debug!(run_id = %run_id, stage = %stage.name, "Stage not started; run changed at boundary");
                return Ok(());
            }
            tracing::info!(run_id = %run_id, stage = %stage.name, attempt, max_attempts, "Stage started");

            let outcome = self
                .holding_lease(
                    run_id,
                    self.executor
                        .execute(run_id, stage, &started.run.context, attempt),
                )
                .await?;

            match outcome.result {
                Ok(delta) => {
                    self.checkpoint(run_id, definition, stage, delta, attempt, &outcome.transcript)
                        .await?;
                    return Ok(());
                }
                Err(error) if error.is_retryable() && attempt < max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        run_id = %run_id,
                        stage = %stage.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Stage attempt failed, retrying"
                    );
                    let recorded = self
                        .apply_fenced(run_id, |run| {
                            Ok(run::record_retry(
                                run,
                                &stage.name,
                                attempt,
                                max_attempts,
                                &error,
                                delay,
                                &outcome.transcript,
                            ))
                        })
                        .await?;
                    if !recorded.committed {
                        tracing::debug!(run_id = %run_id, stage = %stage.name, status = %recorded.run.status, "Retry abandoned; run left the stage");
                        return Ok(());
                    }
                    self.holding_lease(run_id, tokio::time::sleep(delay)).await?;
                    attempt += 1;
                }
                Err(error) => {
                    tracing::error!(run_id = %run_id, stage = %stage.name, attempt, error = %error, "Stage failed");
                    let now = self.clock.now();
                    self.apply_fenced(run_id, |run| {
                        Ok(Some(run::fail(run, &stage.name, &error, attempt, &outcome.transcript, now)))
                    })
                    .await?;
                    return Ok(());
                }
            }
        }
    }

    /// Route on the merged context and persist the checkpoint.
    ///
    /// A routing error fails the run with the context as it was before the stage.
    async fn checkpoint(
        &self,
        run_id: Uuid,
        definition: &PipelineDefinition,
        stage: &StageDefinition,
        delta: RunContext,
        attempts: u32,
        transcript: &[String],
    ) -> EngineResult<()> {
        let router = Router::new(definition);
        let now = self.clock.now();
        let mut route_error = None;

        let applied = self
            .apply_fenced(run_id, |run| {
                let mut merged = run.context.clone();
                merged.extend(delta.clone());
                let events = match router.next(&stage.name, &merged) {
                    Ok(next) => {
                        route_error = None;
                        run::checkpoint(run, &stage.name, delta.clone(), &next, attempts, transcript, now)
                    }
                    Err(e) => {
                        let events = run::fail(run, &stage.name, &e, attempts, transcript, now);
                        route_error = Some(e);
                        events
                    }
                };
                Ok(Some(events))
            })
            .await?;

        match (route_error, applied.run.status) {
            (Some(error), _) => {
                tracing::error!(run_id = %run_id, stage = %stage.name, error = %error, "Routing failed");
            }
            (None, RunStatus::Completed) => {
                tracing::info!(run_id = %run_id, stage = %stage.name, "Run completed");
            }
            (None, RunStatus::Running) => {
                tracing::info!(run_id = %run_id, stage = %stage.name, next = %applied.run.current_stage, "Stage completed");
            }
            (None, status) => {
                tracing::warn!(run_id = %run_id, stage = %stage.name, %status, "Stage output discarded");
            }
        }
        Ok(())
    }

    async fn apply<F>(&self, run_id: Uuid, f: F) -> EngineResult<Applied>
    where
        F: FnMut(&mut Run) -> EngineResult<Option<Vec<NewEvent>>>,
    {
        run::apply(self.store.as_ref(), &self.emitter, run_id, self.clock.now(), f).await
    }

    /// [`apply`](Self::apply) as the lease holder of `run_id`.
    async fn apply_fenced<F>(&self, run_id: Uuid, f: F) -> EngineResult<Applied>
    where
        F: FnMut(&mut Run) -> EngineResult<Option<Vec<NewEvent>>>,
    {
        let now = self.clock.now();
        run::apply_as(self.store.as_ref(), &self.emitter, run_id, now, Some(self.worker_id), f).await
    }
}

fn not_found(e: StoreError) -> EngineError {
    match e {
        StoreError::NotFound(id) => EngineError::RunNotFound(id),
        other => EngineError::Store(other),
    }
}
