//! Run lifecycle transitions.
//!
//! Every transition is a plain function over a `&mut Run` that returns the
//! progress events describing it. [`apply`] runs a transition against the
//! store as a read-modify-write: load, mutate, commit with compare-and-swap,
//! and retry from a fresh read on conflict. The events are appended in the
//! same commit as the state change, and a store only exposes events covered
//! by a committed record, so the status field and the event stream never
//! disagree.

use crate::error::{EngineError, EngineResult, StageError};
use crate::progress::ProgressEmitter;
use crate::store::{NewEvent, RunStore, StoreError};
use chrono::{DateTime, Duration, Utc};
use rd_protocol::event_models::{ProgressEvent, ProgressEventType};
use rd_protocol::pipeline_models::NextStage;
use rd_protocol::run_models::{
    CancelReason, Run, RunContext, RunFailure, RunStatus, OPERATOR_NOTES_KEY,
};
use serde_json::json;
use uuid::Uuid;

/// Result of [`apply`].
#[derive(Debug, Clone)]
pub struct Applied {
    /// The run as stored after the transition.
    pub run: Run,
    /// Events appended by the transition.
    pub events: Vec<ProgressEvent>,
    /// Whether anything was written.
    pub committed: bool,
}

/// Run `transition` against the latest stored record until it commits.
///
/// The closure returns `Some(events)` to commit its changes, `None` to leave
/// the run untouched, or an error to abort. It may be called more than once
/// when a concurrent writer wins the compare-and-swap.
pub async fn apply<F>(
    store: &dyn RunStore,
    emitter: &ProgressEmitter,
    run_id: Uuid,
    now: DateTime<Utc>,
    transition: F,
) -> EngineResult<Applied>
where
    F: FnMut(&mut Run) -> EngineResult<Option<Vec<NewEvent>>>,
{
    apply_as(store, emitter, run_id, now, None, transition).await
}

/// [`apply`] for a driver: the commit is rejected with
/// [`EngineError::LeaseLost`] unless `fence` still holds the run's lease.
pub async fn apply_as<F>(
    store: &dyn RunStore,
    emitter: &ProgressEmitter,
    run_id: Uuid,
    now: DateTime<Utc>,
    fence: Option<Uuid>,
    mut transition: F,
) -> EngineResult<Applied>
where
    F: FnMut(&mut Run) -> EngineResult<Option<Vec<NewEvent>>>,
{
    loop {
        let mut run = store.load(run_id).await.map_err(|e| match e {
            StoreError::NotFound(id) => EngineError::RunNotFound(id),
            other => EngineError::Store(other),
        })?;
        let base = run.revision;

        let Some(events) = transition(&mut run)? else {
            return Ok(Applied {
                run,
                events: Vec::new(),
                committed: false,
            });
        };

        run.revision = base;
        run.updated_at = now;
        match store.commit_as(fence, run, events, now).await {
            Ok((run, events)) => {
                emitter.published(&events);
                return Ok(Applied {
                    run,
                    events,
                    committed: true,
                });
            }
            Err(StoreError::Conflict { .. }) => {
                tracing::debug!(run_id = %run_id, "Revision conflict, retrying transition");
            }
            Err(StoreError::LeaseLost { run_id, .. }) => return Err(EngineError::LeaseLost(run_id)),
            Err(e) => return Err(e.into()),
        }
    }
}

fn invalid(run: &Run, action: &'static str) -> EngineError {
    EngineError::InvalidTransition {
        run_id: run.run_id,
        action,
        status: run.status,
    }
}

/// A `log` event.
pub fn log(stage: Option<&str>, level: &str, message: impl Into<String>) -> NewEvent {
    NewEvent::new(
        ProgressEventType::Log,
        json!({ "stage": stage, "level": level, "message": message.into() }),
    )
}

fn transcript_logs<'a>(
    stage: &'a str,
    transcript: &'a [String],
) -> impl Iterator<Item = NewEvent> + 'a {
    transcript
        .iter()
        .map(move |line| log(Some(stage), "info", line.clone()))
}

fn finish(run: &mut Run, status: RunStatus, now: DateTime<Utc>) {
    run.status = status;
    run.completed_at = Some(now);
}

/// `pending -> running` with the ingestion-supplied context.
pub fn start(run: &mut Run, initial_context: RunContext) -> EngineResult<Vec<NewEvent>> {
    if run.status != RunStatus::Pending {
        return Err(invalid(run, "start"));
    }
    run.status = RunStatus::Running;
    run.context = initial_context;
    let keys: Vec<&String> = run.context.keys().collect();
    let message = match run.restarted_from {
        Some(source) => format!(
            "Run restarted from {} at stage '{}' with context {:?}",
            source, run.current_stage, keys
        ),
        None => format!("Run started at stage '{}' with context {:?}", run.current_stage, keys),
    };
    Ok(vec![log(None, "info", message)])
}

/// A new `pending` run that continues where `source` stopped.
///
/// `source` must be cancelled or failed; it is not modified. The new run
/// starts at the stage `source` was on, with its checkpointed stages, and is
/// seeded with `source`'s context when activated.
pub fn restart_from(source: &Run, now: DateTime<Utc>) -> EngineResult<Run> {
    if !matches!(source.status, RunStatus::Cancelled | RunStatus::Failed) {
        return Err(invalid(source, "restart"));
    }
    let mut run = Run::new(&source.pipeline_name, &source.current_stage, now);
    run.completed_stages = source.completed_stages.clone();
    run.restarted_from = Some(source.run_id);
    Ok(run)
}

/// Append an operator instruction to the controller-owned notes key.
///
/// Allowed while the run is pending, running or paused. The context changes
/// between stages only: a stage in flight keeps the inputs it started with.
pub fn add_context(
    run: &mut Run,
    text: &str,
    scope: &str,
    now: DateTime<Utc>,
) -> EngineResult<Vec<NewEvent>> {
    if run.status.is_terminal() {
        return Err(invalid(run, "add context to"));
    }
    let note = json!({ "text": text, "scope": scope, "added_at": now });
    let notes = run
        .context
        .entry(OPERATOR_NOTES_KEY.to_string())
        .or_insert_with(|| json!([]));
    match notes.as_array_mut() {
        Some(list) => list.push(note.clone()),
        None => *notes = json!([note.clone()]),
    }

    let mut event = log(
        Some(&run.current_stage),
        "info",
        format!("Operator context added ({scope})"),
    );
    event.payload["note"] = note;
    Ok(vec![event])
}

/// Record a pause request. The run keeps running until the next boundary.
///
/// # Arguments
///
/// * `timeout` - Time the run may stay paused; `None` disables auto-cancel
pub fn request_pause(
    run: &mut Run,
    timeout: Option<Duration>,
    now: DateTime<Utc>,
) -> EngineResult<Vec<NewEvent>> {
    if run.status != RunStatus::Running || run.has_pending_pause() {
        return Err(invalid(run, "pause"));
    }
    run.pause_requested_at = Some(now);
    run.pause_deadline = timeout.map(|t| now + t);
    Ok(Vec::new())
}

/// Suspend a run whose pause request is pending.
pub fn apply_pause(run: &mut Run) -> Option<Vec<NewEvent>> {
    if !run.has_pending_pause() {
        return None;
    }
    run.status = RunStatus::Paused;
    Some(vec![NewEvent::new(
        ProgressEventType::Paused,
        json!({
            "stage": run.current_stage,
            "requested_at": run.pause_requested_at,
            "deadline": run.pause_deadline,
        }),
    )])
}

/// Whether a paused run has outlived its deadline at `now`.
pub fn pause_expired(run: &Run, now: DateTime<Utc>) -> bool {
    run.status == RunStatus::Paused && run.pause_deadline.is_some_and(|deadline| now > deadline)
}

/// Cancel a paused run whose deadline has elapsed.
///
/// Only a `paused` run can expire, so repeated checks cancel at most once.
pub fn expire_pause(run: &mut Run, now: DateTime<Utc>) -> Option<Vec<NewEvent>> {
    if !pause_expired(run, now) {
        return None;
    }
    Some(cancel_with(run, CancelReason::PauseTimeout, now))
}

/// `paused -> running`, continuing from the unchanged current stage.
pub fn resume(run: &mut Run) -> EngineResult<Vec<NewEvent>> {
    if run.status != RunStatus::Paused {
        return Err(invalid(run, "resume"));
    }
    run.status = RunStatus::Running;
    run.pause_requested_at = None;
    run.pause_deadline = None;
    Ok(vec![NewEvent::new(
        ProgressEventType::Resumed,
        json!({ "stage": run.current_stage }),
    )])
}

/// Operator cancellation from any non-terminal status.
pub fn cancel(run: &mut Run, now: DateTime<Utc>) -> EngineResult<Vec<NewEvent>> {
    if run.status.is_terminal() {
        return Err(invalid(run, "cancel"));
    }
    Ok(cancel_with(run, CancelReason::Operator, now))
}

fn cancel_with(run: &mut Run, reason: CancelReason, now: DateTime<Utc>) -> Vec<NewEvent> {
    finish(run, RunStatus::Cancelled, now);
    run.cancel_reason = Some(reason);
    vec![NewEvent::new(
        ProgressEventType::Cancelled,
        json!({ "stage": run.current_stage, "reason": reason }),
    )]
}

/// Whether `stage` may start on `run` right now.
pub fn can_start_stage(run: &Run, stage: &str) -> bool {
    run.status == RunStatus::Running && !run.has_pending_pause() && run.current_stage == stage
}

/// Record the start of one attempt of the current stage.
///
/// Returns `None` when the run was paused, cancelled or moved on since the
/// caller last looked, in which case the stage must not run.
pub fn begin_attempt(
    run: &mut Run,
    stage: &str,
    attempt: u32,
    max_attempts: u32,
) -> Option<Vec<NewEvent>> {
    if !can_start_stage(run, stage) {
        return None;
    }
    Some(vec![NewEvent::new(
        ProgressEventType::StageStarted,
        json!({ "stage": stage, "attempt": attempt, "max_attempts": max_attempts }),
    )])
}

/// Log a retryable failure. The run record itself is unchanged.
///
/// Returns `None` once the run has left `stage` (cancelled, for instance):
/// no retry will happen, so none is reported.
pub fn record_retry(
    run: &Run,
    stage: &str,
    attempt: u32,
    max_attempts: u32,
    error: &StageError,
    delay: std::time::Duration,
    transcript: &[String],
) -> Option<Vec<NewEvent>> {
    if run.status != RunStatus::Running || run.current_stage != stage {
        return None;
    }
    let mut events: Vec<NewEvent> = transcript_logs(stage, transcript).collect();
    events.push(log(
        Some(stage),
        "warn",
        format!(
            "Attempt {}/{} failed: {}; retrying in {}ms",
            attempt,
            max_attempts,
            error,
            delay.as_millis()
        ),
    ));
    Some(events)
}

/// Persist a finished stage: merge its output, move to `next`.
///
/// If the run was cancelled while the stage was in flight the output is
/// dropped and only noted in the log.
pub fn checkpoint(
    run: &mut Run,
    stage: &str,
    delta: RunContext,
    next: &NextStage,
    attempts: u32,
    transcript: &[String],
    now: DateTime<Utc>,
) -> Vec<NewEvent> {
    let mut events: Vec<NewEvent> = transcript_logs(stage, transcript).collect();
    let outputs: Vec<String> = delta.keys().cloned().collect();

    if run.status != RunStatus::Running || run.current_stage != stage {
        let mut discarded = log(
            Some(stage),
            "warn",
            format!(
                "Discarded output {:?} of stage '{}': run is {}",
                outputs, stage, run.status
            ),
        );
        // Kept for diagnosis only; never merged into the context.
        discarded.payload["discarded"] = json!(delta);
        events.push(discarded);
        return events;
    }

    run.context.extend(delta);
    run.completed_stages.push(stage.to_string());
    events.push(NewEvent::new(
        ProgressEventType::StageCompleted,
        json!({ "stage": stage, "outputs": outputs, "next": next, "attempts": attempts }),
    ));

    match next {
        NextStage::Stage(name) => run.current_stage = name.clone(),
        NextStage::Terminal(_) => {
            finish(run, RunStatus::Completed, now);
            events.push(NewEvent::new(
                ProgressEventType::Completed,
                json!({ "stages": run.completed_stages }),
            ));
        }
    }
    events
}

/// Fail the run at `stage`, keeping its partial context.
pub fn fail(
    run: &mut Run,
    stage: &str,
    error: &StageError,
    attempts: u32,
    transcript: &[String],
    now: DateTime<Utc>,
) -> Vec<NewEvent> {
    let mut events: Vec<NewEvent> = transcript_logs(stage, transcript).collect();

    if run.status != RunStatus::Running || run.current_stage != stage {
        events.push(log(
            Some(stage),
            "warn",
            format!("Ignored failure of stage '{}' ({}): run is {}", stage, error, run.status),
        ));
        return events;
    }

    finish(run, RunStatus::Failed, now);
    run.failure = Some(RunFailure {
        stage: stage.to_string(),
        kind: error.kind(),
        message: error.to_string(),
        attempts,
    });
    events.push(NewEvent::new(
        ProgressEventType::StageFailed,
        json!({
            "stage": stage,
            "kind": error.kind(),
            "message": error.to_string(),
            "attempts": attempts,
        }),
    ));
    events
}
