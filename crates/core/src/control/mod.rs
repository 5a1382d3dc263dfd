//! Operator control: pause, resume, cancel and context notes.
//!
//! Control requests never interrupt a stage. A pause is recorded on the run
//! and applied at the next stage boundary: by the driver if one holds the
//! lease, immediately otherwise. A cancel takes effect at once; a stage that
//! is still in flight finishes but its output is discarded at checkpoint.
//! Operator notes land in the context right away and are seen by the next
//! stage that starts.

use crate::clock::Clock;
use crate::error::{EngineError, EngineResult};
use crate::progress::ProgressEmitter;
use crate::state::run::{self, Applied};
use crate::store::RunStore;
use chrono::Duration;
use rd_protocol::config_models::EngineSettings;
use rd_protocol::run_models::Run;
use std::sync::Arc;
use uuid::Uuid;

/// Scope of an operator note given without one.
pub const DEFAULT_NOTE_SCOPE: &str = "global";

/// Accepts operator control requests for runs.
#[derive(Clone)]
pub struct PauseController {
    store: Arc<dyn RunStore>,
    emitter: ProgressEmitter,
    clock: Arc<dyn Clock>,
    default_timeout_minutes: u64,
    lease_ttl: Duration,
    owner: Uuid,
}

impl PauseController {
    pub fn new(
        store: Arc<dyn RunStore>,
        emitter: ProgressEmitter,
        clock: Arc<dyn Clock>,
        settings: &EngineSettings,
    ) -> Self {
        Self {
            store,
            emitter,
            clock,
            default_timeout_minutes: settings.pause_timeout_minutes,
            lease_ttl: Duration::seconds(settings.lease_ttl_seconds as i64),
            owner: Uuid::new_v4(),
        }
    }

    /// Ask a running run to pause at its next stage boundary.
    ///
    /// `timeout_minutes` overrides the configured auto-cancel timeout; `0`
    /// disables it. If no driver currently holds the run, the pause is
    /// applied right away.
    pub async fn request_pause(&self, run_id: Uuid, timeout_minutes: Option<u64>) -> EngineResult<Run> {
        let minutes = timeout_minutes.unwrap_or(self.default_timeout_minutes);
        let timeout = (minutes > 0).then(|| Duration::minutes(minutes as i64));
        let now = self.clock.now();

        let requested = self
            .transition(run_id, |run| run::request_pause(run, timeout, now).map(Some))
            .await?;
        tracing::info!(run_id = %run_id, stage = %requested.run.current_stage, timeout_minutes = minutes, "Pause requested");

        let lease = self
            .store
            .try_acquire_lease(run_id, self.owner, now, self.lease_ttl)
            .await?;
        if lease.is_none() {
            tracing::debug!(run_id = %run_id, "Run is being driven; pause deferred to the next boundary");
            return Ok(requested.run);
        }

        let result = self.apply_pending_pause(run_id).await;
        self.store.release_lease(run_id, self.owner).await?;
        result
    }

    /// Continue a paused run from its current stage.
    ///
    /// A run whose pause deadline already elapsed is cancelled instead and
    /// the request fails with `InvalidTransition`.
    pub async fn request_resume(&self, run_id: Uuid) -> EngineResult<Run> {
        let now = self.clock.now();
        let mut expired = false;
        let applied = self
            .transition(run_id, |run| {
                expired = run::pause_expired(run, now);
                if expired {
                    Ok(run::expire_pause(run, now))
                } else {
                    run::resume(run).map(Some)
                }
            })
            .await?;

        if expired {
            tracing::info!(run_id = %run_id, "Pause deadline elapsed before resume; run cancelled");
            return Err(EngineError::InvalidTransition {
                run_id,
                action: "resume",
                status: applied.run.status,
            });
        }
        tracing::info!(run_id = %run_id, stage = %applied.run.current_stage, "Run resumed");
        Ok(applied.run)
    }

    /// Cancel a run in any non-terminal status.
    pub async fn request_cancel(&self, run_id: Uuid) -> EngineResult<Run> {
        let now = self.clock.now();
        let applied = self.transition(run_id, |run| run::cancel(run, now).map(Some)).await?;
        tracing::info!(run_id = %run_id, stage = %applied.run.current_stage, "Run cancelled by operator");
        Ok(applied.run)
    }

    /// Append an operator note to a live run's context.
    ///
    /// `scope` labels what the note is about and defaults to `global`.
    pub async fn add_context(&self, run_id: Uuid, text: &str, scope: Option<&str>) -> EngineResult<Run> {
        let scope = scope.unwrap_or(DEFAULT_NOTE_SCOPE);
        let now = self.clock.now();
        let applied = self
            .transition(run_id, |run| run::add_context(run, text, scope, now).map(Some))
            .await?;
        tracing::info!(run_id = %run_id, scope, "Operator context added");
        Ok(applied.run)
    }

    /// Cancel the run if it is paused past its deadline.
    ///
    /// Safe to call any number of times; the cancellation happens once.
    pub async fn check_pause_timeout(&self, run_id: Uuid) -> EngineResult<Run> {
        let now = self.clock.now();
        let applied = self
            .transition(run_id, |run| Ok(run::expire_pause(run, now)))
            .await?;
        if applied.committed {
            tracing::warn!(run_id = %run_id, stage = %applied.run.current_stage, "Pause timed out; run cancelled");
        }
        Ok(applied.run)
    }

    /// Suspend the run if a pause request is pending.
    ///
    /// Callers must hold the run's lease so no stage is in flight.
    pub async fn apply_pending_pause(&self, run_id: Uuid) -> EngineResult<Run> {
        let applied = self.transition(run_id, |run| Ok(run::apply_pause(run))).await?;
        if applied.committed {
            tracing::info!(run_id = %run_id, stage = %applied.run.current_stage, "Run paused");
        }
        Ok(applied.run)
    }

    async fn transition<F>(&self, run_id: Uuid, f: F) -> EngineResult<Applied>
    where
        F: FnMut(&mut Run) -> EngineResult<Option<Vec<crate::store::NewEvent>>>,
    {
        run::apply(self.store.as_ref(), &self.emitter, run_id, self.clock.now(), f).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::InMemoryRunStore;
    use chrono::Utc;
    use rd_protocol::event_models::ProgressEventType;
    use rd_protocol::run_models::{CancelReason, RunContext, RunStatus, OPERATOR_NOTES_KEY};

    struct Fixture {
        store: Arc<InMemoryRunStore>,
        clock: ManualClock,
        controller: PauseController,
        run_id: Uuid,
    }

    async fn fixture(status_running: bool) -> Fixture {
        let store = Arc::new(InMemoryRunStore::new());
        let clock = ManualClock::new(Utc::now());
        let emitter = ProgressEmitter::new(store.clone(), std::time::Duration::from_millis(10));
        let settings = EngineSettings {
            pause_timeout_minutes: 1,
            ..EngineSettings::default()
        };
        let controller =
            PauseController::new(store.clone(), emitter.clone(), Arc::new(clock.clone()), &settings);

        let run = Run::new("analysis", "structure", clock.now());
        store.insert(&run).await.unwrap();
        if status_running {
            run::apply(store.as_ref(), &emitter, run.run_id, clock.now(), |r| {
                run::start(r, RunContext::new()).map(Some)
            })
            .await
            .unwrap();
        }
        Fixture {
            store,
            clock,
            controller,
            run_id: run.run_id,
        }
    }

    async fn event_types(store: &InMemoryRunStore, run_id: Uuid) -> Vec<ProgressEventType> {
        store
            .events_since(run_id, 1)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }

    #[tokio::test]
    async fn test_pause_applies_immediately_without_driver() {
        let f = fixture(true).await;
        let run = f.controller.request_pause(f.run_id, None).await.unwrap();
        assert_eq!(run.status, RunStatus::Paused);
        assert_eq!(run.pause_deadline, Some(f.clock.now() + Duration::minutes(1)));
        assert_eq!(
            event_types(&f.store, f.run_id).await,
            vec![ProgressEventType::Log, ProgressEventType::Paused]
        );

        // Repeating the request is rejected and changes nothing.
        let err = f.controller.request_pause(f.run_id, None).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTransition {
                action: "pause",
                status: RunStatus::Paused,
                ..
            }
        ));
        assert_eq!(event_types(&f.store, f.run_id).await.len(), 2);
    }

    #[tokio::test]
    async fn test_pause_deferred_while_driver_holds_lease() {
        let f = fixture(true).await;
        let driver = Uuid::new_v4();
        f.store
            .try_acquire_lease(f.run_id, driver, f.clock.now(), Duration::minutes(5))
            .await
            .unwrap()
            .unwrap();

        let run = f.controller.request_pause(f.run_id, Some(0)).await.unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.has_pending_pause());
        assert!(run.pause_deadline.is_none());

        let run = f.controller.apply_pending_pause(f.run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Paused);
    }

    #[tokio::test]
    async fn test_resume_and_wrong_state_requests() {
        let f = fixture(false).await;
        assert!(f.controller.request_pause(f.run_id, None).await.is_err());
        assert!(f.controller.request_resume(f.run_id).await.is_err());

        let f = fixture(true).await;
        assert!(f.controller.request_resume(f.run_id).await.is_err());
        f.controller.request_pause(f.run_id, None).await.unwrap();
        let run = f.controller.request_resume(f.run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.pause_requested_at.is_none());
        assert_eq!(
            event_types(&f.store, f.run_id).await,
            vec![
                ProgressEventType::Log,
                ProgressEventType::Paused,
                ProgressEventType::Resumed
            ]
        );
    }

    #[tokio::test]
    async fn test_late_resume_cancels_instead() {
        let f = fixture(true).await;
        f.controller.request_pause(f.run_id, None).await.unwrap();
        f.clock.advance(Duration::seconds(61));

        let err = f.controller.request_resume(f.run_id).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTransition {
                status: RunStatus::Cancelled,
                ..
            }
        ));
        let run = f.store.load(f.run_id).await.unwrap();
        assert_eq!(run.cancel_reason, Some(CancelReason::PauseTimeout));

        let run = f.controller.check_pause_timeout(f.run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        let cancels = event_types(&f.store, f.run_id)
            .await
            .into_iter()
            .filter(|t| *t == ProgressEventType::Cancelled)
            .count();
        assert_eq!(cancels, 1);
    }

    #[tokio::test]
    async fn test_cancel_from_any_live_status() {
        let f = fixture(false).await;
        let run = f.controller.request_cancel(f.run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(run.cancel_reason, Some(CancelReason::Operator));

        let err = f.controller.request_cancel(f.run_id).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { action: "cancel", .. }));
        assert_eq!(event_types(&f.store, f.run_id).await, vec![ProgressEventType::Cancelled]);
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let f = fixture(true).await;
        let err = f.controller.request_cancel(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, EngineError::RunNotFound(_)));
    }

    #[tokio::test]
    async fn test_add_context_on_live_runs_only() {
        let f = fixture(false).await;
        let run = f.controller.add_context(f.run_id, "look at the CLI", None).await.unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        let notes = run.context[OPERATOR_NOTES_KEY].as_array().unwrap().clone();
        assert_eq!(notes[0]["scope"], serde_json::json!("global"));

        f.controller.request_cancel(f.run_id).await.unwrap();
        let err = f
            .controller
            .add_context(f.run_id, "too late", Some("report"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTransition {
                status: RunStatus::Cancelled,
                ..
            }
        ));
        let run = f.store.load(f.run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(run.context[OPERATOR_NOTES_KEY].as_array().unwrap().len(), 1);
        assert_eq!(
            event_types(&f.store, f.run_id).await,
            vec![ProgressEventType::Log, ProgressEventType::Cancelled]
        );
    }
}
