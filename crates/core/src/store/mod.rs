//! Run state persistence.
//!
//! The [`RunStore`] is the only shared mutable resource between runs. It
//! holds three things per run:
//! - the [`Run`] record, written with compare-and-swap on `revision`
//! - the append-only progress event log, numbered gap-free from 1
//! - the driver lease that keeps a second worker from driving the same run
//!
//! Two implementations are provided: [`InMemoryRunStore`] for tests and
//! embedded use, and [`FileRunStore`] which keeps one directory per run and
//! coordinates separate processes through lock files.

pub mod file;
pub mod memory;

pub use file::FileRunStore;
pub use memory::InMemoryRunStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rd_protocol::event_models::{ProgressEvent, ProgressEventType};
use rd_protocol::run_models::Run;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur while reading or writing run state.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Run {0} not found")]
    NotFound(Uuid),

    #[error("Run {0} already exists")]
    AlreadyExists(Uuid),

    /// The record changed since it was read.
    #[error("Run {run_id} was modified concurrently (expected revision {expected}, found {actual})")]
    Conflict {
        run_id: Uuid,
        expected: u64,
        actual: u64,
    },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to (de)serialize {path}: {source}")]
    Serde {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// A fenced write came from a worker that no longer holds the lease.
    #[error("Worker {owner} does not hold the lease on run {run_id}")]
    LeaseLost { run_id: Uuid, owner: Uuid },

    /// The record mutex could not be taken in time.
    #[error("Timed out waiting for lock {0}")]
    LockTimeout(PathBuf),
}

/// Type alias for Result with StoreError.
pub type StoreResult<T> = Result<T, StoreError>;

/// Ownership of a run's driver slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Lease {
    pub run_id: Uuid,
    pub owner: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// An event to be appended together with a run write.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub event_type: ProgressEventType,
    pub payload: serde_json::Value,
}

impl NewEvent {
    pub fn new(event_type: ProgressEventType, payload: serde_json::Value) -> Self {
        Self {
            event_type,
            payload,
        }
    }
}

/// Durable storage for runs, their event logs and driver leases.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Persist a new run. Fails with `AlreadyExists` on id collision.
    async fn insert(&self, run: &Run) -> StoreResult<()>;

    async fn load(&self, run_id: Uuid) -> StoreResult<Run>;

    /// Write `run` only if the stored revision still equals `run.revision`,
    /// and append `events` in the same critical section.
    ///
    /// With `fence = Some(owner)` the write is also rejected with `LeaseLost`
    /// unless `owner` still holds the run's lease.
    ///
    /// Returns the stored record, whose revision has been incremented and
    /// whose `last_sequence` covers the appended events, and the appended
    /// events with their sequence numbers.
    async fn commit_as(
        &self,
        fence: Option<Uuid>,
        run: Run,
        events: Vec<NewEvent>,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<(Run, Vec<ProgressEvent>)>;

    /// Unfenced [`commit_as`](Self::commit_as).
    async fn commit(
        &self,
        run: Run,
        events: Vec<NewEvent>,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<(Run, Vec<ProgressEvent>)> {
        self.commit_as(None, run, events, timestamp).await
    }

    /// [`commit`](Self::commit) without events.
    async fn compare_and_swap(&self, run: Run) -> StoreResult<Run> {
        let now = run.updated_at;
        let (run, _) = self.commit(run, Vec::new(), now).await?;
        Ok(run)
    }

    async fn list(&self) -> StoreResult<Vec<Run>>;

    /// Events with `sequence_number >= from_sequence`, in order.
    async fn events_since(&self, run_id: Uuid, from_sequence: u64)
        -> StoreResult<Vec<ProgressEvent>>;

    /// Take the driver lease unless a live lease belongs to someone else.
    ///
    /// Re-acquiring a lease already held by `owner` extends it; drivers call
    /// this periodically as a heartbeat.
    async fn try_acquire_lease(
        &self,
        run_id: Uuid,
        owner: Uuid,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> StoreResult<Option<Lease>>;

    /// Release the lease if `owner` still holds it.
    async fn release_lease(&self, run_id: Uuid, owner: Uuid) -> StoreResult<()>;
}

/// Build the event for slot `sequence_number`.
pub(crate) fn make_event(
    run_id: Uuid,
    sequence_number: u64,
    event_type: ProgressEventType,
    payload: serde_json::Value,
    timestamp: DateTime<Utc>,
) -> ProgressEvent {
    ProgressEvent {
        run_id,
        sequence_number,
        event_type,
        payload,
        timestamp,
    }
}

/// Shared contract checks run against every store implementation.
#[cfg(test)]
pub(crate) mod contract {
    use super::*;
    use serde_json::json;

    pub async fn insert_load_and_swap(store: &dyn RunStore) {
        let now = Utc::now();
        let run = Run::new("p", "a", now);
        store.insert(&run).await.unwrap();
        assert!(matches!(
            store.insert(&run).await,
            Err(StoreError::AlreadyExists(_))
        ));

        let mut loaded = store.load(run.run_id).await.unwrap();
        assert_eq!(loaded.revision, 0);
        loaded.current_stage = "b".to_string();
        let stored = store.compare_and_swap(loaded.clone()).await.unwrap();
        assert_eq!(stored.revision, 1);
        assert_eq!(store.load(run.run_id).await.unwrap().current_stage, "b");

        // Writing from the stale copy (revision 0) must be rejected.
        loaded.current_stage = "c".to_string();
        let err = store.compare_and_swap(loaded).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict {
                expected: 0,
                actual: 1,
                ..
            }
        ));

        assert!(matches!(
            store.load(Uuid::new_v4()).await,
            Err(StoreError::NotFound(_))
        ));
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    /// Append one `log` event through a commit of the current record.
    pub async fn log_event(store: &dyn RunStore, run_id: Uuid, payload: serde_json::Value) -> ProgressEvent {
        let run = store.load(run_id).await.unwrap();
        let (_, mut events) = store
            .commit(run, vec![NewEvent::new(ProgressEventType::Log, payload)], Utc::now())
            .await
            .unwrap();
        events.pop().unwrap()
    }

    pub async fn events_are_numbered_from_one(store: &dyn RunStore) {
        let now = Utc::now();
        let run = Run::new("p", "a", now);
        store.insert(&run).await.unwrap();

        for i in 0..3 {
            let event = log_event(store, run.run_id, json!({ "i": i })).await;
            assert_eq!(event.sequence_number, i + 1);
        }
        assert_eq!(store.load(run.run_id).await.unwrap().last_sequence, 3);

        let all = store.events_since(run.run_id, 0).await.unwrap();
        assert_eq!(
            all.iter().map(|e| e.sequence_number).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        let tail = store.events_since(run.run_id, 3).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].payload["i"], 2);
        assert!(store.events_since(run.run_id, 4).await.unwrap().is_empty());
    }

    pub async fn commit_appends_events_atomically(store: &dyn RunStore) {
        let now = Utc::now();
        let run = Run::new("p", "a", now);
        store.insert(&run).await.unwrap();
        log_event(store, run.run_id, json!({})).await;

        let mut loaded = store.load(run.run_id).await.unwrap();
        loaded.current_stage = "b".to_string();
        let (stored, events) = store
            .commit(
                loaded.clone(),
                vec![
                    NewEvent::new(ProgressEventType::StageCompleted, json!({ "stage": "a" })),
                    NewEvent::new(ProgressEventType::StageStarted, json!({ "stage": "b" })),
                ],
                now,
            )
            .await
            .unwrap();
        assert_eq!(stored.revision, 2);
        assert_eq!(stored.last_sequence, 3);
        assert_eq!(
            events.iter().map(|e| e.sequence_number).collect::<Vec<_>>(),
            vec![2, 3]
        );

        // A rejected commit appends nothing.
        let err = store
            .commit(
                loaded,
                vec![NewEvent::new(ProgressEventType::Log, json!({}))],
                now,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        assert_eq!(store.events_since(run.run_id, 1).await.unwrap().len(), 3);
    }

    pub async fn fenced_commit_requires_lease(store: &dyn RunStore) {
        let now = Utc::now();
        let run = Run::new("p", "a", now);
        store.insert(&run).await.unwrap();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let ttl = Duration::seconds(30);
        let event = || vec![NewEvent::new(ProgressEventType::Log, json!({}))];

        // Nobody holds the lease yet.
        let loaded = store.load(run.run_id).await.unwrap();
        let err = store.commit_as(Some(a), loaded.clone(), event(), now).await.unwrap_err();
        assert!(matches!(err, StoreError::LeaseLost { owner, .. } if owner == a));

        store.try_acquire_lease(run.run_id, a, now, ttl).await.unwrap().unwrap();
        let (stored, _) = store.commit_as(Some(a), loaded, event(), now).await.unwrap();

        // b takes the expired lease over; a's late write is fenced off.
        let later = now + Duration::seconds(31);
        store.try_acquire_lease(run.run_id, b, later, ttl).await.unwrap().unwrap();
        let err = store
            .commit_as(Some(a), stored.clone(), event(), later)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LeaseLost { .. }));
        assert_eq!(store.load(run.run_id).await.unwrap().revision, stored.revision);
        assert_eq!(store.events_since(run.run_id, 1).await.unwrap().len(), 1);

        store.commit_as(Some(b), stored, event(), later).await.unwrap();
    }

    pub async fn lease_excludes_second_owner(store: &dyn RunStore) {
        let now = Utc::now();
        let run = Run::new("p", "a", now);
        store.insert(&run).await.unwrap();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let ttl = Duration::seconds(30);

        assert!(store
            .try_acquire_lease(run.run_id, a, now, ttl)
            .await
            .unwrap()
            .is_some());
        assert!(store
            .try_acquire_lease(run.run_id, b, now, ttl)
            .await
            .unwrap()
            .is_none());

        // Expired leases can be taken over.
        let later = now + Duration::seconds(31);
        let lease = store
            .try_acquire_lease(run.run_id, b, later, ttl)
            .await
            .unwrap()
            .expect("expired lease should be taken over");
        assert_eq!(lease.owner, b);

        // Releasing someone else's lease is a no-op.
        store.release_lease(run.run_id, a).await.unwrap();
        assert!(store
            .try_acquire_lease(run.run_id, a, later, ttl)
            .await
            .unwrap()
            .is_none());

        store.release_lease(run.run_id, b).await.unwrap();
        assert!(store
            .try_acquire_lease(run.run_id, a, later, ttl)
            .await
            .unwrap()
            .is_some());
    }
}
