//! In-memory run store.

use super::{make_event, Lease, NewEvent, RunStore, StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rd_protocol::event_models::ProgressEvent;
use rd_protocol::run_models::Run;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    runs: HashMap<Uuid, Run>,
    events: HashMap<Uuid, Vec<ProgressEvent>>,
    leases: HashMap<Uuid, Lease>,
}

/// A [`RunStore`] backed by process memory.
///
/// Every operation runs under a single mutex, which makes each one atomic.
#[derive(Default)]
pub struct InMemoryRunStore {
    inner: Mutex<Inner>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn insert(&self, run: &Run) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.runs.contains_key(&run.run_id) {
            return Err(StoreError::AlreadyExists(run.run_id));
        }
        inner.runs.insert(run.run_id, run.clone());
        inner.events.insert(run.run_id, Vec::new());
        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> StoreResult<Run> {
        let inner = self.inner.lock().await;
        inner
            .runs
            .get(&run_id)
            .cloned()
            .ok_or(StoreError::NotFound(run_id))
    }

    async fn commit_as(
        &self,
        fence: Option<Uuid>,
        mut run: Run,
        events: Vec<NewEvent>,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<(Run, Vec<ProgressEvent>)> {
        let mut inner = self.inner.lock().await;
        let Inner {
            runs,
            events: logs,
            leases,
        } = &mut *inner;
        let stored = runs
            .get_mut(&run.run_id)
            .ok_or(StoreError::NotFound(run.run_id))?;
        if let Some(owner) = fence {
            if !leases.get(&run.run_id).is_some_and(|l| l.owner == owner) {
                return Err(StoreError::LeaseLost {
                    run_id: run.run_id,
                    owner,
                });
            }
        }
        if stored.revision != run.revision {
            return Err(StoreError::Conflict {
                run_id: run.run_id,
                expected: run.revision,
                actual: stored.revision,
            });
        }

        let log = logs.entry(run.run_id).or_default();
        let mut appended = Vec::with_capacity(events.len());
        for NewEvent {
            event_type,
            payload,
        } in events
        {
            let event = make_event(run.run_id, log.len() as u64 + 1, event_type, payload, timestamp);
            log.push(event.clone());
            appended.push(event);
        }

        run.revision += 1;
        run.last_sequence = log.len() as u64;
        *stored = run.clone();
        Ok((run, appended))
    }

    async fn list(&self) -> StoreResult<Vec<Run>> {
        let inner = self.inner.lock().await;
        let mut runs: Vec<Run> = inner.runs.values().cloned().collect();
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }

    async fn events_since(
        &self,
        run_id: Uuid,
        from_sequence: u64,
    ) -> StoreResult<Vec<ProgressEvent>> {
        let inner = self.inner.lock().await;
        let log = inner.events.get(&run_id).ok_or(StoreError::NotFound(run_id))?;
        Ok(log
            .iter()
            .filter(|e| e.sequence_number >= from_sequence)
            .cloned()
            .collect())
    }

    async fn try_acquire_lease(
        &self,
        run_id: Uuid,
        owner: Uuid,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> StoreResult<Option<Lease>> {
        let mut inner = self.inner.lock().await;
        if !inner.runs.contains_key(&run_id) {
            return Err(StoreError::NotFound(run_id));
        }
        if let Some(current) = inner.leases.get(&run_id) {
            if current.owner != owner && !current.is_expired(now) {
                return Ok(None);
            }
        }
        let lease = Lease {
            run_id,
            owner,
            expires_at: now + ttl,
        };
        inner.leases.insert(run_id, lease);
        Ok(Some(lease))
    }

    async fn release_lease(&self, run_id: Uuid, owner: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.leases.get(&run_id).is_some_and(|l| l.owner == owner) {
            inner.leases.remove(&run_id);
        }
        Ok(())
    }
}
