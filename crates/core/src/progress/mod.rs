//! Progress event emission and subscription.
//!
//! Events live in the run store's append-only log and are appended only as
//! part of a run commit. This module adds a per-run `watch` channel so
//! in-process subscribers wake up as soon as something is appended.
//! Subscribers in other processes fall back to polling the store.

use crate::error::{EngineError, EngineResult};
use crate::store::RunStore;
use async_stream::stream;
use rd_protocol::event_models::ProgressEvent;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio_stream::Stream;
use uuid::Uuid;

pub type EventStream = Pin<Box<dyn Stream<Item = EngineResult<ProgressEvent>> + Send>>;

/// Wakes in-process subscribers and serves ordered, resumable subscriptions.
///
/// Events are only ever appended by store commits; the emitter never writes.
#[derive(Clone)]
pub struct ProgressEmitter {
    store: Arc<dyn RunStore>,
    channels: Arc<Mutex<HashMap<Uuid, watch::Sender<u64>>>>,
    poll_interval: Duration,
}

impl ProgressEmitter {
    pub fn new(store: Arc<dyn RunStore>, poll_interval: Duration) -> Self {
        Self {
            store,
            channels: Arc::new(Mutex::new(HashMap::new())),
            poll_interval,
        }
    }

    /// Wake subscribers for events a store commit just appended.
    ///
    /// The run's channel is dropped once a terminal event is published;
    /// waiting subscribers wake, see the terminal status and finish.
    pub fn published(&self, events: &[ProgressEvent]) {
        let Some(last) = events.last() else {
            return;
        };
        let mut channels = self.lock_channels();
        let Some(sender) = channels.get(&last.run_id) else {
            return;
        };
        sender.send_if_modified(|seen| {
            if last.sequence_number > *seen {
                *seen = last.sequence_number;
                true
            } else {
                false
            }
        });
        if events.iter().any(|e| e.event_type.is_terminal()) {
            channels.remove(&last.run_id);
        }
    }

    fn lock_channels(&self) -> MutexGuard<'_, HashMap<Uuid, watch::Sender<u64>>> {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn receiver(&self, run_id: Uuid) -> watch::Receiver<u64> {
        self.lock_channels()
            .entry(run_id)
            .or_insert_with(|| watch::channel(0).0)
            .subscribe()
    }

    /// Drop the run's channel once nobody listens on it.
    fn release(&self, run_id: Uuid) {
        let mut channels = self.lock_channels();
        if channels
            .get(&run_id)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            channels.remove(&run_id);
        }
    }

    /// Number of runs with a live wake-up channel.
    pub fn channel_count(&self) -> usize {
        self.lock_channels().len()
    }

    /// Events with `sequence_number >= from_sequence`, then every later one.
    ///
    /// The stream is lazy and never holds up the engine. It ends once it has
    /// delivered every event of a run whose status is terminal. Reconnecting
    /// with `from_sequence = last_seen + 1` resumes without gaps or duplicates.
    pub fn subscribe(&self, run_id: Uuid, from_sequence: u64) -> EventStream {
        let store = self.store.clone();
        let emitter = self.clone();
        let mut wake = self.receiver(run_id);
        let poll = self.poll_interval;

        Box::pin(stream! {
            let mut next = from_sequence.max(1);
            loop {
                // Read status before events so a terminal status seen here
                // guarantees its final events are already in the log.
                let finished = match store.load(run_id).await {
                    Ok(run) => run.status.is_terminal(),
                    Err(e) => {
                        drop(wake);
                        emitter.release(run_id);
                        yield Err(EngineError::from(e));
                        return;
                    }
                };

                let batch = match store.events_since(run_id, next).await {
                    Ok(batch) => batch,
                    Err(e) => {
                        drop(wake);
                        emitter.release(run_id);
                        yield Err(EngineError::from(e));
                        return;
                    }
                };
                for event in batch {
                    next = event.sequence_number + 1;
                    yield Ok(event);
                }

                if finished {
                    drop(wake);
                    emitter.release(run_id);
                    return;
                }

                tokio::select! {
                    _ = wake.changed() => {}
                    _ = tokio::time::sleep(poll) => {}
                }
            }
        })
    }
}
