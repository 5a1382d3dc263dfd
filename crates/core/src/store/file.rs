//! Filesystem-backed run store.
//!
//! Each run lives in its own directory under the store root:
//!
//! ```text
//! <root>/<run_id>/run.json       current run record
//! <root>/<run_id>/events.jsonl   progress log, one event per line
//! <root>/<run_id>/lease.json     driver lease, if any
//! <root>/<run_id>/.lock          held for the duration of one mutation
//! ```
//!
//! Every mutation takes `.lock` (created with `create_new`, so it works
//! across processes), re-reads the file it is about to change, and writes the
//! replacement through a temp file that is renamed into place.
//!
//! A commit appends its events before it renames the new `run.json` into
//! place, and the record carries the sequence number of its last event. The
//! rename is the commit point: lines past that high-water mark (a torn write,
//! or events of a commit that never reached its rename) are invisible to
//! readers and are overwritten by the next commit.

use super::{make_event, Lease, NewEvent, RunStore, StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rd_protocol::event_models::ProgressEvent;
use rd_protocol::run_models::Run;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration as StdDuration, SystemTime};
use uuid::Uuid;

const RUN_FILE: &str = "run.json";
const EVENTS_FILE: &str = "events.jsonl";
const LEASE_FILE: &str = "lease.json";
const LOCK_FILE: &str = ".lock";

const LOCK_RETRY: StdDuration = StdDuration::from_millis(5);
const LOCK_WAIT: StdDuration = StdDuration::from_secs(10);
/// A lock file older than this was left behind by a crashed writer.
const LOCK_STALE_AFTER: StdDuration = StdDuration::from_secs(30);

/// A [`RunStore`] that persists runs as JSON files.
#[derive(Debug, Clone)]
pub struct FileRunStore {
    root: PathBuf,
}

impl FileRunStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StoreError::Io {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    fn existing_run_dir(&self, run_id: Uuid) -> StoreResult<PathBuf> {
        let dir = self.run_dir(run_id);
        if dir.join(RUN_FILE).is_file() {
            Ok(dir)
        } else {
            Err(StoreError::NotFound(run_id))
        }
    }
}

/// Exclusive hold on a run directory's `.lock` file, released on drop.
struct MutationGuard {
    path: PathBuf,
}

impl MutationGuard {
    async fn acquire(dir: &Path) -> StoreResult<Self> {
        let path = dir.join(LOCK_FILE);
        let started = std::time::Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(Self { path });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if is_stale(&path) {
                        tracing::warn!(path = %path.display(), "Removing stale store lock");
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    if started.elapsed() >= LOCK_WAIT {
                        return Err(StoreError::LockTimeout(path));
                    }
                    tokio::time::sleep(LOCK_RETRY).await;
                }
                Err(source) => return Err(StoreError::Io { path, source }),
            }
        }
    }
}

impl Drop for MutationGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > LOCK_STALE_AFTER)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> StoreResult<T> {
    let content = fs::read_to_string(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| StoreError::Serde {
        path: path.to_path_buf(),
        source,
    })
}

fn read_json_opt<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    read_json(path).map(Some)
}

/// Replace `path` atomically with the JSON encoding of `value`.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    let content = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Serde {
        path: path.to_path_buf(),
        source,
    })?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(&content).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

fn events_io_err(path: &Path) -> impl Fn(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn read_log(path: &Path) -> StoreResult<Vec<u8>> {
    match fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(source) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// The first `committed` events of the log.
///
/// Only newline-terminated lines count; anything after the committed ones
/// is ignored.
fn read_events(path: &Path, committed: u64) -> StoreResult<Vec<ProgressEvent>> {
    let bytes = read_log(path)?;
    let mut events = Vec::new();
    for line in bytes.split_inclusive(|b| *b == b'\n') {
        if events.len() as u64 >= committed || !line.ends_with(b"\n") {
            break;
        }
        let event = serde_json::from_slice(line).map_err(|source| StoreError::Serde {
            path: path.to_path_buf(),
            source,
        })?;
        events.push(event);
    }
    Ok(events)
}

/// Byte length of the first `committed` lines of the log.
fn committed_len(path: &Path, committed: u64) -> StoreResult<u64> {
    let bytes = read_log(path)?;
    let mut len = 0usize;
    let mut lines = 0u64;
    for line in bytes.split_inclusive(|b| *b == b'\n') {
        if lines == committed {
            break;
        }
        if !line.ends_with(b"\n") {
            break;
        }
        len += line.len();
        lines += 1;
    }
    if lines < committed {
        return Err(StoreError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("event log holds {lines} of {committed} committed events"),
            ),
        });
    }
    Ok(len as u64)
}

/// Write `events` after the first `committed` lines of the log at `path`,
/// numbering them from `committed + 1`.
///
/// Callers must hold the run's [`MutationGuard`].
fn append_events(
    path: &Path,
    run_id: Uuid,
    committed: u64,
    events: Vec<NewEvent>,
    timestamp: DateTime<Utc>,
) -> StoreResult<Vec<ProgressEvent>> {
    if events.is_empty() {
        return Ok(Vec::new());
    }

    let mut buf = String::new();
    let mut appended = Vec::with_capacity(events.len());
    for (offset, NewEvent { event_type, payload }) in events.into_iter().enumerate() {
        let event = make_event(run_id, committed + offset as u64 + 1, event_type, payload, timestamp);
        let line = serde_json::to_string(&event).map_err(|source| StoreError::Serde {
            path: path.to_path_buf(),
            source,
        })?;
        buf.push_str(&line);
        buf.push('\n');
        appended.push(event);
    }

    let io_err = events_io_err(path);
    let keep = committed_len(path, committed)?;
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(&io_err)?;
    file.set_len(keep).map_err(&io_err)?;
    file.seek(SeekFrom::Start(keep)).map_err(&io_err)?;
    file.write_all(buf.as_bytes()).map_err(&io_err)?;
    file.sync_data().map_err(&io_err)?;
    Ok(appended)
}

#[async_trait]
impl RunStore for FileRunStore {
    async fn insert(&self, run: &Run) -> StoreResult<()> {
        let dir = self.run_dir(run.run_id);
        match fs::create_dir(&dir) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(StoreError::AlreadyExists(run.run_id));
            }
            Err(source) => return Err(StoreError::Io { path: dir, source }),
        }
        let _guard = MutationGuard::acquire(&dir).await?;
        write_json_atomic(&dir.join(RUN_FILE), run)
    }

    async fn load(&self, run_id: Uuid) -> StoreResult<Run> {
        let dir = self.existing_run_dir(run_id)?;
        read_json(&dir.join(RUN_FILE))
    }

    async fn commit_as(
        &self,
        fence: Option<Uuid>,
        mut run: Run,
        events: Vec<NewEvent>,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<(Run, Vec<ProgressEvent>)> {
        let dir = self.existing_run_dir(run.run_id)?;
        let _guard = MutationGuard::acquire(&dir).await?;
        if let Some(owner) = fence {
            let held = read_json_opt::<Lease>(&dir.join(LEASE_FILE))?
                .is_some_and(|lease| lease.owner == owner);
            if !held {
                return Err(StoreError::LeaseLost {
                    run_id: run.run_id,
                    owner,
                });
            }
        }

        let path = dir.join(RUN_FILE);
        let stored: Run = read_json(&path)?;
        if stored.revision != run.revision {
            return Err(StoreError::Conflict {
                run_id: run.run_id,
                expected: run.revision,
                actual: stored.revision,
            });
        }

        let appended = append_events(
            &dir.join(EVENTS_FILE),
            run.run_id,
            stored.last_sequence,
            events,
            timestamp,
        )?;
        run.revision += 1;
        run.last_sequence = stored.last_sequence + appended.len() as u64;
        write_json_atomic(&path, &run)?;
        Ok((run, appended))
    }

    async fn list(&self) -> StoreResult<Vec<Run>> {
        let entries = fs::read_dir(&self.root).map_err(|source| StoreError::Io {
            path: self.root.clone(),
            source,
        })?;

        let mut runs = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path().join(RUN_FILE);
            if !path.is_file() {
                continue;
            }
            match read_json::<Run>(&path) {
                Ok(run) => runs.push(run),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable run"),
            }
        }
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }

    async fn events_since(
        &self,
        run_id: Uuid,
        from_sequence: u64,
    ) -> StoreResult<Vec<ProgressEvent>> {
        let dir = self.existing_run_dir(run_id)?;
        // The record is read first: events it does not cover are not committed.
        let run: Run = read_json(&dir.join(RUN_FILE))?;
        let mut events = read_events(&dir.join(EVENTS_FILE), run.last_sequence)?;
        events.retain(|e| e.sequence_number >= from_sequence);
        Ok(events)
    }

    async fn try_acquire_lease(
        &self,
        run_id: Uuid,
        owner: Uuid,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> StoreResult<Option<Lease>> {
        let dir = self.existing_run_dir(run_id)?;
        let _guard = MutationGuard::acquire(&dir).await?;
        let path = dir.join(LEASE_FILE);

        if let Some(current) = read_json_opt::<Lease>(&path)? {
            if current.owner != owner && !current.is_expired(now) {
                return Ok(None);
            }
        }
        let lease = Lease {
            run_id,
            owner,
            expires_at: now + ttl,
        };
        write_json_atomic(&path, &lease)?;
        Ok(Some(lease))
    }

    async fn release_lease(&self, run_id: Uuid, owner: Uuid) -> StoreResult<()> {
        let dir = self.existing_run_dir(run_id)?;
        let _guard = MutationGuard::acquire(&dir).await?;
        let path = dir.join(LEASE_FILE);

        if read_json_opt::<Lease>(&path)?.is_some_and(|l| l.owner == owner) {
            fs::remove_file(&path).map_err(|source| StoreError::Io { path, source })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;
    use rd_protocol::event_models::ProgressEventType;
    use rd_protocol::run_models::RunStatus;
    use tempfile::TempDir;

    fn store() -> (TempDir, FileRunStore) {
        let dir = TempDir::new().unwrap();
        let store = FileRunStore::open(dir.path().join("runs")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_file_store_records() {
        let (_dir, store) = store();
        contract::insert_load_and_swap(&store).await;
    }

    #[tokio::test]
    async fn test_file_store_events() {
        let (_dir, store) = store();
        contract::events_are_numbered_from_one(&store).await;
    }

    #[tokio::test]
    async fn test_file_store_commit() {
        let (_dir, store) = store();
        contract::commit_appends_events_atomically(&store).await;
    }

    #[tokio::test]
    async fn test_file_store_leases() {
        let (_dir, store) = store();
        contract::lease_excludes_second_owner(&store).await;
    }

    #[tokio::test]
    async fn test_file_store_fencing() {
        let (_dir, store) = store();
        contract::fenced_commit_requires_lease(&store).await;
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let (dir, store) = store();
        let run = Run::new("p", "a", Utc::now());
        store.insert(&run).await.unwrap();
        contract::log_event(&store, run.run_id, serde_json::json!({"message": "hi"})).await;
        let stored = store.load(run.run_id).await.unwrap();
        drop(store);

        let reopened = FileRunStore::open(dir.path().join("runs")).unwrap();
        assert_eq!(reopened.load(run.run_id).await.unwrap(), stored);
        let next = contract::log_event(&reopened, run.run_id, serde_json::Value::Null).await;
        assert_eq!(next.sequence_number, 2);
    }

    #[tokio::test]
    async fn test_concurrent_commits_are_gap_free() {
        let (_dir, store) = store();
        let run = Run::new("p", "a", Utc::now());
        store.insert(&run).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let run_id = run.run_id;
            handles.push(tokio::spawn(async move {
                loop {
                    let current = store.load(run_id).await.unwrap();
                    let event = NewEvent::new(ProgressEventType::Log, serde_json::Value::Null);
                    match store.commit(current, vec![event], Utc::now()).await {
                        Ok(_) => return,
                        Err(StoreError::Conflict { .. }) => continue,
                        Err(e) => panic!("commit failed: {e}"),
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let seqs: Vec<u64> = store
            .events_since(run.run_id, 1)
            .await
            .unwrap()
            .iter()
            .map(|e| e.sequence_number)
            .collect();
        assert_eq!(seqs, (1..=8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_failed_event_write_leaves_record_unchanged() {
        let (_dir, store) = store();
        let run = Run::new("p", "a", Utc::now());
        store.insert(&run).await.unwrap();
        let events = store.run_dir(run.run_id).join(EVENTS_FILE);
        fs::create_dir(&events).unwrap();

        let mut done = store.load(run.run_id).await.unwrap();
        done.status = RunStatus::Completed;
        let result = store
            .commit(
                done,
                vec![NewEvent::new(ProgressEventType::Completed, serde_json::json!({}))],
                Utc::now(),
            )
            .await;
        assert!(matches!(result, Err(StoreError::Io { .. })));

        let stored = store.load(run.run_id).await.unwrap();
        assert_eq!(stored.status, RunStatus::Pending);
        assert_eq!(stored.revision, 0);
        assert_eq!(stored.last_sequence, 0);
    }

    #[tokio::test]
    async fn test_uncommitted_tail_is_ignored_and_overwritten() {
        let (_dir, store) = store();
        let run = Run::new("p", "a", Utc::now());
        store.insert(&run).await.unwrap();
        contract::log_event(&store, run.run_id, serde_json::json!({"n": 1})).await;
        contract::log_event(&store, run.run_id, serde_json::json!({"n": 2})).await;

        // A commit that died before its rename, then a torn line.
        let path = store.run_dir(run.run_id).join(EVENTS_FILE);
        let orphan = make_event(
            run.run_id,
            3,
            ProgressEventType::Completed,
            serde_json::json!({}),
            Utc::now(),
        );
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{}", serde_json::to_string(&orphan).unwrap()).unwrap();
        write!(file, "{{\"run_id\":").unwrap();
        drop(file);

        let events = store.events_since(run.run_id, 1).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.event_type == ProgressEventType::Log));

        let next = contract::log_event(&store, run.run_id, serde_json::json!({"n": 3})).await;
        assert_eq!(next.sequence_number, 3);
        assert_eq!(next.event_type, ProgressEventType::Log);

        let events = store.events_since(run.run_id, 1).await.unwrap();
        assert_eq!(
            events.iter().map(|e| e.sequence_number).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        let raw = fs::read_to_string(&path).unwrap();
        assert_eq!(raw.lines().count(), 3);
        assert!(raw.ends_with('\n'));
    }

    #[tokio::test]
    async fn test_stale_lock_is_reclaimed() {
        let (_dir, store) = store();
        let run = Run::new("p", "a", Utc::now());
        store.insert(&run).await.unwrap();

        let lock = store.run_dir(run.run_id).join(LOCK_FILE);
        fs::write(&lock, "999999").unwrap();
        let old = SystemTime::now() - StdDuration::from_secs(120);
        fs::File::options()
            .write(true)
            .open(&lock)
            .unwrap()
            .set_modified(old)
            .unwrap();

        let mut loaded = store.load(run.run_id).await.unwrap();
        loaded.current_stage = "b".into();
        store.compare_and_swap(loaded).await.unwrap();
        assert!(!lock.exists());
    }
}
