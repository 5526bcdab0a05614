//! Batched, non-blocking access tracking.
//!
//! Reads enqueue [`AccessEvent`]s on a bounded channel and return at once. One
//! worker task per store drains the channel, merges events per memory id and
//! writes them through an [`AccessSink`] when the batch fills, when the flush
//! interval elapses, or when asked to flush or shut down.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::traits::AccessSink;
use crate::error::{Error, Result};
use crate::types::{now_ms, AccessEvent, AccessUpdate};

/// Access tracker batching configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Merged events that trigger an immediate write.
    pub batch_size: usize,
    /// Maximum time pending events wait before a write.
    pub flush_interval_ms: u64,
    /// Bounded queue length; events beyond it are dropped.
    pub queue_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            flush_interval_ms: 1_000,
            queue_capacity: 1_024,
        }
    }
}

enum Command {
    Track(AccessEvent),
    Flush(oneshot::Sender<Result<usize>>),
    Shutdown(oneshot::Sender<Result<usize>>),
}

/// Events merged per memory id, in first-enqueue order.
#[derive(Default)]
struct PendingAccess {
    order: Vec<String>,
    updates: HashMap<String, AccessUpdate>,
    events: usize,
}

impl PendingAccess {
    fn push(&mut self, event: AccessEvent) {
        self.merge(AccessUpdate {
            memory_id: event.memory_id,
            count: 1,
            accessed_at: event.timestamp,
            context: event.context,
        });
    }

    fn merge(&mut self, update: AccessUpdate) {
        self.events += update.count.max(0) as usize;
        match self.updates.get_mut(&update.memory_id) {
            Some(existing) => {
                existing.count += update.count;
                if update.accessed_at >= existing.accessed_at {
                    existing.accessed_at = update.accessed_at;
                    existing.context = update.context;
                }
            }
            None => {
                self.order.push(update.memory_id.clone());
                self.updates.insert(update.memory_id.clone(), update);
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn take(&mut self) -> (Vec<AccessUpdate>, usize) {
        let mut updates = std::mem::take(&mut self.updates);
        let batch = std::mem::take(&mut self.order)
            .into_iter()
            .filter_map(|id| updates.remove(&id))
            .collect();
        (batch, std::mem::take(&mut self.events))
    }
}

struct Worker {
    sink: Arc<dyn AccessSink>,
    store_path: PathBuf,
    pending: PendingAccess,
    written: Arc<AtomicU64>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>, config: TrackerConfig) {
        let batch_size = config.batch_size.max(1);
        let mut ticker = interval(Duration::from_millis(config.flush_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Track(event)) => {
                        self.pending.push(event);
                        if self.pending.events >= batch_size {
                            let _ = self.flush().await;
                        }
                    }
                    Some(Command::Flush(reply)) => {
                        let _ = reply.send(self.flush().await);
                    }
                    Some(Command::Shutdown(reply)) => {
                        let _ = reply.send(self.flush().await);
                        break;
                    }
                    None => {
                        let _ = self.flush().await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if !self.pending.is_empty() {
                        let _ = self.flush().await;
                    }
                }
            }
        }

        tracing::debug!(store = %self.store_path.display(), "Access tracker worker stopped");
    }

    /// Write all pending updates. A failed batch goes back into the pending set.
    async fn flush(&mut self) -> Result<usize> {
        if self.pending.is_empty() {
            return Ok(0);
        }

        let (batch, events) = self.pending.take();
        let sink = Arc::clone(&self.sink);
        let outcome = tokio::task::spawn_blocking(move || {
            let result = sink.record_access_batch(&batch);
            (result, batch)
        })
        .await;

        match outcome {
            Ok((Ok(records), _)) => {
                self.written.fetch_add(events as u64, Ordering::Relaxed);
                tracing::debug!(
                    store = %self.store_path.display(),
                    events = events,
                    records = records,
                    "Flushed access batch"
                );
                Ok(events)
            }
            Ok((Err(e), batch)) => {
                tracing::warn!(
                    store = %self.store_path.display(),
                    error = %e,
                    events = events,
                    "Access batch failed, requeueing"
                );
                for update in batch {
                    self.pending.merge(update);
                }
                Err(e)
            }
            Err(join_error) => {
                tracing::error!(error = %join_error, "Access batch writer panicked");
                Err(Error::Other(format!("access batch writer failed: {join_error}")))
            }
        }
    }
}

/// Per-store access tracker.
pub struct AccessTracker {
    store_path: PathBuf,
    tx: mpsc::Sender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
    dropped: AtomicU64,
    written: Arc<AtomicU64>,
}

impl AccessTracker {
    /// Start a tracker on the current tokio runtime.
    pub fn spawn(
        sink: Arc<dyn AccessSink>,
        store_path: &Path,
        config: &TrackerConfig,
    ) -> Result<Self> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::Other("access tracker requires a tokio runtime".to_string()))?;

        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let written = Arc::new(AtomicU64::new(0));
        let worker = Worker {
            sink,
            store_path: store_path.to_path_buf(),
            pending: PendingAccess::default(),
            written: Arc::clone(&written),
        };
        let join = handle.spawn(worker.run(rx, config.clone()));

        tracing::debug!(
            store = %store_path.display(),
            batch_size = config.batch_size,
            flush_interval_ms = config.flush_interval_ms,
            "Started access tracker"
        );

        Ok(Self {
            store_path: store_path.to_path_buf(),
            tx,
            worker: Mutex::new(Some(join)),
            stopped: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            written,
        })
    }

    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    /// Enqueue one read event. Never blocks.
    pub fn track(&self, memory_id: &str, context: &str) {
        if memory_id.trim().is_empty() || self.stopped.load(Ordering::Acquire) {
            return;
        }

        let event = AccessEvent {
            memory_id: memory_id.to_string(),
            timestamp: now_ms(),
            context: context.to_string(),
        };
        match self.tx.try_send(Command::Track(event)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    store = %self.store_path.display(),
                    memory_id = %memory_id,
                    dropped = dropped,
                    "Access queue full, dropping event"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(memory_id = %memory_id, "Access tracker closed, ignoring event");
            }
        }
    }

    /// Enqueue one event per id.
    pub fn track_batch<I, T>(&self, memory_ids: I, context: &str)
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        for id in memory_ids {
            self.track(id.as_ref(), context);
        }
    }

    /// Write everything queued so far. Returns the number of events written.
    pub async fn flush(&self) -> Result<usize> {
        if self.stopped.load(Ordering::Acquire) {
            return Ok(0);
        }
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Flush(reply)).await.is_err() {
            return Ok(0);
        }
        rx.await.unwrap_or(Ok(0))
    }

    /// Drain, flush and stop the worker. Repeat calls are no-ops.
    pub async fn shutdown(&self) -> Result<usize> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(0);
        }

        let (reply, rx) = oneshot::channel();
        let flushed = if self.tx.send(Command::Shutdown(reply)).await.is_ok() {
            rx.await.unwrap_or(Ok(0))
        } else {
            Ok(0)
        };

        let join = self.worker.lock().map_err(|_| Error::LockPoisoned)?.take();
        if let Some(join) = join {
            if let Err(e) = join.await {
                tracing::warn!(error = %e, "Access tracker worker ended abnormally");
            }
        }

        tracing::debug!(store = %self.store_path.display(), "Access tracker shut down");
        flushed
    }

    pub fn is_running(&self) -> bool {
        !self.stopped.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    /// Events dropped because the queue was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Events successfully written so far.
    pub fn written_events(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }
}

/// Process-wide set of trackers, one per store path.
///
/// Owned by whoever owns the runtime (server state, CLI context) and handed to
/// recall callers explicitly.
pub struct TrackerRegistry {
    config: TrackerConfig,
    trackers: Mutex<HashMap<PathBuf, Arc<AccessTracker>>>,
}

impl TrackerRegistry {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            trackers: Mutex::new(HashMap::new()),
        }
    }

    fn key(store_path: &Path) -> PathBuf {
        crate::lock::canonical_store_path(store_path)
    }

    /// Return the live tracker for `store_path`, starting one if needed.
    pub fn get_or_create(
        &self,
        sink: Arc<dyn AccessSink>,
        store_path: &Path,
    ) -> Result<Arc<AccessTracker>> {
        let key = Self::key(store_path);
        let mut trackers = self.trackers.lock().map_err(|_| Error::LockPoisoned)?;

        if let Some(existing) = trackers.get(&key) {
            if existing.is_running() {
                return Ok(Arc::clone(existing));
            }
        }

        let tracker = Arc::new(AccessTracker::spawn(sink, store_path, &self.config)?);
        trackers.insert(key, Arc::clone(&tracker));
        Ok(tracker)
    }

    pub fn get(&self, store_path: &Path) -> Option<Arc<AccessTracker>> {
        let trackers = self.trackers.lock().ok()?;
        trackers.get(&Self::key(store_path)).cloned()
    }

    pub fn len(&self) -> usize {
        self.trackers.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shut down every tracker. Returns the number of events flushed.
    pub async fn shutdown_all(&self) -> Result<usize> {
        let trackers: Vec<Arc<AccessTracker>> = {
            let mut map = self.trackers.lock().map_err(|_| Error::LockPoisoned)?;
            map.drain().map(|(_, tracker)| tracker).collect()
        };

        let mut flushed = 0;
        for tracker in trackers {
            match tracker.shutdown().await {
                Ok(n) => flushed += n,
                Err(e) => tracing::warn!(
                    store = %tracker.store_path().display(),
                    error = %e,
                    "Failed to flush access tracker on shutdown"
                ),
            }
        }
        Ok(flushed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::memory::MemoryStore;
    use crate::types::{MemoryType, NewMemory};

    /// Sink that records every batch it receives.
    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<Vec<AccessUpdate>>>,
        fail: AtomicBool,
    }

    impl AccessSink for RecordingSink {
        fn record_access_batch(&self, updates: &[AccessUpdate]) -> Result<usize> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::Other("sink offline".into()));
            }
            self.batches.lock().unwrap().push(updates.to_vec());
            Ok(updates.len())
        }
    }

    fn slow_config(batch_size: usize) -> TrackerConfig {
        TrackerConfig {
            batch_size,
            flush_interval_ms: 60_000,
            queue_capacity: 1_024,
        }
    }

    #[test]
    fn test_pending_merges_in_enqueue_order() {
        let mut pending = PendingAccess::default();
        for (id, ts) in [("b", 5), ("a", 1), ("b", 9), ("a", 3)] {
            pending.push(AccessEvent {
                memory_id: id.into(),
                timestamp: ts,
                context: "test".into(),
            });
        }

        let (batch, events) = pending.take();
        assert_eq!(events, 4);
        assert_eq!(
            batch,
            vec![
                AccessUpdate { memory_id: "b".into(), count: 2, accessed_at: 9, context: "test".into() },
                AccessUpdate { memory_id: "a".into(), count: 2, accessed_at: 3, context: "test".into() },
            ]
        );
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_batch_size_triggers_write_and_shutdown_flushes_rest() {
        let sink = Arc::new(RecordingSink::default());
        let tracker =
            AccessTracker::spawn(sink.clone(), Path::new("/tmp/tracker-a.db"), &slow_config(10))
                .unwrap();

        for _ in 0..12 {
            tracker.track("m1", "test");
        }
        assert_eq!(tracker.shutdown().await.unwrap(), 2);

        let batches = sink.batches.lock().unwrap().clone();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].count, 10);
        assert_eq!(batches[1][0].count, 2);
        assert_eq!(tracker.written_events(), 12);
    }

    #[tokio::test]
    async fn test_empty_ids_ignored_and_shutdown_idempotent() {
        let sink = Arc::new(RecordingSink::default());
        let tracker =
            AccessTracker::spawn(sink.clone(), Path::new("/tmp/tracker-b.db"), &slow_config(50))
                .unwrap();

        tracker.track_batch(["", "  ", "m1"], "test");
        assert_eq!(tracker.flush().await.unwrap(), 1);

        assert_eq!(tracker.shutdown().await.unwrap(), 0);
        assert_eq!(tracker.shutdown().await.unwrap(), 0);
        assert!(!tracker.is_running());

        // After shutdown tracking is a no-op
        tracker.track("m1", "test");
        assert_eq!(tracker.flush().await.unwrap(), 0);
        assert_eq!(sink.batches.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_interval_flushes_without_batch_fill() {
        let sink = Arc::new(RecordingSink::default());
        let config = TrackerConfig {
            batch_size: 100,
            flush_interval_ms: 20,
            queue_capacity: 16,
        };
        let tracker =
            AccessTracker::spawn(sink.clone(), Path::new("/tmp/tracker-c.db"), &config).unwrap();

        tracker.track("m1", "test");
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(sink.batches.lock().unwrap().len(), 1);
        tracker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_batch_is_requeued() {
        let sink = Arc::new(RecordingSink::default());
        let tracker =
            AccessTracker::spawn(sink.clone(), Path::new("/tmp/tracker-d.db"), &slow_config(50))
                .unwrap();

        sink.fail.store(true, Ordering::SeqCst);
        tracker.track("m1", "test");
        assert!(tracker.flush().await.is_err());

        sink.fail.store(false, Ordering::SeqCst);
        tracker.track("m1", "test");
        assert_eq!(tracker.flush().await.unwrap(), 2);

        let batches = sink.batches.lock().unwrap().clone();
        assert_eq!(batches, vec![vec![AccessUpdate {
            memory_id: "m1".into(),
            count: 2,
            accessed_at: batches[0][0].accessed_at,
            context: "test".into(),
        }]]);
        tracker.shutdown().await.unwrap();
    }

    #[test]
    fn test_access_count_is_exact_against_store() {
        tokio_test::block_on(async {
            let db = Arc::new(Database::open_in_memory().unwrap());
            let id = db.upsert(NewMemory::new("prefers tabs", MemoryType::Preference)).unwrap();
            let tracker =
                AccessTracker::spawn(db.clone(), db.store_path(), &slow_config(7)).unwrap();

            for _ in 0..25 {
                tracker.track(&id, "test");
            }
            tracker.shutdown().await.unwrap();

            let record = db.get_by_id(&id).unwrap().unwrap();
            assert_eq!(record.access_count, 25);
        });
    }

    #[test]
    fn test_spawn_requires_runtime() {
        let sink: Arc<dyn AccessSink> = Arc::new(RecordingSink::default());
        let result = AccessTracker::spawn(sink, Path::new("/tmp/x.db"), &TrackerConfig::default());
        assert!(result.is_err());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Registry Tests
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_registry_shares_tracker_per_path() {
        let registry = TrackerRegistry::new(slow_config(50));
        let sink: Arc<dyn AccessSink> = Arc::new(RecordingSink::default());

        let a = registry.get_or_create(sink.clone(), Path::new("/tmp/reg-a.db")).unwrap();
        let a2 = registry.get_or_create(sink.clone(), Path::new("/tmp/reg-a.db")).unwrap();
        let b = registry.get_or_create(sink.clone(), Path::new("/tmp/reg-b.db")).unwrap();

        assert!(Arc::ptr_eq(&a, &a2));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 2);

        // Another spelling of the same store shares its tracker
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let c = registry.get_or_create(sink.clone(), &dir.path().join("reg.db")).unwrap();
        let c2 = registry
            .get_or_create(sink.clone(), &dir.path().join("sub").join("..").join("reg.db"))
            .unwrap();
        assert!(Arc::ptr_eq(&c, &c2));
        assert_eq!(registry.len(), 3);

        a.track("m1", "test");
        assert_eq!(registry.shutdown_all().await.unwrap(), 1);
        assert!(registry.is_empty());
        assert!(!a.is_running());
    }

    #[tokio::test]
    async fn test_registry_replaces_stopped_tracker() {
        let registry = TrackerRegistry::new(slow_config(50));
        let sink: Arc<dyn AccessSink> = Arc::new(RecordingSink::default());

        let first = registry.get_or_create(sink.clone(), Path::new("/tmp/reg-c.db")).unwrap();
        first.shutdown().await.unwrap();

        let second = registry.get_or_create(sink, Path::new("/tmp/reg-c.db")).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.is_running());
        second.shutdown().await.unwrap();
    }
}
