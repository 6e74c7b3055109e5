use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::config::{BackpressurePolicy, Config, ReadQueueConfig};
use crate::db::{ComicFilter, ReadOutcome, Repository};
use crate::error::{AppError, Result};
use crate::models::Comic;
use crate::schedule::{partition_by_ordinal, TodaySelector};

/// Source of read timestamps for the worker.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub user_id: i64,
    pub include_nsfw: bool,
    pub queue: ReadQueueConfig,
}

impl CacheSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            user_id: config.user_id,
            include_nsfw: config.include_nsfw,
            queue: config.read_queue.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued,
    /// The queue was full under [`BackpressurePolicy::Drop`].
    Dropped,
}

/// Counters for what happened to submitted read events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadStats {
    pub applied: u64,
    pub stale: u64,
    pub missing: u64,
    pub dropped: u64,
    /// Write attempts that failed and were tried again.
    pub retries: u64,
}

#[derive(Default)]
struct Counters {
    applied: AtomicU64,
    stale: AtomicU64,
    missing: AtomicU64,
    dropped: AtomicU64,
    retries: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ReadStats {
        ReadStats {
            applied: self.applied.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            missing: self.missing.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

struct Shared {
    repo: Arc<Repository>,
    user_id: i64,
    include_nsfw: bool,
    comics: RwLock<HashMap<i64, Comic>>,
    counters: Counters,
}

#[derive(Clone)]
enum ReadSender {
    Blocking(mpsc::Sender<i64>),
    Dropping(mpsc::Sender<i64>),
    Unbounded(mpsc::UnboundedSender<i64>),
}

enum ReadReceiver {
    Bounded(mpsc::Receiver<i64>),
    Unbounded(mpsc::UnboundedReceiver<i64>),
}

impl ReadReceiver {
    async fn recv(&mut self) -> Option<i64> {
        match self {
            ReadReceiver::Bounded(rx) => rx.recv().await,
            ReadReceiver::Unbounded(rx) => rx.recv().await,
        }
    }
}

fn read_channel(queue: &ReadQueueConfig) -> (ReadSender, ReadReceiver) {
    match queue.policy {
        BackpressurePolicy::Block => {
            let (tx, rx) = mpsc::channel(queue.capacity.max(1));
            (ReadSender::Blocking(tx), ReadReceiver::Bounded(rx))
        }
        BackpressurePolicy::Drop => {
            let (tx, rx) = mpsc::channel(queue.capacity.max(1));
            (ReadSender::Dropping(tx), ReadReceiver::Bounded(rx))
        }
        BackpressurePolicy::Unbounded => {
            let (tx, rx) = mpsc::unbounded_channel();
            (ReadSender::Unbounded(tx), ReadReceiver::Unbounded(rx))
        }
    }
}

/// In-memory copy of the user's active comics plus the queue of read events
/// waiting to be written back.
///
/// Reads are served from the map under a shared lock. Read events are
/// persisted by a single background worker in submission order, which then
/// patches the map; until it gets there the map may show an older
/// `last_read`.
pub struct ReadStateCache {
    shared: Arc<Shared>,
    sender: Mutex<Option<ReadSender>>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ReadStateCache {
    /// Starts the write-back worker on the current tokio runtime.
    pub fn spawn(repo: Arc<Repository>, settings: CacheSettings) -> Self {
        Self::spawn_with_clock(repo, settings, Arc::new(Utc::now))
    }

    pub fn spawn_with_clock(repo: Arc<Repository>, settings: CacheSettings, clock: Clock) -> Self {
        let shared = Arc::new(Shared {
            repo,
            user_id: settings.user_id,
            include_nsfw: settings.include_nsfw,
            comics: RwLock::new(HashMap::new()),
            counters: Counters::default(),
        });

        let (tx, rx) = read_channel(&settings.queue);
        let worker = tokio::spawn(run_worker(Arc::clone(&shared), rx, settings.queue, clock));

        Self {
            shared,
            sender: Mutex::new(Some(tx)),
            worker: tokio::sync::Mutex::new(Some(worker)),
        }
    }

    /// Snapshot of the cached comics keyed by id.
    pub async fn get(&self) -> HashMap<i64, Comic> {
        self.shared.comics.read().await.clone()
    }

    pub async fn comic(&self, comic_id: i64) -> Option<Comic> {
        self.shared.comics.read().await.get(&comic_id).cloned()
    }

    /// Loads the active set from storage if the cache is empty.
    ///
    /// Errors propagate: with nothing cached there is nothing to serve.
    pub async fn refresh(&self) -> Result<()> {
        if !self.shared.comics.read().await.is_empty() {
            return Ok(());
        }

        // The write lock is held across the fetch so the worker cannot patch
        // the map between our read of storage and the swap.
        let mut cached = self.shared.comics.write().await;
        // Another caller may have filled it while we waited for the lock.
        if cached.is_empty() {
            let comics = self.fetch_active().await?;
            tracing::debug!(comics = comics.len(), "Cold-started comic cache");
            *cached = comics;
        }
        Ok(())
    }

    /// Replaces the cached set with a fresh copy from storage.
    pub async fn reload(&self) -> Result<()> {
        let mut cached = self.shared.comics.write().await;
        *cached = self.fetch_active().await?;
        Ok(())
    }

    async fn fetch_active(&self) -> Result<HashMap<i64, Comic>> {
        let comics = self
            .shared
            .repo
            .fetch_all(self.shared.user_id, ComicFilter::active(self.shared.include_nsfw))
            .await
            .inspect_err(|e| tracing::error!("Failed to load comics into cache: {}", e))?;
        Ok(comics.into_iter().map(|c| (c.id, c)).collect())
    }

    /// (due, not due) for the cached comics, keyed by ordinal.
    pub async fn partition_due(
        &self,
        selector: &TodaySelector,
    ) -> (BTreeMap<i64, Comic>, BTreeMap<i64, Comic>) {
        let cached = self.shared.comics.read().await;
        partition_by_ordinal(&cached, selector)
    }

    /// Queues a read event for `comic_id`; persistence happens later.
    pub async fn submit_read(&self, comic_id: i64) -> Result<SubmitOutcome> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(AppError::QueueClosed)?;

        match sender {
            ReadSender::Blocking(tx) => tx
                .send(comic_id)
                .await
                .map(|_| SubmitOutcome::Queued)
                .map_err(|_| AppError::QueueClosed),
            ReadSender::Dropping(tx) => match tx.try_send(comic_id) {
                Ok(()) => Ok(SubmitOutcome::Queued),
                Err(TrySendError::Full(_)) => {
                    self.shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(comic_id, "Read-event queue full, dropping event");
                    Ok(SubmitOutcome::Dropped)
                }
                Err(TrySendError::Closed(_)) => Err(AppError::QueueClosed),
            },
            ReadSender::Unbounded(tx) => tx
                .send(comic_id)
                .map(|_| SubmitOutcome::Queued)
                .map_err(|_| AppError::QueueClosed),
        }
    }

    pub fn stats(&self) -> ReadStats {
        self.shared.counters.snapshot()
    }

    /// Closes the queue, waits for every pending event to be written and
    /// stops the worker. Later submissions fail with `QueueClosed`.
    pub async fn shutdown(&self) -> Result<ReadStats> {
        drop(
            self.sender
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        if let Some(worker) = self.worker.lock().await.take() {
            worker
                .await
                .map_err(|e| anyhow::anyhow!("read-event worker failed: {}", e))?;
        }
        Ok(self.stats())
    }
}

async fn run_worker(shared: Arc<Shared>, mut rx: ReadReceiver, queue: ReadQueueConfig, clock: Clock) {
    while let Some(comic_id) = rx.recv().await {
        let read_at = clock();
        shared.write_back(comic_id, read_at, &queue).await;
    }
    tracing::debug!("Read-event queue closed, worker exiting");
}

impl Shared {
    /// Persists one read event, retrying transient failures, then patches
    /// the cached copy. Never fails: a lost event is counted and logged.
    async fn write_back(&self, comic_id: i64, read_at: DateTime<Utc>, queue: &ReadQueueConfig) {
        let attempts = queue.max_attempts.max(1);

        for attempt in 1..=attempts {
            // A timed-out call may still land later; retrying with the same
            // timestamp is harmless because equal timestamps are accepted.
            let result = tokio::time::timeout(
                queue.write_timeout(),
                self.repo.record_read(comic_id, self.user_id, read_at),
            )
            .await;

            match result {
                Ok(Ok(outcome)) => {
                    self.apply(comic_id, read_at, outcome).await;
                    return;
                }
                Ok(Err(e)) => {
                    tracing::warn!(comic_id, attempt, "Failed to record read: {}", e);
                }
                Err(_) => {
                    tracing::warn!(
                        comic_id,
                        attempt,
                        timeout_secs = queue.write_timeout_secs,
                        "Timed out recording read"
                    );
                }
            }

            if attempt < attempts {
                self.counters.retries.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(queue.retry_backoff()).await;
            }
        }

        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        tracing::error!(comic_id, attempts, "Dropping read event after repeated failures");
    }

    async fn apply(&self, comic_id: i64, read_at: DateTime<Utc>, outcome: ReadOutcome) {
        match outcome {
            ReadOutcome::Applied => {
                let mut cached = self.comics.write().await;
                if let Some(comic) = cached.get_mut(&comic_id) {
                    if comic.last_read < read_at {
                        comic.last_read = read_at;
                    }
                }
                self.counters.applied.fetch_add(1, Ordering::Relaxed);
            }
            ReadOutcome::Stale => {
                self.counters.stale.fetch_add(1, Ordering::Relaxed);
            }
            ReadOutcome::NotFound => {
                self.counters.missing.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(comic_id, user_id = self.user_id, "Read event for unknown comic");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{never_read, NewComic, UpdateSchedule};
    use chrono::{Duration, TimeZone};
    use std::time::Duration as StdDuration;
    use tokio_test::assert_ok;

    const USER: i64 = 1;

    fn settings(queue: ReadQueueConfig) -> CacheSettings {
        CacheSettings {
            user_id: USER,
            include_nsfw: false,
            queue,
        }
    }

    fn fast_queue() -> ReadQueueConfig {
        ReadQueueConfig {
            write_timeout_secs: 2,
            max_attempts: 1,
            retry_backoff_millis: 0,
            ..ReadQueueConfig::default()
        }
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, hour, 0, 0).unwrap()
    }

    /// Hands out the given timestamps in order, then keeps repeating the last.
    fn scripted_clock(times: Vec<DateTime<Utc>>) -> Clock {
        let times = Mutex::new(times);
        Arc::new(move || {
            let mut times = times.lock().unwrap();
            if times.len() > 1 {
                times.remove(0)
            } else {
                times[0]
            }
        })
    }

    async fn repo_with_comics() -> (Arc<Repository>, Vec<i64>) {
        let repo = Repository::open_in_memory().await.unwrap();
        let mut ids = Vec::new();
        for (title, ordinal) in [("alpha", 1), ("beta", 2)] {
            let mut comic = NewComic::new(USER, title, format!("https://{}.example.com", title), ordinal);
            comic.schedule = UpdateSchedule::daily();
            ids.push(repo.insert_comic(comic).await.unwrap());
        }
        let mut hidden = NewComic::new(USER, "hidden", "https://hidden.example.com", 3);
        hidden.nsfw = true;
        repo.insert_comic(hidden).await.unwrap();
        (Arc::new(repo), ids)
    }

    async fn wait_for(cache: &ReadStateCache, done: impl Fn(ReadStats) -> bool) {
        tokio::time::timeout(StdDuration::from_secs(5), async {
            while !done(cache.stats()) {
                tokio::time::sleep(StdDuration::from_millis(10)).await;
            }
        })
        .await
        .expect("worker did not catch up");
    }

    #[tokio::test]
    async fn refresh_fills_an_empty_cache_once() {
        let (repo, ids) = repo_with_comics().await;
        let cache = ReadStateCache::spawn(Arc::clone(&repo), settings(fast_queue()));
        assert!(cache.get().await.is_empty());

        assert_ok!(cache.refresh().await);
        let snapshot = cache.get().await;
        assert_eq!(snapshot.len(), 2, "nsfw comic must be filtered out");
        assert!(snapshot.contains_key(&ids[0]) && snapshot.contains_key(&ids[1]));

        // A warm cache is left alone until reload.
        repo.insert_comic(NewComic::new(USER, "gamma", "https://gamma.example.com", 4))
            .await
            .unwrap();
        cache.refresh().await.unwrap();
        assert_eq!(cache.get().await.len(), 2);
        cache.reload().await.unwrap();
        assert_eq!(cache.get().await.len(), 3);
    }

    #[tokio::test]
    async fn read_events_are_written_back_and_patched_in_memory() {
        let (repo, ids) = repo_with_comics().await;
        let cache = ReadStateCache::spawn_with_clock(
            Arc::clone(&repo),
            settings(fast_queue()),
            scripted_clock(vec![at(9)]),
        );
        cache.refresh().await.unwrap();
        assert_eq!(cache.comic(ids[0]).await.unwrap().last_read, never_read());

        assert_eq!(cache.submit_read(ids[0]).await.unwrap(), SubmitOutcome::Queued);
        let stats = cache.shutdown().await.unwrap();

        assert_eq!(stats.applied, 1);
        assert_eq!(cache.comic(ids[0]).await.unwrap().last_read, at(9));
        let stored = repo.fetch_by_id(ids[0], USER).await.unwrap().unwrap();
        assert_eq!(stored.last_read, at(9));
        // Untouched neighbour.
        assert_eq!(cache.comic(ids[1]).await.unwrap().last_read, never_read());
    }

    #[tokio::test]
    async fn replayed_events_never_move_last_read_backwards() {
        let (repo, ids) = repo_with_comics().await;
        // Second event is stamped earlier than the first, as after a clock step.
        let cache = ReadStateCache::spawn_with_clock(
            Arc::clone(&repo),
            settings(fast_queue()),
            scripted_clock(vec![at(10), at(8)]),
        );
        cache.refresh().await.unwrap();

        cache.submit_read(ids[1]).await.unwrap();
        cache.submit_read(ids[1]).await.unwrap();
        let stats = cache.shutdown().await.unwrap();

        assert_eq!(stats.applied, 1);
        assert_eq!(stats.stale, 1);
        let stored = repo.fetch_by_id(ids[1], USER).await.unwrap().unwrap();
        assert_eq!(stored.last_read, at(10));
        assert_eq!(cache.comic(ids[1]).await.unwrap().last_read, at(10));
    }

    #[tokio::test]
    async fn read_marks_due_comic_as_done_for_today() {
        let (repo, ids) = repo_with_comics().await;
        let now = at(12);
        let cache = ReadStateCache::spawn_with_clock(
            Arc::clone(&repo),
            settings(fast_queue()),
            scripted_clock(vec![now]),
        );
        cache.refresh().await.unwrap();
        let selector = TodaySelector::new(now, &Utc);

        let (due, _) = cache.partition_due(&selector).await;
        assert_eq!(due.len(), 2);

        cache.submit_read(ids[0]).await.unwrap();
        wait_for(&cache, |s| s.applied == 1).await;

        let (due, not_due) = cache.partition_due(&selector).await;
        assert_eq!(due.values().map(|c| c.id).collect::<Vec<_>>(), vec![ids[1]]);
        assert_eq!(not_due[&1].id, ids[0]);
        cache.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_comics_are_counted_and_worker_keeps_going() {
        let (repo, ids) = repo_with_comics().await;
        let cache = ReadStateCache::spawn(Arc::clone(&repo), settings(fast_queue()));

        cache.submit_read(9999).await.unwrap();
        cache.submit_read(ids[0]).await.unwrap();
        let stats = cache.shutdown().await.unwrap();

        assert_eq!(stats.missing, 1);
        assert_eq!(stats.applied, 1);
    }

    #[tokio::test]
    async fn storage_failure_is_logged_and_dropped() {
        let (repo, ids) = repo_with_comics().await;
        let cache = ReadStateCache::spawn(Arc::clone(&repo), settings(fast_queue()));

        repo.execute_batch_for_test("ALTER TABLE feed_entries RENAME TO feed_entries_away;")
            .await
            .unwrap();
        cache.submit_read(ids[0]).await.unwrap();
        wait_for(&cache, |s| s.dropped == 1).await;

        repo.execute_batch_for_test("ALTER TABLE feed_entries_away RENAME TO feed_entries;")
            .await
            .unwrap();
        cache.submit_read(ids[1]).await.unwrap();
        let stats = cache.shutdown().await.unwrap();

        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.applied, 1);
        // The failed event rolled back entirely.
        let first = repo.fetch_by_id(ids[0], USER).await.unwrap().unwrap();
        assert_eq!(first.last_read, never_read());
    }

    #[tokio::test]
    async fn failed_write_succeeds_on_retry() {
        let (repo, ids) = repo_with_comics().await;
        let queue = ReadQueueConfig {
            max_attempts: 2,
            retry_backoff_millis: 500,
            ..fast_queue()
        };
        let cache = ReadStateCache::spawn_with_clock(
            Arc::clone(&repo),
            settings(queue),
            scripted_clock(vec![at(7)]),
        );

        repo.execute_batch_for_test("ALTER TABLE feed_entries RENAME TO feed_entries_away;")
            .await
            .unwrap();
        cache.submit_read(ids[0]).await.unwrap();
        wait_for(&cache, |s| s.retries == 1).await;

        // Storage comes back while the worker is backing off.
        repo.execute_batch_for_test("ALTER TABLE feed_entries_away RENAME TO feed_entries;")
            .await
            .unwrap();
        let stats = cache.shutdown().await.unwrap();

        assert_eq!(stats.applied, 1);
        assert_eq!(stats.dropped, 0);
        assert_eq!(stats.retries, 1);
        let stored = repo.fetch_by_id(ids[0], USER).await.unwrap().unwrap();
        assert_eq!(stored.last_read, at(7));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_write_times_out_and_is_dropped() {
        let (repo, ids) = repo_with_comics().await;
        let queue = ReadQueueConfig {
            write_timeout_secs: 1,
            ..fast_queue()
        };
        let cache = ReadStateCache::spawn(Arc::clone(&repo), settings(queue));

        // Occupy the database thread so the worker's write queues behind it.
        let stall = tokio::spawn({
            let repo = Arc::clone(&repo);
            async move { repo.stall_for_test(StdDuration::from_millis(300)).await }
        });
        tokio::task::yield_now().await;

        cache.submit_read(ids[0]).await.unwrap();
        let stats = cache.shutdown().await.unwrap();

        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.applied, 0);
        assert_ok!(stall.await.unwrap());
    }

    #[tokio::test]
    async fn read_applied_during_cold_start_is_kept() {
        let (repo, ids) = repo_with_comics().await;
        let cache = ReadStateCache::spawn_with_clock(
            Arc::clone(&repo),
            settings(fast_queue()),
            scripted_clock(vec![at(9)]),
        );

        // Queue the cold-start fetch ahead of the worker's write.
        let stall = tokio::spawn({
            let repo = Arc::clone(&repo);
            async move { repo.stall_for_test(StdDuration::from_millis(100)).await }
        });
        tokio::task::yield_now().await;

        let (refreshed, submitted) = tokio::join!(cache.refresh(), cache.submit_read(ids[0]));
        assert_ok!(refreshed);
        assert_eq!(submitted.unwrap(), SubmitOutcome::Queued);
        let stats = cache.shutdown().await.unwrap();

        assert_eq!(stats.applied, 1);
        assert_eq!(cache.comic(ids[0]).await.unwrap().last_read, at(9));
        assert_ok!(stall.await.unwrap());
    }

    #[tokio::test]
    async fn drop_policy_refuses_events_when_full() {
        let (repo, ids) = repo_with_comics().await;
        let queue = ReadQueueConfig {
            capacity: 1,
            policy: BackpressurePolicy::Drop,
            ..fast_queue()
        };
        let cache = ReadStateCache::spawn(Arc::clone(&repo), settings(queue));

        // The current-thread test runtime does not run the worker until we
        // yield, so the second event finds the single slot taken.
        assert_eq!(cache.submit_read(ids[0]).await.unwrap(), SubmitOutcome::Queued);
        assert_eq!(cache.submit_read(ids[1]).await.unwrap(), SubmitOutcome::Dropped);

        let stats = cache.shutdown().await.unwrap();
        assert_eq!(stats.applied, 1);
        assert_eq!(stats.dropped, 1);
    }

    #[tokio::test]
    async fn unbounded_policy_accepts_bursts() {
        let (repo, ids) = repo_with_comics().await;
        let queue = ReadQueueConfig {
            policy: BackpressurePolicy::Unbounded,
            ..fast_queue()
        };
        let base = at(6);
        let times = (0..50).map(|i| base + Duration::seconds(i)).collect();
        let cache = ReadStateCache::spawn_with_clock(Arc::clone(&repo), settings(queue), scripted_clock(times));

        for _ in 0..50 {
            assert_eq!(cache.submit_read(ids[0]).await.unwrap(), SubmitOutcome::Queued);
        }
        let stats = cache.shutdown().await.unwrap();
        assert_eq!(stats.applied, 50);
        let stored = repo.fetch_by_id(ids[0], USER).await.unwrap().unwrap();
        assert_eq!(stored.last_read, base + Duration::seconds(49));
    }

    #[tokio::test]
    async fn submissions_after_shutdown_fail() {
        let (repo, ids) = repo_with_comics().await;
        let cache = ReadStateCache::spawn(repo, settings(fast_queue()));
        cache.shutdown().await.unwrap();

        assert!(matches!(
            cache.submit_read(ids[0]).await,
            Err(AppError::QueueClosed)
        ));
        // A second shutdown is a no-op.
        assert_ok!(cache.shutdown().await);
    }
}
