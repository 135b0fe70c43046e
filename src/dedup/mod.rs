pub mod memory;
pub mod sqlite;

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::event::DedupKey;

pub use memory::MemoryDedupStore;
pub use sqlite::SqliteDedupStore;

/// How many recent suppressions are kept for the debug surface.
const RECENT_SUPPRESSIONS: usize = 20;

/// Result of an atomic check-then-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupStatus {
    FirstSeen,
    AlreadySeen,
}

/// Backing store for dedup records.
///
/// `check_and_mark` must be a single atomic operation: for concurrent callers
/// presenting the same key, exactly one observes `FirstSeen`. A record whose
/// first-seen time is at or before `cutoff` is expired and is replaced as if the
/// key were new.
#[async_trait]
pub trait DedupStore: Send + Sync {
    async fn check_and_mark(
        &self,
        key: &str,
        now: DateTime<Utc>,
        cutoff: DateTime<Utc>,
    ) -> Result<DedupStatus, StoreError>;

    /// Drop a record so the next arrival of the key is treated as new.
    async fn release(&self, key: &str) -> Result<(), StoreError>;

    /// Remove every record at or before `cutoff`. Returns the number removed.
    async fn evict_expired(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Number of records whose key starts with `prefix`.
    async fn tracked(&self, prefix: &str) -> Result<usize, StoreError>;
}

/// Wall-clock source, injectable so retention can be tested.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Which pipeline stage a [`Deduplicator`] guards. Each stage keeps its own
/// records so the ingress mark never suppresses the dispatch of the same event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Ingress,
    Dispatch,
}

impl Stage {
    fn prefix(&self) -> &'static str {
        match self {
            Stage::Ingress => "ingress:",
            Stage::Dispatch => "dispatch:",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Ingress => f.write_str("ingress"),
            Stage::Dispatch => f.write_str("dispatch"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Suppression {
    pub key: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DedupStats {
    pub stage: Stage,
    pub retention_secs: i64,
    pub tracked_keys: usize,
    pub suppressed_total: u64,
    pub recent_suppressions: Vec<Suppression>,
}

/// Stage-scoped duplicate detector over a shared [`DedupStore`].
pub struct Deduplicator {
    store: Arc<dyn DedupStore>,
    stage: Stage,
    retention: Duration,
    clock: Arc<dyn Clock>,
    suppressed_total: AtomicU64,
    recent: Mutex<VecDeque<Suppression>>,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn DedupStore>, stage: Stage, retention: Duration) -> Self {
        Self {
            store,
            stage,
            retention,
            clock: Arc::new(SystemClock),
            suppressed_total: AtomicU64::new(0),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_SUPPRESSIONS)),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn scoped(&self, key: &DedupKey) -> String {
        format!("{}{}", self.stage.prefix(), key)
    }

    /// Atomically record `key` and report whether it was already present and
    /// unexpired.
    pub async fn check_and_mark(&self, key: &DedupKey) -> Result<DedupStatus, StoreError> {
        let now = self.clock.now();
        let status = self
            .store
            .check_and_mark(&self.scoped(key), now, now - self.retention)
            .await?;

        if status == DedupStatus::AlreadySeen {
            self.suppressed_total.fetch_add(1, Ordering::Relaxed);
            let mut recent = self.recent.lock().await;
            if recent.len() == RECENT_SUPPRESSIONS {
                recent.pop_front();
            }
            recent.push_back(Suppression {
                key: key.to_string(),
                at: now,
            });
            debug!(stage = %self.stage, dedup_key = %key, "duplicate suppressed");
        }

        Ok(status)
    }

    /// Forget `key` so a redelivery of the same event can be processed.
    pub async fn release(&self, key: &DedupKey) -> Result<(), StoreError> {
        self.store.release(&self.scoped(key)).await
    }

    /// Evict every expired record in the shared store.
    pub async fn sweep(&self) -> Result<usize, StoreError> {
        let cutoff = self.clock.now() - self.retention;
        let removed = self.store.evict_expired(cutoff).await?;
        if removed > 0 {
            info!(stage = %self.stage, removed, "evicted expired dedup records");
        }
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<DedupStats, StoreError> {
        let tracked_keys = self.store.tracked(self.stage.prefix()).await?;
        let recent_suppressions = self.recent.lock().await.iter().cloned().collect();
        Ok(DedupStats {
            stage: self.stage,
            retention_secs: self.retention.num_seconds(),
            tracked_keys,
            suppressed_total: self.suppressed_total.load(Ordering::Relaxed),
            recent_suppressions,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Clock that only moves when told to.
    pub(crate) struct ManualClock(std::sync::Mutex<DateTime<Utc>>);

    impl ManualClock {
        pub(crate) fn new(start: DateTime<Utc>) -> Self {
            Self(std::sync::Mutex::new(start))
        }

        pub(crate) fn advance(&self, by: Duration) {
            let mut now = self.0.lock().unwrap();
            *now += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    fn start() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn dedup(stage: Stage, store: Arc<dyn DedupStore>, clock: Arc<ManualClock>) -> Deduplicator {
        Deduplicator::new(store, stage, Duration::seconds(300)).with_clock(clock)
    }

    #[tokio::test]
    async fn test_second_arrival_is_suppressed() {
        let clock = Arc::new(ManualClock::new(start()));
        let d = dedup(Stage::Dispatch, Arc::new(MemoryDedupStore::new()), clock);
        let key = DedupKey::new("src:evt1");

        assert_eq!(d.check_and_mark(&key).await.unwrap(), DedupStatus::FirstSeen);
        assert_eq!(d.check_and_mark(&key).await.unwrap(), DedupStatus::AlreadySeen);

        let stats = d.stats().await.unwrap();
        assert_eq!(stats.tracked_keys, 1);
        assert_eq!(stats.suppressed_total, 1);
        assert_eq!(stats.recent_suppressions[0].key, "src:evt1");
    }

    #[tokio::test]
    async fn test_retention_boundary() {
        let clock = Arc::new(ManualClock::new(start()));
        let d = dedup(Stage::Dispatch, Arc::new(MemoryDedupStore::new()), clock.clone());
        let key = DedupKey::new("src:evt1");

        d.check_and_mark(&key).await.unwrap();
        clock.advance(Duration::seconds(300) - Duration::milliseconds(1));
        assert_eq!(d.check_and_mark(&key).await.unwrap(), DedupStatus::AlreadySeen);

        // The AlreadySeen above must not have refreshed the first-seen time.
        clock.advance(Duration::milliseconds(1));
        assert_eq!(d.check_and_mark(&key).await.unwrap(), DedupStatus::FirstSeen);
        assert_eq!(d.check_and_mark(&key).await.unwrap(), DedupStatus::AlreadySeen);
    }

    #[tokio::test]
    async fn test_stages_do_not_interfere() {
        let clock = Arc::new(ManualClock::new(start()));
        let store: Arc<dyn DedupStore> = Arc::new(MemoryDedupStore::new());
        let ingress = dedup(Stage::Ingress, store.clone(), clock.clone());
        let dispatch = dedup(Stage::Dispatch, store, clock);
        let key = DedupKey::new("src:evt1");

        assert_eq!(ingress.check_and_mark(&key).await.unwrap(), DedupStatus::FirstSeen);
        assert_eq!(dispatch.check_and_mark(&key).await.unwrap(), DedupStatus::FirstSeen);
        assert_eq!(ingress.stats().await.unwrap().tracked_keys, 1);
    }

    #[tokio::test]
    async fn test_release_allows_reprocessing() {
        let clock = Arc::new(ManualClock::new(start()));
        let d = dedup(Stage::Dispatch, Arc::new(MemoryDedupStore::new()), clock);
        let key = DedupKey::new("src:evt1");

        d.check_and_mark(&key).await.unwrap();
        d.release(&key).await.unwrap();
        assert_eq!(d.check_and_mark(&key).await.unwrap(), DedupStatus::FirstSeen);
    }

    #[tokio::test]
    async fn test_concurrent_callers_see_one_first() {
        let store: Arc<dyn DedupStore> = Arc::new(MemoryDedupStore::new());
        let d = Arc::new(Deduplicator::new(store, Stage::Dispatch, Duration::seconds(300)));
        let key = DedupKey::new("src:race");

        let mut handles = Vec::new();
        for _ in 0..32 {
            let d = d.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move { d.check_and_mark(&key).await.unwrap() }));
        }

        let mut first = 0;
        for h in handles {
            if h.await.unwrap() == DedupStatus::FirstSeen {
                first += 1;
            }
        }
        assert_eq!(first, 1);
    }

    #[tokio::test]
    async fn test_sweep_evicts_expired() {
        let clock = Arc::new(ManualClock::new(start()));
        let d = dedup(Stage::Ingress, Arc::new(MemoryDedupStore::new()), clock.clone());

        d.check_and_mark(&DedupKey::new("a")).await.unwrap();
        clock.advance(Duration::seconds(200));
        d.check_and_mark(&DedupKey::new("b")).await.unwrap();
        clock.advance(Duration::seconds(100));

        assert_eq!(d.sweep().await.unwrap(), 1);
        assert_eq!(d.stats().await.unwrap().tracked_keys, 1);
    }
}
