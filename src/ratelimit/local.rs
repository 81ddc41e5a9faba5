//! In-process counter store.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

use super::clock::{Clock, SystemClock};
use super::counter::CounterEntry;
use super::store::{BackendError, CounterStore, StoreKind};

/// Exact, race-free counters for a single process.
///
/// Each increment runs under the shard lock of its key, so two concurrent
/// increments of one key never observe the same count. Lapsed windows are
/// replaced lazily on the next increment; [`sweep_expired`] bounds memory
/// when many identifiers come and go.
///
/// [`sweep_expired`]: LocalCounterStore::sweep_expired
#[derive(Debug)]
pub struct LocalCounterStore {
    entries: DashMap<String, CounterEntry>,
    clock: Arc<dyn Clock>,
}

impl LocalCounterStore {
    /// Create an empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Record one request for `key` and return the resulting window.
    pub fn increment(&self, key: &str, window: Duration) -> CounterEntry {
        let now = self.clock.now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.hit(now, window);
                *entry
            }
            Entry::Vacant(vacant) => *vacant.insert(CounterEntry::start(now, window)),
        }
    }

    /// Read the live window for `key`. A lapsed window reads as `None` but
    /// stays stored until the next increment or sweep.
    pub fn peek(&self, key: &str) -> Option<CounterEntry> {
        let now = self.clock.now();
        self.entries
            .get(key)
            .map(|entry| *entry)
            .filter(|entry| !entry.is_expired(now))
    }

    /// Remove the counter for `key`. Always `true`.
    pub fn reset(&self, key: &str) -> bool {
        self.entries.remove(key);
        true
    }

    /// Number of stored entries, lapsed ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry whose window has lapsed. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every `interval` on the
    /// current tokio runtime.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = store.sweep_expired();
                if removed > 0 {
                    debug!(removed, remaining = store.len(), "Swept expired rate limit counters");
                }
            }
        })
    }
}

impl Default for LocalCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for LocalCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<CounterEntry, BackendError> {
        Ok(LocalCounterStore::increment(self, key, window))
    }

    async fn peek(&self, key: &str) -> Result<Option<CounterEntry>, BackendError> {
        Ok(LocalCounterStore::peek(self, key))
    }

    async fn reset(&self, key: &str) -> Result<bool, BackendError> {
        Ok(LocalCounterStore::reset(self, key))
    }

    fn kind(&self) -> StoreKind {
        StoreKind::Memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;

    fn store_with_clock() -> (LocalCounterStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (LocalCounterStore::with_clock(clock.clone()), clock)
    }

    #[test]
    fn test_increment_counts_within_window() {
        let (store, clock) = store_with_clock();
        let window = Duration::from_secs(60);

        let first = store.increment("u1:api", window);
        assert_eq!(first.count, 1);

        clock.advance(Duration::from_secs(10));
        let second = store.increment("u1:api", window);
        assert_eq!(second.count, 2);
        assert_eq!(second.expires_at, first.expires_at);
    }

    #[test]
    fn test_increment_resets_lapsed_window() {
        let (store, clock) = store_with_clock();
        let window = Duration::from_secs(1);

        for _ in 0..5 {
            store.increment("u1:realtime", window);
        }
        clock.advance(Duration::from_secs(1));

        let entry = store.increment("u1:realtime", window);
        assert_eq!(entry.count, 1);
        assert_eq!(entry.expires_at, clock.now() + chrono::TimeDelta::seconds(1));
    }

    #[test]
    fn test_peek_does_not_count() {
        let (store, _clock) = store_with_clock();
        assert_eq!(store.peek("u1:api"), None);

        store.increment("u1:api", Duration::from_secs(60));
        assert_eq!(store.peek("u1:api").map(|e| e.count), Some(1));
        assert_eq!(store.peek("u1:api").map(|e| e.count), Some(1));
    }

    #[test]
    fn test_peek_does_not_persist_rollover() {
        let (store, clock) = store_with_clock();
        store.increment("u1:api", Duration::from_secs(1));
        clock.advance(Duration::from_secs(2));

        assert_eq!(store.peek("u1:api"), None);
        // The lapsed entry is still stored; only increment or sweep replaces it.
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_reset_is_idempotent() {
        let (store, _clock) = store_with_clock();
        store.increment("u1:api", Duration::from_secs(60));

        assert!(store.reset("u1:api"));
        assert!(store.reset("u1:api"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_sweep_expired() {
        let (store, clock) = store_with_clock();
        store.increment("short", Duration::from_secs(1));
        store.increment("long", Duration::from_secs(60));

        clock.advance(Duration::from_secs(5));
        assert_eq!(store.sweep_expired(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.peek("long").is_some());
    }

    #[test]
    fn test_concurrent_increments_are_linearizable() {
        let store = LocalCounterStore::new();
        let window = Duration::from_secs(60);
        let threads = 8;
        let per_thread = 250;

        let mut seen: Vec<u64> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    scope.spawn(|| {
                        (0..per_thread)
                            .map(|_| store.increment("hot", window).count)
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|handle| handle.join().unwrap())
                .collect()
        });

        seen.sort_unstable();
        let expected: Vec<u64> = (1..=(threads * per_thread) as u64).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_sweeper_task_removes_lapsed_entries() {
        let store = Arc::new(LocalCounterStore::new());
        store.increment("short", Duration::from_millis(1));

        let handle = store.spawn_sweeper(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.abort();

        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_trait_reports_memory() {
        let store = LocalCounterStore::new();
        let entry = CounterStore::increment(&store, "k", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(entry.count, 1);
        assert_eq!(store.kind(), StoreKind::Memory);
        assert!(store.is_connected());
    }
}
