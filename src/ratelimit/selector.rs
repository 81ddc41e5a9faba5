//! Per-call routing between the distributed and local stores.
//!
//! The distributed store is preferred while it reports itself connected. Any
//! failure of a distributed operation is logged, counted, and the same
//! operation is repeated against the local store within the same call, so an
//! outage of the shared store can never look like a rate limit rejection.

use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::counter::CounterEntry;
use super::local::LocalCounterStore;
use super::store::{BackendError, CounterStore, StoreKind};

/// Chooses the store for each operation and reports which one served it.
#[derive(Clone)]
pub struct BackendSelector {
    local: Arc<LocalCounterStore>,
    distributed: Option<Arc<dyn CounterStore>>,
}

impl std::fmt::Debug for BackendSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSelector")
            .field("local_entries", &self.local.len())
            .field("distributed", &self.distributed.as_ref().map(|d| d.kind()))
            .field("connected", &self.backend_connected())
            .finish()
    }
}

impl BackendSelector {
    /// Selector over the local store only.
    pub fn local_only(local: Arc<LocalCounterStore>) -> Self {
        Self {
            local,
            distributed: None,
        }
    }

    /// Selector preferring `distributed` whenever it reports connected.
    pub fn new(local: Arc<LocalCounterStore>, distributed: Option<Arc<dyn CounterStore>>) -> Self {
        Self { local, distributed }
    }

    /// The store the next operation would go to, with its tag.
    pub fn select(&self) -> (&dyn CounterStore, StoreKind) {
        match self.connected_distributed() {
            Some(store) => (store.as_ref(), store.kind()),
            None => (self.local.as_ref() as &dyn CounterStore, StoreKind::Memory),
        }
    }

    /// Tag of the store [`select`](Self::select) currently picks.
    pub fn active_store(&self) -> StoreKind {
        self.select().1
    }

    /// Whether a distributed store is configured and reports connected.
    pub fn backend_connected(&self) -> bool {
        self.connected_distributed().is_some()
    }

    /// The local store, which always exists.
    pub fn local(&self) -> &Arc<LocalCounterStore> {
        &self.local
    }

    fn connected_distributed(&self) -> Option<&Arc<dyn CounterStore>> {
        self.distributed.as_ref().filter(|store| store.is_connected())
    }

    /// Count one request for `key` on the selected store.
    pub async fn increment(&self, key: &str, window: Duration) -> (CounterEntry, StoreKind) {
        if let Some(store) = self.connected_distributed() {
            match store.increment(key, window).await {
                Ok(entry) => return (entry, store.kind()),
                Err(error) => degrade("increment", key, &error),
            }
        }
        (self.local.increment(key, window), StoreKind::Memory)
    }

    /// Read the live window for `key` on the selected store.
    pub async fn peek(&self, key: &str) -> (Option<CounterEntry>, StoreKind) {
        if let Some(store) = self.connected_distributed() {
            match store.peek(key).await {
                Ok(entry) => return (entry, store.kind()),
                Err(error) => degrade("peek", key, &error),
            }
        }
        (self.local.peek(key), StoreKind::Memory)
    }

    /// Drop `key` from the local store and, when connected, the distributed
    /// store. Always `true`.
    pub async fn reset(&self, key: &str) -> bool {
        if let Some(store) = self.connected_distributed() {
            if let Err(error) = store.reset(key).await {
                degrade("reset", key, &error);
            }
        }
        self.local.reset(key)
    }
}

fn degrade(operation: &'static str, key: &str, error: &BackendError) {
    warn!(
        operation,
        key = %key,
        error = %error,
        "Distributed rate limit store failed, falling back to memory"
    );
    counter!("nicu_ratelimit_backend_fallbacks_total", "operation" => operation).increment(1);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Distributed store double backed by an in-process map.
    #[derive(Default)]
    pub(crate) struct FakeDistributedStore {
        pub(crate) inner: LocalCounterStore,
        pub(crate) disconnected: AtomicBool,
        pub(crate) failing: AtomicBool,
        pub(crate) calls: AtomicUsize,
    }

    impl FakeDistributedStore {
        fn fail_if_asked(&self) -> Result<(), BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(BackendError::Timeout(Duration::from_millis(50)));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl CounterStore for FakeDistributedStore {
        async fn increment(&self, key: &str, window: Duration) -> Result<CounterEntry, BackendError> {
            self.fail_if_asked()?;
            Ok(self.inner.increment(key, window))
        }

        async fn peek(&self, key: &str) -> Result<Option<CounterEntry>, BackendError> {
            self.fail_if_asked()?;
            Ok(self.inner.peek(key))
        }

        async fn reset(&self, key: &str) -> Result<bool, BackendError> {
            self.fail_if_asked()?;
            Ok(self.inner.reset(key))
        }

        fn kind(&self) -> StoreKind {
            StoreKind::Redis
        }

        fn is_connected(&self) -> bool {
            !self.disconnected.load(Ordering::SeqCst)
        }
    }

    fn selector_with_fake() -> (BackendSelector, Arc<LocalCounterStore>, Arc<FakeDistributedStore>) {
        let local = Arc::new(LocalCounterStore::new());
        let remote = Arc::new(FakeDistributedStore::default());
        let selector = BackendSelector::new(local.clone(), Some(remote.clone() as Arc<dyn CounterStore>));
        (selector, local, remote)
    }

    #[tokio::test]
    async fn test_local_only_uses_memory() {
        let selector = BackendSelector::local_only(Arc::new(LocalCounterStore::new()));
        assert_eq!(selector.active_store(), StoreKind::Memory);
        assert!(!selector.backend_connected());

        let (entry, kind) = selector.increment("u1:api", Duration::from_secs(60)).await;
        assert_eq!(entry.count, 1);
        assert_eq!(kind, StoreKind::Memory);
    }

    #[tokio::test]
    async fn test_connected_backend_is_preferred() {
        let (selector, local, remote) = selector_with_fake();
        assert_eq!(selector.active_store(), StoreKind::Redis);

        let (entry, kind) = selector.increment("u1:api", Duration::from_secs(60)).await;
        assert_eq!(kind, StoreKind::Redis);
        assert_eq!(entry.count, 1);
        assert_eq!(remote.inner.len(), 1);
        assert!(local.is_empty());
    }

    #[tokio::test]
    async fn test_disconnected_backend_is_skipped() {
        let (selector, local, remote) = selector_with_fake();
        remote.disconnected.store(true, Ordering::SeqCst);

        assert_eq!(selector.active_store(), StoreKind::Memory);
        let (_, kind) = selector.increment("u1:api", Duration::from_secs(60)).await;
        assert_eq!(kind, StoreKind::Memory);
        assert_eq!(remote.calls.load(Ordering::SeqCst), 0);
        assert_eq!(local.len(), 1);
    }

    #[tokio::test]
    async fn test_failing_backend_falls_back_within_call() {
        let (selector, local, remote) = selector_with_fake();
        remote.failing.store(true, Ordering::SeqCst);

        let (entry, kind) = selector.increment("u1:api", Duration::from_secs(60)).await;
        assert_eq!(kind, StoreKind::Memory);
        assert_eq!(entry.count, 1);
        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
        assert_eq!(local.len(), 1);

        let (peeked, kind) = selector.peek("u1:api").await;
        assert_eq!(kind, StoreKind::Memory);
        assert_eq!(peeked.map(|e| e.count), Some(1));
    }

    #[tokio::test]
    async fn test_reset_clears_both_stores() {
        let (selector, local, remote) = selector_with_fake();
        remote.inner.increment("u1:api", Duration::from_secs(60));
        local.increment("u1:api", Duration::from_secs(60));

        assert!(selector.reset("u1:api").await);
        assert!(remote.inner.is_empty());
        assert!(local.is_empty());
    }

    #[tokio::test]
    async fn test_reset_survives_backend_failure() {
        let (selector, local, remote) = selector_with_fake();
        remote.failing.store(true, Ordering::SeqCst);
        local.increment("u1:api", Duration::from_secs(60));

        assert!(selector.reset("u1:api").await);
        assert!(local.is_empty());
    }
}
