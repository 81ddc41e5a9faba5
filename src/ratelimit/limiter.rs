//! Core rate limiter implementation.

use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use super::clock::{add_duration, Clock, SystemClock};
use super::counter::CounterEntry;
use super::distributed::RedisCounterStore;
use super::key::CounterKey;
use super::local::LocalCounterStore;
use super::policy::{Policy, PolicyRegistry};
use super::selector::BackendSelector;
use super::status::LimiterStatus;
use super::store::{CounterStore, StoreKind};
use crate::config::LimiterConfig;
use crate::error::Result;

/// Outcome of an admitted check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitDecision {
    pub allowed: bool,
    /// Requests left in this window
    pub remaining: u64,
    /// Requests admitted per window
    pub limit: u64,
    /// When the window ends
    pub reset_time: DateTime<Utc>,
    /// Store that counted the request
    pub store: StoreKind,
}

/// Read-only view of a counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitInfo {
    /// Requests counted in the live window, zero if it lapsed
    pub used: u64,
    pub remaining: u64,
    pub limit: u64,
    pub reset_time: DateTime<Utc>,
    pub store: StoreKind,
}

/// The request was over its policy's limit.
///
/// This is the only error the admission path produces.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("rate limit exceeded for policy '{policy}', retry after {retry_after_secs}s")]
pub struct RateLimitExceeded {
    /// Whole seconds until the window ends, at least 1
    pub retry_after_secs: u64,
    pub limit: u64,
    /// Always 0
    pub remaining: u64,
    pub reset_time: DateTime<Utc>,
    /// Resolved policy name
    pub policy: String,
    pub store: StoreKind,
}

/// Fixed-window admission control over a local or distributed counter store.
///
/// This struct is thread-safe and can be shared across request handlers.
pub struct RateLimiter {
    policies: PolicyRegistry,
    selector: BackendSelector,
    clock: Arc<dyn Clock>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("policies", &self.policies)
            .field("selector", &self.selector)
            .finish()
    }
}

/// Builder for [`RateLimiter`].
pub struct RateLimiterBuilder {
    policies: PolicyRegistry,
    clock: Arc<dyn Clock>,
    distributed: Option<Arc<dyn CounterStore>>,
}

impl RateLimiterBuilder {
    pub fn policies(mut self, policies: PolicyRegistry) -> Self {
        self.policies = policies;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Shared store preferred whenever it reports connected.
    pub fn distributed(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.distributed = Some(store);
        self
    }

    pub fn build(self) -> RateLimiter {
        let local = Arc::new(LocalCounterStore::with_clock(self.clock.clone()));
        RateLimiter {
            policies: self.policies,
            selector: BackendSelector::new(local, self.distributed),
            clock: self.clock,
            tasks: Mutex::new(Vec::new()),
        }
    }
}

impl RateLimiter {
    /// Create a local-only rate limiter with the baseline policies.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> RateLimiterBuilder {
        RateLimiterBuilder {
            policies: PolicyRegistry::new(),
            clock: Arc::new(SystemClock),
            distributed: None,
        }
    }

    /// Build a limiter from configuration and start its background tasks.
    ///
    /// An unreachable Redis does not fail construction: the limiter starts in
    /// memory mode and switches over once the health check succeeds.
    pub async fn from_config(config: &LimiterConfig) -> Result<Self> {
        config.redis.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let policies = PolicyRegistry::with_overrides(&config.policies)?;
        let redis = RedisCounterStore::from_config(&config.redis, clock.clone())?.map(Arc::new);

        let mut builder = Self::builder().policies(policies).clock(clock);
        if let Some(store) = &redis {
            store.probe().await;
            builder = builder.distributed(store.clone());
        }
        let limiter = builder.build();

        if let Some(store) = &redis {
            limiter.track(store.spawn_health_check(config.redis.health_check_interval()));
        }
        if let Some(interval) = config.local.sweep_interval() {
            limiter.start_sweeper(interval);
        }

        info!(
            store = %limiter.selector.active_store(),
            redis_configured = redis.is_some(),
            policies = limiter.policies.policies().len(),
            "Rate limiter initialized"
        );
        Ok(limiter)
    }

    /// Count a request against the local store and decide on it.
    ///
    /// Never suspends. Deployments with a distributed store should use
    /// [`check_async`](Self::check_async), which routes through it; counts
    /// made here stay local and are only visible to [`info`](Self::info)
    /// while the shared store has no live window for the key.
    pub fn check(
        &self,
        identifier: &str,
        policy_name: &str,
    ) -> std::result::Result<LimitDecision, RateLimitExceeded> {
        let key = CounterKey::new(identifier, policy_name);
        let policy = self.policies.get(policy_name);
        let entry = self
            .selector
            .local()
            .increment(&key.to_store_key(), policy.window());
        self.decide(&key, policy, entry, StoreKind::Memory)
    }

    /// Count a request against the selected store and decide on it.
    pub async fn check_async(
        &self,
        identifier: &str,
        policy_name: &str,
    ) -> std::result::Result<LimitDecision, RateLimitExceeded> {
        let key = CounterKey::new(identifier, policy_name);
        let policy = self.policies.get(policy_name);
        let (entry, store) = self
            .selector
            .increment(&key.to_store_key(), policy.window())
            .await;
        self.decide(&key, policy, entry, store)
    }

    fn decide(
        &self,
        key: &CounterKey,
        policy: &Policy,
        entry: CounterEntry,
        store: StoreKind,
    ) -> std::result::Result<LimitDecision, RateLimitExceeded> {
        let allowed = entry.count <= policy.max;

        trace!(
            key = %key,
            count = entry.count,
            limit = policy.max,
            store = %store,
            "Checked rate limit"
        );
        counter!(
            "nicu_ratelimit_checks_total",
            "policy" => policy.name.clone(),
            "store" => store.as_str(),
            "allowed" => if allowed { "true" } else { "false" }
        )
        .increment(1);

        if !allowed {
            let retry_after_secs = retry_after_secs(entry.duration_until_reset(self.clock.now()));
            debug!(
                key = %key,
                count = entry.count,
                limit = policy.max,
                retry_after_secs,
                "Rate limit exceeded"
            );
            counter!("nicu_ratelimit_rejections_total", "policy" => policy.name.clone()).increment(1);

            return Err(RateLimitExceeded {
                retry_after_secs,
                limit: policy.max,
                remaining: 0,
                reset_time: entry.expires_at,
                policy: policy.name.clone(),
                store,
            });
        }

        Ok(LimitDecision {
            allowed: true,
            remaining: policy.max - entry.count,
            limit: policy.max,
            reset_time: entry.expires_at,
            store,
        })
    }

    /// Report the counter without counting a request.
    ///
    /// Reads the selected store first. When the shared store has no live
    /// window for the key, a live local window (counted by [`check`](Self::check)
    /// or during a fallback) is reported instead.
    pub async fn info(&self, identifier: &str, policy_name: &str) -> LimitInfo {
        let key = CounterKey::new(identifier, policy_name);
        let store_key = key.to_store_key();
        let policy = self.policies.get(policy_name);
        let (entry, store) = match self.selector.peek(&store_key).await {
            (None, StoreKind::Redis) => match self.selector.local().peek(&store_key) {
                Some(local) => (Some(local), StoreKind::Memory),
                None => (None, StoreKind::Redis),
            },
            found => found,
        };

        let (used, reset_time) = match entry {
            Some(entry) => (entry.count, entry.expires_at),
            None => (0, add_duration(self.clock.now(), policy.window())),
        };

        LimitInfo {
            used,
            remaining: policy.max.saturating_sub(used),
            limit: policy.max,
            reset_time,
            store,
        }
    }

    /// Clear the counter for `identifier` under `policy_name`. Always `true`.
    pub async fn reset(&self, identifier: &str, policy_name: &str) -> bool {
        let key = CounterKey::new(identifier, policy_name);
        debug!(key = %key, "Resetting rate limit counter");
        self.selector.reset(&key.to_store_key()).await
    }

    /// Active store, connectivity, local store size and the policy table.
    pub fn status(&self) -> LimiterStatus {
        LimiterStatus {
            store: self.selector.active_store(),
            backend_connected: self.selector.backend_connected(),
            local_store_size: self.selector.local().len(),
            policies: self.policies.policies().clone(),
        }
    }

    /// The policy `name` resolves to.
    pub fn policy(&self, name: &str) -> &Policy {
        self.policies.get(name)
    }

    pub fn policies(&self) -> &PolicyRegistry {
        &self.policies
    }

    /// Periodically drop lapsed local counters. Must be called within a
    /// tokio runtime.
    pub fn start_sweeper(&self, interval: Duration) {
        self.track(self.selector.local().spawn_sweeper(interval));
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    /// Stop the background tasks.
    pub fn shutdown(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Whole seconds until reset, rounded up, never less than one.
fn retry_after_secs(until_reset: Duration) -> u64 {
    let secs = until_reset.as_millis().div_ceil(1000);
    u64::try_from(secs).unwrap_or(u64::MAX).max(1)
}
