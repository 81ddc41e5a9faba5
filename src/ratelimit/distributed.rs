//! Distributed counter store backed by Redis.
//!
//! Counters are shared by every instance pointing at the same Redis. Each
//! increment is a single Lua script round trip, so the count and the window
//! expiry are updated atomically, and expired keys are removed by Redis TTL.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{info, trace, warn};

use super::clock::{add_duration, Clock};
use super::counter::CounterEntry;
use super::store::{BackendError, CounterStore, StoreKind};
use crate::config::RedisConfig;
use crate::error::Result;

/// Increment the key and arm its TTL only when none is set. Runs atomically,
/// so a concurrent first increment cannot re-arm the window and a window can
/// never be left without an expiry.
const INCREMENT_SCRIPT: &str = r#"
local key = KEYS[1]
local window_ms = tonumber(ARGV[1])

local count = redis.call('INCR', key)
local ttl = redis.call('PTTL', key)

if ttl < 0 then
  redis.call('PEXPIRE', key, window_ms)
  ttl = window_ms
end

return {count, ttl}
"#;

/// Default bound on connection setup, separate from the per-operation timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

const MIN_HEALTH_CHECK_INTERVAL: Duration = Duration::from_millis(1);

/// Redis implementation of the counter store.
pub struct RedisCounterStore {
    client: redis::Client,
    connection: OnceCell<ConnectionManager>,
    script: Script,
    key_prefix: String,
    timeout: Duration,
    connect_timeout: Duration,
    connected: AtomicBool,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("key_prefix", &self.key_prefix)
            .field("timeout", &self.timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl RedisCounterStore {
    /// Create a store for the given client. No connection is made until the
    /// first operation or probe, and the store reports disconnected until one
    /// succeeds.
    pub fn new(
        client: redis::Client,
        key_prefix: impl Into<String>,
        timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            client,
            connection: OnceCell::new(),
            script: Script::new(INCREMENT_SCRIPT),
            key_prefix: key_prefix.into(),
            timeout,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            connected: AtomicBool::new(false),
            clock,
        }
    }

    /// Build a store from configuration. Returns `Ok(None)` when no URL is
    /// configured.
    pub fn from_config(config: &RedisConfig, clock: Arc<dyn Clock>) -> Result<Option<Self>> {
        let Some(url) = config.url.as_deref() else {
            return Ok(None);
        };
        let client = redis::Client::open(url)?;
        let store = Self::new(client, config.key_prefix.clone(), config.timeout(), clock)
            .with_connect_timeout(config.connect_timeout());
        Ok(Some(store))
    }

    /// Bound connection setup by `connect_timeout` instead of the operation
    /// timeout.
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    fn key_for(&self, key: &str) -> String {
        format!("{}:{key}", self.key_prefix)
    }

    async fn connection(&self) -> redis::RedisResult<ConnectionManager> {
        let manager = self
            .connection
            .get_or_try_init(|| self.client.get_connection_manager())
            .await?;
        Ok(manager.clone())
    }

    /// Run one operation under the store timeout and record the outcome in
    /// the connectivity flag.
    async fn run<T, F>(&self, op: F) -> std::result::Result<T, BackendError>
    where
        F: Future<Output = std::result::Result<T, BackendError>>,
    {
        let outcome = match tokio::time::timeout(self.timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(self.timeout)),
        };
        self.record(outcome.is_ok());
        outcome
    }

    fn record(&self, ok: bool) {
        let was = self.connected.swap(ok, Ordering::AcqRel);
        if ok && !was {
            info!(prefix = %self.key_prefix, "Redis rate limit store connected");
        } else if !ok && was {
            warn!(prefix = %self.key_prefix, "Redis rate limit store disconnected");
        }
    }

    /// Establish the shared connection, waiting up to the connect timeout.
    async fn establish(&self) -> std::result::Result<ConnectionManager, BackendError> {
        match tokio::time::timeout(self.connect_timeout, self.connection()).await {
            Ok(connection) => Ok(connection?),
            Err(_) => Err(BackendError::Timeout(self.connect_timeout)),
        }
    }

    /// PING the server and update the connectivity flag.
    ///
    /// Connection setup gets the connect timeout; only the PING itself runs
    /// under the operation timeout.
    pub async fn probe(&self) -> bool {
        let result = match self.establish().await {
            Ok(mut connection) => {
                self.run(async move {
                    let _: String = redis::cmd("PING").query_async(&mut connection).await?;
                    Ok::<_, BackendError>(())
                })
                .await
            }
            Err(error) => {
                self.record(false);
                Err(error)
            }
        };
        if let Err(error) = &result {
            trace!(error = %error, "Redis probe failed");
        }
        result.is_ok()
    }

    /// Probe the server every `interval` on the current tokio runtime so the
    /// store reconnects after an outage. Intervals below one millisecond are
    /// raised to it.
    pub fn spawn_health_check(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store = Arc::clone(self);
        let interval = interval.max(MIN_HEALTH_CHECK_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                store.probe().await;
            }
        })
    }
}

/// Map a remaining TTL in milliseconds to the window expiry.
fn expiry_from_ttl(now: chrono::DateTime<chrono::Utc>, ttl_ms: i64) -> Option<chrono::DateTime<chrono::Utc>> {
    let ttl_ms = u64::try_from(ttl_ms).ok().filter(|ttl| *ttl > 0)?;
    Some(add_duration(now, Duration::from_millis(ttl_ms)))
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> std::result::Result<CounterEntry, BackendError> {
        let redis_key = self.key_for(key);
        let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX).max(1);

        let (count, ttl_ms): (u64, i64) = self
            .run(async {
                let mut connection = self.connection().await?;
                let reply: (u64, i64) = self
                    .script
                    .key(&redis_key)
                    .arg(window_ms)
                    .invoke_async(&mut connection)
                    .await?;
                Ok::<_, BackendError>(reply)
            })
            .await?;

        let now = self.clock.now();
        let expires_at = expiry_from_ttl(now, ttl_ms).ok_or_else(|| {
            BackendError::InvalidResponse(format!("non-positive ttl {ttl_ms} for '{redis_key}'"))
        })?;

        Ok(CounterEntry { count, expires_at })
    }

    async fn peek(&self, key: &str) -> std::result::Result<Option<CounterEntry>, BackendError> {
        let redis_key = self.key_for(key);

        let (count, ttl_ms): (Option<u64>, i64) = self
            .run(async {
                let mut connection = self.connection().await?;
                let reply: (Option<u64>, i64) = redis::pipe()
                    .atomic()
                    .get(&redis_key)
                    .cmd("PTTL")
                    .arg(&redis_key)
                    .query_async(&mut connection)
                    .await?;
                Ok::<_, BackendError>(reply)
            })
            .await?;

        // A key without a TTL is repaired by the next increment; until then
        // it reads as a lapsed window.
        let now = self.clock.now();
        Ok(count
            .zip(expiry_from_ttl(now, ttl_ms))
            .map(|(count, expires_at)| CounterEntry { count, expires_at }))
    }

    async fn reset(&self, key: &str) -> std::result::Result<bool, BackendError> {
        let redis_key = self.key_for(key);
        self.run(async {
            let mut connection = self.connection().await?;
            let _: i64 = redis::cmd("DEL")
                .arg(&redis_key)
                .query_async(&mut connection)
                .await?;
            Ok::<_, BackendError>(())
        })
        .await?;
        Ok(true)
    }

    fn kind(&self) -> StoreKind {
        StoreKind::Redis
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}
