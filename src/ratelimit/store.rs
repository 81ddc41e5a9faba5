//! Counter store trait for abstracting local and distributed implementations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use super::counter::CounterEntry;

/// Which kind of store served an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// In-process map
    Memory,
    /// Shared Redis instance
    Redis,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Memory => "memory",
            StoreKind::Redis => "redis",
        }
    }
}

impl std::fmt::Display for StoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a distributed store operation.
///
/// Recovered by falling back to the local store; never returned to callers
/// of the limiter.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Trait for counter store implementations.
///
/// This trait abstracts over the in-process `LocalCounterStore` and the
/// `RedisCounterStore` so the selector can route to either.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Record one request for `key`, opening a new window of length
    /// `window` if none is live.
    async fn increment(&self, key: &str, window: Duration) -> Result<CounterEntry, BackendError>;

    /// Read the live window for `key` without counting. Lapsed windows read
    /// as `None`.
    async fn peek(&self, key: &str) -> Result<Option<CounterEntry>, BackendError>;

    /// Drop the counter for `key`.
    async fn reset(&self, key: &str) -> Result<bool, BackendError>;

    /// Which kind of store this is.
    fn kind(&self) -> StoreKind;

    /// Whether the store currently believes it can serve requests.
    fn is_connected(&self) -> bool {
        true
    }
}
