//! Error types for limiter construction and configuration.
//!
//! Admission-path errors live next to the limiter
//! ([`RateLimitExceeded`](crate::ratelimit::RateLimitExceeded)) and the store
//! interface ([`BackendError`](crate::ratelimit::BackendError)).

use thiserror::Error;

/// Main error type for building and configuring the limiter.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Redis client errors (invalid URL, unsupported scheme)
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl From<::config::ConfigError> for LimiterError {
    fn from(err: ::config::ConfigError) -> Self {
        LimiterError::Config(err.to_string())
    }
}

/// Result type alias for limiter operations.
pub type Result<T> = std::result::Result<T, LimiterError>;
