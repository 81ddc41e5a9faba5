//! Configuration management for the rate limiter.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{LimiterError, Result};
use crate::ratelimit::PolicyOverride;

/// Environment variable prefix, e.g. `NICU_RATELIMIT__REDIS__URL`.
pub const ENV_PREFIX: &str = "NICU_RATELIMIT";

/// Main configuration for the rate limiter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Distributed store configuration
    #[serde(default)]
    pub redis: RedisConfig,

    /// In-process store configuration
    #[serde(default)]
    pub local: LocalStoreConfig,

    /// Policy overrides applied on top of the baseline table
    #[serde(default)]
    pub policies: HashMap<String, PolicyOverride>,
}

/// Redis store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Connection URL; local-only when unset
    #[serde(default)]
    pub url: Option<String>,

    /// Prefix for every counter key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Per-operation timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Connection setup timeout for the health probe in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Interval between connectivity probes in milliseconds
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
        }
    }
}

impl RedisConfig {
    /// Operation timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Connection setup timeout as a duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Health probe interval as a duration.
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Reject zero timeouts and intervals.
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("timeout_ms", self.timeout_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("health_check_interval_ms", self.health_check_interval_ms),
        ];
        for (field, value) in fields {
            if value == 0 {
                return Err(LimiterError::Config(format!(
                    "redis.{field} must be greater than zero"
                )));
            }
        }
        Ok(())
    }
}

fn default_key_prefix() -> String {
    "nicu:ratelimit".to_string()
}

fn default_timeout_ms() -> u64 {
    50
}

fn default_connect_timeout_ms() -> u64 {
    1000
}

fn default_health_check_interval_ms() -> u64 {
    5000
}

/// In-process store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalStoreConfig {
    /// Sweep interval for expired entries in milliseconds; no sweep when unset
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: Option<u64>,
}

impl Default for LocalStoreConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl LocalStoreConfig {
    /// Sweep interval as a duration, if sweeping is enabled.
    pub fn sweep_interval(&self) -> Option<Duration> {
        self.sweep_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

fn default_sweep_interval_ms() -> Option<u64> {
    Some(60_000)
}

impl LimiterConfig {
    /// Parse configuration from a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| LimiterError::Config(e.to_string()))
    }

    /// Load configuration from an optional file layered under environment
    /// variables prefixed with [`ENV_PREFIX`].
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LimiterConfig::default();
        assert!(config.redis.url.is_none());
        assert_eq!(config.redis.key_prefix, "nicu:ratelimit");
        assert_eq!(config.redis.timeout(), Duration::from_millis(50));
        assert_eq!(config.redis.connect_timeout(), Duration::from_secs(1));
        assert!(config.redis.validate().is_ok());
        assert_eq!(config.local.sweep_interval(), Some(Duration::from_secs(60)));
        assert!(config.policies.is_empty());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
redis:
  url: redis://127.0.0.1:6379
  timeout_ms: 25
local:
  sweep_interval_ms: 1000
policies:
  auth:
    window_ms: 600000
    max: 5
"#;
        let config = LimiterConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.redis.url.as_deref(), Some("redis://127.0.0.1:6379"));
        assert_eq!(config.redis.timeout_ms, 25);
        assert_eq!(config.redis.key_prefix, "nicu:ratelimit");
        assert_eq!(config.local.sweep_interval(), Some(Duration::from_secs(1)));
        assert_eq!(config.policies["auth"].max, 5);
        assert_eq!(config.policies["auth"].window_ms, 600_000);
    }

    #[test]
    fn test_zero_sweep_interval_disables_sweep() {
        let config = LimiterConfig::from_yaml("local:\n  sweep_interval_ms: 0\n").unwrap();
        assert_eq!(config.local.sweep_interval(), None);
    }

    #[test]
    fn test_zero_redis_durations_rejected() {
        for field in ["timeout_ms", "connect_timeout_ms", "health_check_interval_ms"] {
            let yaml = format!("redis:\n  {field}: 0\n");
            let config = LimiterConfig::from_yaml(&yaml).unwrap();
            let err = config.redis.validate().unwrap_err();
            assert!(matches!(err, LimiterError::Config(ref msg) if msg.contains(field)));
        }
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        let err = LimiterConfig::from_yaml("redis: [unterminated").unwrap_err();
        assert!(matches!(err, LimiterError::Config(_)));
    }
}
