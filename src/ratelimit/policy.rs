//! Named rate limit policies.
//!
//! Policies are fixed when the registry is built. Lookups never fail: an
//! unknown name resolves to the `default` policy.

use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{LimiterError, Result};

/// Name of the fallback policy.
pub const DEFAULT_POLICY: &str = "default";

/// Longest window a policy may configure (366 days).
const MAX_WINDOW_MS: u64 = 366 * 24 * 60 * 60 * 1000;

/// Baseline policy table as `(name, window_ms, max)`.
const BASELINE: &[(&str, u64, u64)] = &[
    (DEFAULT_POLICY, 60_000, 100),
    ("auth", 300_000, 10),
    ("api", 60_000, 60),
    ("heavy", 60_000, 10),
    ("realtime", 1_000, 20),
];

/// Distinct unknown names remembered for warn-once logging.
const MAX_WARNED_NAMES: usize = 1024;

/// A named fixed-window rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Policy name
    pub name: String,
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Requests admitted per window
    pub max: u64,
}

impl Policy {
    /// Create a policy, rejecting empty windows and zero ceilings.
    pub fn new(name: impl Into<String>, window_ms: u64, max: u64) -> Result<Self> {
        let name = name.into();
        if window_ms == 0 || window_ms > MAX_WINDOW_MS {
            return Err(LimiterError::Config(format!(
                "policy '{name}': window_ms must be in 1..={MAX_WINDOW_MS}, got {window_ms}"
            )));
        }
        if max == 0 {
            return Err(LimiterError::Config(format!(
                "policy '{name}': max must be greater than zero"
            )));
        }
        Ok(Self {
            name,
            window_ms,
            max,
        })
    }

    /// Window length as a duration.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Window and ceiling supplied by configuration for a named policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyOverride {
    pub window_ms: u64,
    pub max: u64,
}

/// Static mapping from policy name to [`Policy`].
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    policies: BTreeMap<String, Policy>,
    default: Policy,
    warned: Arc<DashSet<String>>,
}

impl PolicyRegistry {
    /// Registry holding the baseline table.
    pub fn new() -> Self {
        let policies: BTreeMap<String, Policy> = BASELINE
            .iter()
            .map(|&(name, window_ms, max)| {
                (
                    name.to_string(),
                    Policy {
                        name: name.to_string(),
                        window_ms,
                        max,
                    },
                )
            })
            .collect();
        let default = policies
            .get(DEFAULT_POLICY)
            .cloned()
            .unwrap_or_else(baseline_default);
        Self {
            policies,
            default,
            warned: Arc::new(DashSet::new()),
        }
    }

    /// Baseline table with configured overrides applied.
    ///
    /// Overrides may replace baseline entries (including `default`) or add
    /// new names.
    pub fn with_overrides<'a, I>(overrides: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a String, &'a PolicyOverride)>,
    {
        let mut registry = Self::new();
        for (name, rule) in overrides {
            let policy = Policy::new(name.clone(), rule.window_ms, rule.max)?;
            if name == DEFAULT_POLICY {
                registry.default = policy.clone();
            }
            registry.policies.insert(name.clone(), policy);
        }
        Ok(registry)
    }

    /// Get the named policy, or `default` if the name is unknown.
    ///
    /// Each unknown name is logged at `warn` the first time it is seen and at
    /// `debug` afterwards.
    pub fn get(&self, name: &str) -> &Policy {
        if let Some(policy) = self.policies.get(name) {
            return policy;
        }
        if self.first_miss(name) {
            warn!(policy = %name, "Unknown rate limit policy, using default");
        } else {
            debug!(policy = %name, "Unknown rate limit policy, using default");
        }
        self.default_policy()
    }

    fn first_miss(&self, name: &str) -> bool {
        if self.warned.contains(name) || self.warned.len() >= MAX_WARNED_NAMES {
            return false;
        }
        self.warned.insert(name.to_string())
    }

    /// Whether a policy with this exact name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.policies.contains_key(name)
    }

    /// The `default` policy.
    pub fn default_policy(&self) -> &Policy {
        &self.default
    }

    /// All registered policies, ordered by name.
    pub fn policies(&self) -> &BTreeMap<String, Policy> {
        &self.policies
    }
}

fn baseline_default() -> Policy {
    Policy {
        name: DEFAULT_POLICY.to_string(),
        window_ms: 60_000,
        max: 100,
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}
