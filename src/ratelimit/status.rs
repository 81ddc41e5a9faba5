//! Operational snapshot of the limiter.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::policy::Policy;
use super::store::StoreKind;

/// What the limiter is running on, for dashboards and the operator CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimiterStatus {
    /// Store the next check would use
    pub store: StoreKind,
    /// Whether a distributed store is configured and reachable
    pub backend_connected: bool,
    /// Entries held by the local store, lapsed ones included
    pub local_store_size: usize,
    pub policies: BTreeMap<String, Policy>,
}
