//! Composite counter key generation.

/// A key that uniquely identifies one counter: an identifier under a policy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    /// Client address or authenticated user id
    pub identifier: String,
    /// Policy name as supplied by the caller
    pub policy: String,
}

impl CounterKey {
    /// Create a new counter key.
    pub fn new(identifier: &str, policy: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
            policy: policy.to_string(),
        }
    }

    /// The `identifier:policy` string under which stores keep the counter.
    pub fn to_store_key(&self) -> String {
        format!("{}:{}", self.identifier, self.policy)
    }
}

impl std::fmt::Display for CounterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.identifier, self.policy)
    }
}
