//! Client-visible rate limit headers.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use super::limiter::{LimitDecision, LimitInfo, RateLimitExceeded};
use super::store::StoreKind;

pub const LIMIT_HEADER: &str = "X-RateLimit-Limit";
pub const REMAINING_HEADER: &str = "X-RateLimit-Remaining";
pub const RESET_HEADER: &str = "X-RateLimit-Reset";
pub const STORE_HEADER: &str = "X-RateLimit-Store";
pub const RETRY_AFTER_HEADER: &str = "Retry-After";

/// Anything that can be rendered as rate limit headers.
pub trait RateLimitState {
    fn limit(&self) -> u64;
    fn remaining(&self) -> u64;
    fn reset_time(&self) -> DateTime<Utc>;
    fn store(&self) -> StoreKind;
}

impl RateLimitState for LimitDecision {
    fn limit(&self) -> u64 {
        self.limit
    }
    fn remaining(&self) -> u64 {
        self.remaining
    }
    fn reset_time(&self) -> DateTime<Utc> {
        self.reset_time
    }
    fn store(&self) -> StoreKind {
        self.store
    }
}

impl RateLimitState for LimitInfo {
    fn limit(&self) -> u64 {
        self.limit
    }
    fn remaining(&self) -> u64 {
        self.remaining
    }
    fn reset_time(&self) -> DateTime<Utc> {
        self.reset_time
    }
    fn store(&self) -> StoreKind {
        self.store
    }
}

impl RateLimitState for RateLimitExceeded {
    fn limit(&self) -> u64 {
        self.limit
    }
    fn remaining(&self) -> u64 {
        self.remaining
    }
    fn reset_time(&self) -> DateTime<Utc> {
        self.reset_time
    }
    fn store(&self) -> StoreKind {
        self.store
    }
}

/// The four `X-RateLimit-*` headers. The reset header is in unix seconds,
/// rounded up.
pub fn rate_limit_headers<S: RateLimitState + ?Sized>(state: &S) -> BTreeMap<&'static str, String> {
    let millis = state.reset_time().timestamp_millis();
    let reset_secs = millis.div_euclid(1000) + i64::from(millis.rem_euclid(1000) != 0);

    BTreeMap::from([
        (LIMIT_HEADER, state.limit().to_string()),
        (REMAINING_HEADER, state.remaining().to_string()),
        (RESET_HEADER, reset_secs.to_string()),
        (STORE_HEADER, state.store().to_string()),
    ])
}

/// Headers for a 429 response: the standard four plus `Retry-After`.
pub fn exceeded_headers(err: &RateLimitExceeded) -> BTreeMap<&'static str, String> {
    let mut headers = rate_limit_headers(err);
    headers.insert(RETRY_AFTER_HEADER, err.retry_after_secs.to_string());
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn test_headers_from_decision() {
        let now = Utc::now();
        let decision = LimitDecision {
            allowed: true,
            remaining: 95,
            limit: 100,
            reset_time: now + TimeDelta::milliseconds(60_000),
            store: StoreKind::Memory,
        };

        let headers = rate_limit_headers(&decision);
        assert_eq!(headers.len(), 4);
        assert_eq!(headers[LIMIT_HEADER], "100");
        assert_eq!(headers[REMAINING_HEADER], "95");
        assert_eq!(headers[STORE_HEADER], "memory");

        let reset: i64 = headers[RESET_HEADER].parse().unwrap();
        assert!(reset > now.timestamp_millis().div_euclid(1000));
    }

    #[test]
    fn test_reset_rounds_up_to_whole_seconds() {
        let info = LimitInfo {
            used: 1,
            remaining: 9,
            limit: 10,
            reset_time: DateTime::<Utc>::from_timestamp_millis(1_700_000_000_001).unwrap(),
            store: StoreKind::Redis,
        };
        let headers = rate_limit_headers(&info);
        assert_eq!(headers[RESET_HEADER], "1700000001");
        assert_eq!(headers[STORE_HEADER], "redis");

        let exact = LimitInfo {
            reset_time: DateTime::<Utc>::from_timestamp_millis(1_700_000_000_000).unwrap(),
            ..info
        };
        assert_eq!(rate_limit_headers(&exact)[RESET_HEADER], "1700000000");
    }

    #[test]
    fn test_exceeded_headers_include_retry_after() {
        let err = RateLimitExceeded {
            retry_after_secs: 42,
            limit: 10,
            remaining: 0,
            reset_time: Utc::now() + TimeDelta::seconds(42),
            policy: "heavy".to_string(),
            store: StoreKind::Memory,
        };

        let headers = exceeded_headers(&err);
        assert_eq!(headers.len(), 5);
        assert_eq!(headers[RETRY_AFTER_HEADER], "42");
        assert_eq!(headers[REMAINING_HEADER], "0");
    }
}
