//! Rate limiting logic and counter state management.

mod clock;
mod counter;
mod distributed;
mod headers;
mod key;
mod limiter;
mod local;
mod policy;
mod selector;
mod status;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::CounterEntry;
pub use distributed::RedisCounterStore;
pub use headers::{
    exceeded_headers, rate_limit_headers, RateLimitState, LIMIT_HEADER, REMAINING_HEADER,
    RESET_HEADER, RETRY_AFTER_HEADER, STORE_HEADER,
};
pub use key::CounterKey;
pub use limiter::{LimitDecision, LimitInfo, RateLimitExceeded, RateLimiter, RateLimiterBuilder};
pub use local::LocalCounterStore;
pub use policy::{Policy, PolicyOverride, PolicyRegistry, DEFAULT_POLICY};
pub use selector::BackendSelector;
pub use status::LimiterStatus;
pub use store::{BackendError, CounterStore, StoreKind};
