//! NICU rate limiter
//!
//! Fixed-window admission control for the dashboard's request handlers.
//! Counters live in an in-process store or, when configured and reachable, a
//! shared Redis instance; an unreachable Redis falls back to the local store
//! instead of rejecting requests.

pub mod config;
pub mod error;
pub mod ratelimit;

pub use ratelimit::{LimitDecision, LimitInfo, RateLimitExceeded, RateLimiter};
