//! Fixed-window counter entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::clock::add_duration;

/// Count of requests seen in the current window of one key.
///
/// Entries are plain values; stores hand out copies, never references into
/// their own state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterEntry {
    /// Requests seen in this window, admitted and rejected alike
    pub count: u64,
    /// When this window ends
    pub expires_at: DateTime<Utc>,
}

impl CounterEntry {
    /// First request of a new window starting at `now`.
    pub fn start(now: DateTime<Utc>, window: Duration) -> Self {
        Self {
            count: 1,
            expires_at: add_duration(now, window),
        }
    }

    /// Whether the window has lapsed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Record one more request, rolling over to a fresh window if this one
    /// has lapsed. The expiry is left untouched inside a live window.
    pub fn hit(&mut self, now: DateTime<Utc>, window: Duration) {
        if self.is_expired(now) {
            *self = Self::start(now, window);
        } else {
            self.count = self.count.saturating_add(1);
        }
    }

    /// Time left until the window ends, zero once lapsed.
    pub fn duration_until_reset(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}
