//! Timestamped event window for a single tracking key.
//!
//! Events are kept in timestamp order so that pruning can drop a prefix and
//! count queries only need to walk the tail.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub const ONE_MINUTE_MS: i64 = 60_000;
pub const FIVE_MINUTES_MS: i64 = 5 * ONE_MINUTE_MS;
pub const ONE_HOUR_MS: i64 = 60 * ONE_MINUTE_MS;
pub const ONE_DAY_MS: i64 = 24 * ONE_HOUR_MS;

/// Retention horizon for every window consumer in this service.
pub const RETENTION_MS: i64 = ONE_DAY_MS;

/// One observed verification request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedEvent {
    pub timestamp_ms: i64,
    pub phone_number: String,
}

impl TrackedEvent {
    pub fn new(timestamp_ms: i64, phone_number: impl Into<String>) -> Self {
        Self {
            timestamp_ms,
            phone_number: phone_number.into(),
        }
    }
}

/// Ordered set of events for one key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowCounter {
    events: Vec<TrackedEvent>,
}

impl WindowCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a counter from persisted events, restoring timestamp order.
    pub fn from_events(mut events: Vec<TrackedEvent>) -> Self {
        events.sort_by_key(|e| e.timestamp_ms);
        Self { events }
    }

    /// Append an event. Out-of-order timestamps are inserted in place.
    pub fn record(&mut self, event: TrackedEvent) {
        let at = self
            .events
            .partition_point(|e| e.timestamp_ms <= event.timestamp_ms);
        self.events.insert(at, event);
    }

    /// Number of events with a timestamp in `[now - window_ms, now]`.
    pub fn count_since(&self, now_ms: i64, window_ms: i64) -> usize {
        self.iter_since(now_ms, window_ms).count()
    }

    /// Distinct phone numbers seen in `[now - window_ms, now]`.
    pub fn distinct_since(&self, now_ms: i64, window_ms: i64) -> HashSet<&str> {
        self.iter_since(now_ms, window_ms)
            .map(|e| e.phone_number.as_str())
            .collect()
    }

    /// Drop every event older than `now - max_age_ms`. Returns how many were removed.
    pub fn prune_older_than(&mut self, now_ms: i64, max_age_ms: i64) -> usize {
        let cutoff = now_ms.saturating_sub(max_age_ms);
        let stale = self.events.partition_point(|e| e.timestamp_ms < cutoff);
        self.events.drain(..stale);
        stale
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn events(&self) -> &[TrackedEvent] {
        &self.events
    }

    fn iter_since(&self, now_ms: i64, window_ms: i64) -> impl Iterator<Item = &TrackedEvent> {
        let cutoff = now_ms.saturating_sub(window_ms);
        let start = self.events.partition_point(|e| e.timestamp_ms < cutoff);
        self.events[start..]
            .iter()
            .take_while(move |e| e.timestamp_ms <= now_ms)
    }
}
