//! Windowed per-key rate limiting for API callers.
//!
//! Counts accepted events inside the trailing window; once `limit` of them
//! are present every call is rejected until the oldest one ages out. Bursts
//! are not smoothed.

use crate::keyed_locks::KeyedLocks;
use crate::state_store::StateStore;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    /// Epoch millis at which the oldest counted event leaves the window
    pub reset_at: i64,
}

pub struct RateLimiter {
    store: Arc<dyn StateStore>,
    locks: KeyedLocks,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(),
        }
    }

    /// Check `key` against the limit and record the attempt if it is allowed.
    #[allow(dead_code)]
    pub async fn check(&self, key: &str, limit: u32, window_ms: i64) -> RateLimitDecision {
        let now = Utc::now().timestamp_millis();
        self.check_at(key, limit, window_ms, now).await
    }

    pub async fn check_at(&self, key: &str, limit: u32, window_ms: i64, now_ms: i64) -> RateLimitDecision {
        let store_key = format!("rl:{}", key);
        let _guard = self.locks.acquire(&store_key).await;

        let loaded = match self.store.load_timestamps(&store_key).await {
            Ok(stamps) => Some(stamps),
            Err(e) => {
                log::error!("Rate limit store load failed for {}: {}", key, e);
                None
            }
        };
        let persist = loaded.is_some();
        let mut stamps = loaded.unwrap_or_default();

        let window_start = now_ms - window_ms;
        stamps.retain(|&ts| ts > window_start);
        stamps.sort_unstable();

        let allowed = stamps.len() < limit as usize;
        if allowed {
            stamps.push(now_ms);
        }
        let remaining = (limit as usize).saturating_sub(stamps.len()) as u32;
        let reset_at = stamps.first().map_or(now_ms + window_ms, |&oldest| oldest + window_ms);

        // A failed load must not overwrite whatever the store still holds
        if persist && (allowed || !stamps.is_empty()) {
            if let Err(e) = self.store.save_timestamps(&store_key, &stamps).await {
                log::error!("Rate limit store save failed for {}: {}", key, e);
            }
        }

        if !allowed {
            log::warn!("Rate limit exceeded for key={}", key);
        }

        RateLimitDecision {
            allowed,
            remaining,
            reset_at,
        }
    }

    /// Drop keys with no event inside `max_window_ms` and release idle locks.
    /// The store may be shared with velocity tracking, so `max_window_ms`
    /// must cover the longest horizon of anything stored in it.
    pub async fn evict_idle(&self, now_ms: i64, max_window_ms: i64) -> usize {
        let removed = match self.store.evict_idle(now_ms - max_window_ms).await {
            Ok(n) => n,
            Err(e) => {
                log::warn!("Rate limit state eviction failed: {}", e);
                0
            }
        };
        self.locks.evict_idle().await;
        removed
    }
}
