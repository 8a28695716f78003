//! Per-key request velocity tracking with sequential-number detection.
//!
//! The tracking key defaults to the caller IP. The phone prefix is accepted on
//! every call but only becomes part of the key under
//! `VelocityKeying::IpAndPrefix`; with the default keying, pumping from
//! rotating IPs against one number range is not visible here.

use crate::keyed_locks::KeyedLocks;
use crate::phone::parse_phone_number;
use crate::state_store::StateStore;
use crate::window_counter::{
    TrackedEvent, WindowCounter, FIVE_MINUTES_MS, ONE_DAY_MS, ONE_HOUR_MS, ONE_MINUTE_MS,
    RETENTION_MS,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// How velocity tracking keys are derived.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VelocityKeying {
    #[default]
    Ip,
    IpAndPrefix,
}

/// Point-in-time view of a key's recent activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VelocityData {
    pub requests_1min: u32,
    pub requests_5min: u32,
    pub requests_1hr: u32,
    pub requests_24hr: u32,
    pub unique_numbers_1hr: u32,
    pub sequential_detected: bool,
}

impl VelocityData {
    pub fn from_window(window: &WindowCounter, now_ms: i64) -> Self {
        let recent = window.distinct_since(now_ms, ONE_HOUR_MS);
        Self {
            requests_1min: count_u32(window.count_since(now_ms, ONE_MINUTE_MS)),
            requests_5min: count_u32(window.count_since(now_ms, FIVE_MINUTES_MS)),
            requests_1hr: count_u32(window.count_since(now_ms, ONE_HOUR_MS)),
            requests_24hr: count_u32(window.count_since(now_ms, ONE_DAY_MS)),
            unique_numbers_1hr: count_u32(recent.len()),
            sequential_detected: detect_sequential(recent.iter().copied()),
        }
    }
}

fn count_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// True when the numbers, reduced to their last six digits, contain a run of
/// three consecutive integers.
pub fn detect_sequential<'a>(numbers: impl IntoIterator<Item = &'a str>) -> bool {
    let mut tails: Vec<u64> = numbers.into_iter().filter_map(last_six_digits).collect();
    tails.sort_unstable();
    tails.dedup();
    if tails.len() < 3 {
        return false;
    }

    let mut run = 0;
    for pair in tails.windows(2) {
        if pair[1] - pair[0] == 1 {
            run += 1;
            if run >= 2 {
                return true;
            }
        } else {
            run = 0;
        }
    }
    false
}

fn last_six_digits(number: &str) -> Option<u64> {
    let digits: Vec<char> = number.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    let start = digits.len().saturating_sub(6);
    digits[start..].iter().collect::<String>().parse().ok()
}

pub struct VelocityTracker {
    store: Arc<dyn StateStore>,
    locks: KeyedLocks,
    keying: VelocityKeying,
}

impl VelocityTracker {
    pub fn new(store: Arc<dyn StateStore>, keying: VelocityKeying) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(),
            keying,
        }
    }

    pub fn tracking_key(&self, ip: &str, phone_prefix: &str) -> String {
        match self.keying {
            VelocityKeying::Ip => format!("ip:{}", ip),
            VelocityKeying::IpAndPrefix => format!("ip:{}|prefix:{}", ip, phone_prefix),
        }
    }

    #[allow(dead_code)]
    pub async fn get_velocity(&self, ip: &str, phone_prefix: &str, phone_number: &str) -> VelocityData {
        let now = Utc::now().timestamp_millis();
        self.get_velocity_at(ip, phone_prefix, phone_number, now).await
    }

    /// Snapshot the key's window as of `now_ms` without recording anything.
    pub async fn get_velocity_at(
        &self,
        ip: &str,
        phone_prefix: &str,
        _phone_number: &str,
        now_ms: i64,
    ) -> VelocityData {
        let key = self.tracking_key(ip, phone_prefix);
        let _guard = self.locks.acquire(&key).await;
        let window = self.load(&key).await.unwrap_or_default();
        VelocityData::from_window(&window, now_ms)
    }

    /// Append one event for the number's key and prune the retention horizon.
    #[allow(dead_code)]
    pub async fn record(&self, ip: &str, phone_number: &str, timestamp_ms: i64) {
        let prefix = parse_phone_number(phone_number).prefix;
        let key = self.tracking_key(ip, &prefix);
        let _guard = self.locks.acquire(&key).await;
        let Some(mut window) = self.load(&key).await else {
            return;
        };
        window.record(TrackedEvent::new(timestamp_ms, phone_number));
        self.prune(&key, &mut window, timestamp_ms);
        self.save(&key, &window).await;
    }

    /// Snapshot then record under one key guard, so the request is never part
    /// of its own snapshot and concurrent requests cannot interleave.
    pub async fn observe(
        &self,
        ip: &str,
        phone_prefix: &str,
        phone_number: &str,
        now_ms: i64,
    ) -> VelocityData {
        let key = self.tracking_key(ip, phone_prefix);
        let _guard = self.locks.acquire(&key).await;
        let Some(mut window) = self.load(&key).await else {
            return VelocityData::default();
        };
        let snapshot = VelocityData::from_window(&window, now_ms);
        window.record(TrackedEvent::new(now_ms, phone_number));
        self.prune(&key, &mut window, now_ms);
        self.save(&key, &window).await;
        snapshot
    }

    /// Drop stored windows untouched for the retention horizon and release
    /// idle key locks.
    pub async fn evict_idle(&self, now_ms: i64) -> usize {
        let removed = match self.store.evict_idle(now_ms - RETENTION_MS).await {
            Ok(n) => n,
            Err(e) => {
                log::warn!("Velocity state eviction failed: {}", e);
                0
            }
        };
        self.locks.evict_idle().await;
        removed
    }

    /// `None` when the store failed; callers treat that as no prior velocity
    /// and skip saving so stored history is not overwritten.
    async fn load(&self, key: &str) -> Option<WindowCounter> {
        match self.store.load_window(key).await {
            Ok(events) => Some(WindowCounter::from_events(events)),
            Err(e) => {
                log::error!("Velocity store load failed for {}: {}", key, e);
                None
            }
        }
    }

    fn prune(&self, key: &str, window: &mut WindowCounter, now_ms: i64) {
        let pruned = window.prune_older_than(now_ms, RETENTION_MS);
        if pruned > 0 {
            log::debug!("Pruned {} expired events for {}, {} remain", pruned, key, window.len());
        }
    }

    async fn save(&self, key: &str, window: &WindowCounter) {
        if let Err(e) = self.store.save_window(key, window.events()).await {
            log::error!("Velocity store save failed for {}: {}", key, e);
        }
    }
}
