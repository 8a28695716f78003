//! Persistence boundary for per-key velocity windows and rate-limit timestamps.
//!
//! Callers serialize access per key (see `KeyedLocks`); implementations only
//! need to make single load/save calls atomic.

use crate::window_counter::TrackedEvent;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_window(&self, key: &str) -> Result<Vec<TrackedEvent>>;

    /// Replace the stored window. An empty slice removes the key.
    async fn save_window(&self, key: &str, events: &[TrackedEvent]) -> Result<()>;

    async fn load_timestamps(&self, key: &str) -> Result<Vec<i64>>;

    /// Replace the stored timestamps. An empty slice removes the key.
    async fn save_timestamps(&self, key: &str, timestamps: &[i64]) -> Result<()>;

    /// Remove keys whose newest entry is older than `cutoff_ms`. Returns the
    /// number of keys removed.
    async fn evict_idle(&self, cutoff_ms: i64) -> Result<usize>;
}

#[derive(Default)]
struct MemoryState {
    windows: HashMap<String, Vec<TrackedEvent>>,
    timestamps: HashMap<String, Vec<i64>>,
}

/// Process-local store. Lost on restart.
#[derive(Default)]
pub struct MemoryStateStore {
    state: Mutex<MemoryState>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> Result<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("memory state store lock poisoned"))?;
        Ok(f(&mut state))
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load_window(&self, key: &str) -> Result<Vec<TrackedEvent>> {
        self.with_state(|s| s.windows.get(key).cloned().unwrap_or_default())
    }

    async fn save_window(&self, key: &str, events: &[TrackedEvent]) -> Result<()> {
        self.with_state(|s| {
            if events.is_empty() {
                s.windows.remove(key);
            } else {
                s.windows.insert(key.to_string(), events.to_vec());
            }
        })
    }

    async fn load_timestamps(&self, key: &str) -> Result<Vec<i64>> {
        self.with_state(|s| s.timestamps.get(key).cloned().unwrap_or_default())
    }

    async fn save_timestamps(&self, key: &str, timestamps: &[i64]) -> Result<()> {
        self.with_state(|s| {
            if timestamps.is_empty() {
                s.timestamps.remove(key);
            } else {
                s.timestamps.insert(key.to_string(), timestamps.to_vec());
            }
        })
    }

    async fn evict_idle(&self, cutoff_ms: i64) -> Result<usize> {
        self.with_state(|s| {
            let before = s.windows.len() + s.timestamps.len();
            s.windows.retain(|_, events| {
                events
                    .iter()
                    .map(|e| e.timestamp_ms)
                    .max()
                    .is_some_and(|newest| newest >= cutoff_ms)
            });
            s.timestamps.retain(|_, stamps| {
                stamps
                    .iter()
                    .max()
                    .is_some_and(|newest| *newest >= cutoff_ms)
            });
            before - (s.windows.len() + s.timestamps.len())
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_window_save_and_load() -> Result<()> {
        let store = MemoryStateStore::new();
        assert!(store.load_window("ip:1.2.3.4").await?.is_empty());

        let events = vec![TrackedEvent::new(1, "+1"), TrackedEvent::new(2, "+2")];
        store.save_window("ip:1.2.3.4", &events).await?;
        assert_eq!(store.load_window("ip:1.2.3.4").await?, events);

        store.save_window("ip:1.2.3.4", &[]).await?;
        assert!(store.load_window("ip:1.2.3.4").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_evict_idle() -> Result<()> {
        let store = MemoryStateStore::new();
        store
            .save_window("old", &[TrackedEvent::new(100, "+1")])
            .await?;
        store
            .save_window("fresh", &[TrackedEvent::new(100, "+1"), TrackedEvent::new(900, "+2")])
            .await?;
        store.save_timestamps("api:old", &[50]).await?;
        store.save_timestamps("api:fresh", &[950]).await?;

        assert_eq!(store.evict_idle(500).await?, 2);
        assert!(store.load_window("old").await?.is_empty());
        assert_eq!(store.load_window("fresh").await?.len(), 2);
        assert!(store.load_timestamps("api:old").await?.is_empty());
        assert_eq!(store.load_timestamps("api:fresh").await?, vec![950]);
        Ok(())
    }
}
