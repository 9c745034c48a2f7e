use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use jotter_core::{CounterSnapshot, CounterStore, Result};

/// In-memory fixed-window counters.
#[derive(Default)]
pub struct MemoryCounterStore {
    counters: Mutex<HashMap<String, (u64, Instant)>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str, window_secs: u64) -> Result<CounterSnapshot> {
        let now = Instant::now();
        let mut counters = self.counters.lock().await;
        counters.retain(|_, (_, expires_at)| *expires_at > now);

        let (count, expires_at) = counters
            .entry(key.to_string())
            .or_insert_with(|| (0, now + Duration::from_secs(window_secs.max(1))));
        *count += 1;

        let remaining = expires_at.saturating_duration_since(now);
        let ttl_secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
        Ok(CounterSnapshot {
            count: *count,
            ttl_secs,
        })
    }
}
