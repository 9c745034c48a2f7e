//! Redis fixed-window counters for rate limiting.
//!
//! One Lua script does `INCR`, sets the window expiry on the first hit and
//! reads back the TTL, so the three steps are atomic per key even with many
//! API processes sharing one Redis.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::{debug, info};

use jotter_core::{CounterSnapshot, CounterStore, Error, Result};

const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('TTL', KEYS[1])
if ttl < 0 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
    ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

/// Counter store backed by Redis.
#[derive(Clone)]
pub struct RedisCounterStore {
    connection: ConnectionManager,
    script: Script,
}

impl RedisCounterStore {
    /// Connect to Redis at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| Error::Redis(e.to_string()))?;
        let connection = ConnectionManager::new(client)
            .await
            .map_err(|e| Error::Redis(e.to_string()))?;

        info!(
            subsystem = "db",
            component = "redis_counters",
            op = "connect",
            "Redis counter store connected"
        );
        Ok(Self::from_connection(connection))
    }

    pub fn from_connection(connection: ConnectionManager) -> Self {
        Self {
            connection,
            script: Script::new(INCREMENT_SCRIPT),
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, window_secs: u64) -> Result<CounterSnapshot> {
        let mut conn = self.connection.clone();
        let (count, ttl): (i64, i64) = self
            .script
            .key(key)
            .arg(window_secs.max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Error::Redis(e.to_string()))?;

        debug!(
            subsystem = "db",
            component = "redis_counters",
            op = "increment",
            key,
            count,
            ttl,
            "Counter incremented"
        );

        Ok(CounterSnapshot {
            count: count.max(0) as u64,
            ttl_secs: ttl.max(0) as u64,
        })
    }
}
