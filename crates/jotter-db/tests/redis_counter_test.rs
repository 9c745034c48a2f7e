//! Integration tests for the Redis counter store.
//!
//! **IMPORTANT**: These tests require a running Redis.
//! Set `REDIS_URL` (default `redis://localhost:16379`) and run with `--ignored`.

use jotter_db::{CounterStore, RedisCounterStore};
use uuid::Uuid;

const DEFAULT_TEST_REDIS_URL: &str = "redis://localhost:16379";

async fn setup_store() -> RedisCounterStore {
    dotenvy::dotenv().ok();
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| DEFAULT_TEST_REDIS_URL.to_string());
    RedisCounterStore::connect(&url)
        .await
        .expect("Failed to connect to test redis")
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_increment_counts_within_window() {
    let store = setup_store().await;
    let key = format!("test:ratelimit:{}", Uuid::new_v4());

    let first = store.increment(&key, 60).await.unwrap();
    assert_eq!(first.count, 1);
    assert!(first.ttl_secs > 0 && first.ttl_secs <= 60);

    let second = store.increment(&key, 60).await.unwrap();
    assert_eq!(second.count, 2);
    assert!(second.ttl_secs <= first.ttl_secs);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_window_expires() {
    let store = setup_store().await;
    let key = format!("test:ratelimit:{}", Uuid::new_v4());

    store.increment(&key, 1).await.unwrap();
    store.increment(&key, 1).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(2100)).await;

    let fresh = store.increment(&key, 1).await.unwrap();
    assert_eq!(fresh.count, 1);
}
