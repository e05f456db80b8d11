//! Integration tests for per-key rate limiting

use sensor_data_downloader::downloader::KeyedRateLimiter;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

const INTERVAL: Duration = Duration::from_secs(1);

/// Issue `n` acquires round-robin over `keys`, all at once
async fn grants(limiter: &KeyedRateLimiter, n: usize, keys: &[&str]) -> HashMap<String, Vec<Instant>> {
    let granted: Arc<Mutex<HashMap<String, Vec<Instant>>>> = Arc::default();
    let mut tasks = Vec::new();
    for i in 0..n {
        let key = keys[i % keys.len()].to_string();
        let limiter = limiter.clone();
        let granted = granted.clone();
        tasks.push(tokio::spawn(async move {
            limiter.acquire(&key).await;
            granted
                .lock()
                .unwrap()
                .entry(key)
                .or_default()
                .push(Instant::now());
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    Arc::try_unwrap(granted).unwrap().into_inner().unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_grants_on_one_key_are_an_interval_apart() {
    let limiter = KeyedRateLimiter::new(INTERVAL);
    let start = Instant::now();
    let granted = grants(&limiter, 6, &["key01", "key02"]).await;

    for (key, mut times) in granted {
        times.sort();
        assert_eq!(times.len(), 3, "{key}");
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= INTERVAL, "{key} granted twice within an interval");
        }
    }
    // ceil(6 / 2) grants per key: the last one waits two intervals
    assert!(start.elapsed() >= INTERVAL * 2);
    assert!(start.elapsed() < INTERVAL * 3);
}

#[tokio::test(start_paused = true)]
async fn test_keys_do_not_wait_on_each_other() {
    let limiter = KeyedRateLimiter::new(INTERVAL);
    let start = Instant::now();
    let granted = grants(&limiter, 4, &["a", "b", "c", "d"]).await;

    assert_eq!(granted.len(), 4);
    assert!(start.elapsed() < INTERVAL);
    assert_eq!(limiter.tracked_keys(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_more_keys_finish_sooner() {
    let one_key = KeyedRateLimiter::new(INTERVAL);
    let start = Instant::now();
    grants(&one_key, 8, &["only"]).await;
    let serial = start.elapsed();

    let four_keys = KeyedRateLimiter::new(INTERVAL);
    let start = Instant::now();
    grants(&four_keys, 8, &["k1", "k2", "k3", "k4"]).await;
    let spread = start.elapsed();

    assert!(serial >= INTERVAL * 7);
    assert!(spread >= INTERVAL);
    assert!(spread < serial);
}

#[tokio::test(start_paused = true)]
async fn test_defer_pushes_back_next_grant() {
    let limiter = KeyedRateLimiter::new(INTERVAL);
    limiter.acquire("key01").await;
    limiter.defer("key01", Duration::from_secs(30)).await;

    let waited = limiter.acquire("key01").await;
    assert!(waited >= Duration::from_secs(30));

    // other keys are unaffected
    let waited = limiter.acquire("key02").await;
    assert_eq!(waited, Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_per_minute_budget() {
    let limiter = KeyedRateLimiter::per_minute(60);
    assert_eq!(limiter.interval(), Duration::from_secs(1));

    let start = Instant::now();
    for _ in 0..3 {
        limiter.acquire("key01").await;
    }
    assert!(start.elapsed() >= Duration::from_secs(2));
}
