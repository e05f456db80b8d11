//! Per-key rate limiting
//!
//! Every key owns its own clock: two grants on the same key are always at
//! least `interval` apart, while distinct keys never wait on each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::trace;

use super::config::interval_for_rpm;

type KeyClock = Arc<tokio::sync::Mutex<Option<Instant>>>;

/// Token-interval gate keyed by credential label
#[derive(Clone)]
pub struct KeyedRateLimiter {
    interval: Duration,
    // earliest instant the next grant may happen, per key
    clocks: Arc<Mutex<HashMap<String, KeyClock>>>,
}

impl KeyedRateLimiter {
    /// Create a limiter with a fixed interval between grants on one key
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            clocks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Create a limiter from a requests-per-minute budget
    pub fn per_minute(requests_per_minute: u32) -> Self {
        Self::new(interval_for_rpm(requests_per_minute))
    }

    /// Minimum spacing between two grants on the same key
    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn clock(&self, key: &str) -> KeyClock {
        let mut clocks = self.clocks.lock().unwrap_or_else(PoisonError::into_inner);
        clocks.entry(key.to_string()).or_default().clone()
    }

    /// Suspend until a request under `key` fits the budget, then grant it.
    ///
    /// Waiters on the same key are served in arrival order. Returns the time
    /// spent waiting.
    pub async fn acquire(&self, key: &str) -> Duration {
        let clock = self.clock(key);
        let mut next_allowed = clock.lock().await;

        let requested_at = Instant::now();
        if let Some(ready_at) = *next_allowed {
            if ready_at > requested_at {
                trace!(key, wait_ms = (ready_at - requested_at).as_millis() as u64, "Waiting for key budget");
                sleep_until(ready_at).await;
            }
        }

        let granted_at = Instant::now();
        *next_allowed = Some(granted_at + self.interval);
        let waited = granted_at - requested_at;
        crate::metrics::record_rate_limit_wait(key, waited);
        waited
    }

    /// Push the next grant on `key` back by at least `delay` from now.
    ///
    /// Used after the upstream throttled the key so the penalty is honored by
    /// every caller, not only the one that saw the 429.
    pub async fn defer(&self, key: &str, delay: Duration) {
        let clock = self.clock(key);
        let mut next_allowed = clock.lock().await;
        let candidate = Instant::now() + delay;
        *next_allowed = Some(match *next_allowed {
            Some(current) if current > candidate => current,
            _ => candidate,
        });
    }

    /// Number of keys seen so far
    pub fn tracked_keys(&self) -> usize {
        self.clocks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl std::fmt::Debug for KeyedRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedRateLimiter")
            .field("interval", &self.interval)
            .field("tracked_keys", &self.tracked_keys())
            .finish()
    }
}
