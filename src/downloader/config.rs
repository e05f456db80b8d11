//! Download configuration constants

use std::time::Duration;

/// Default number of attempts per request (first try included).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Base delay of the exponential backoff.
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Upper bound of any computed backoff delay.
pub const BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Multiplier applied per attempt by the exponential backoff.
pub const BACKOFF_FACTOR: f64 = 2.0;

/// Relative jitter range (+/-10%) applied by the jittered backoff.
pub const JITTER_RANGE: f64 = 0.1;

/// Consecutive failures that open the circuit breaker.
pub const CIRCUIT_FAILURE_THRESHOLD: u32 = 5;

/// Time an open circuit waits before allowing a trial call.
pub const CIRCUIT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(60);

/// Delay applied after a 429 response without a usable `Retry-After` header.
pub const RATE_LIMIT_FALLBACK: Duration = Duration::from_secs(5);

/// Requests per minute allowed per API key when the source does not say otherwise.
pub const DEFAULT_REQUESTS_PER_MINUTE: u32 = 60;

/// HTTP connect timeout.
pub const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Overall HTTP request timeout.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on concurrently processed units.
pub const MAX_CONCURRENCY: usize = 32;

/// Measurements requested per page.
pub const PAGE_SIZE: usize = 1000;

/// Pages fetched per sensor before giving up on a unit's tail.
pub const MAX_PAGES_PER_SENSOR: u32 = 16;

/// Records buffered by the CSV sink before an intermediate flush.
pub const FLUSH_INTERVAL: usize = 1_000;

/// Interval between two requests on the same key for a requests-per-minute budget
pub fn interval_for_rpm(requests_per_minute: u32) -> Duration {
    Duration::from_secs_f64(60.0 / f64::from(requests_per_minute.max(1)))
}

/// Derive the default unit concurrency from the number of keys and the
/// average number of requests a unit issues.
pub fn default_concurrency(num_keys: usize, requests_per_unit: usize) -> usize {
    let per_unit = requests_per_unit.max(1);
    num_keys.div_ceil(per_unit).clamp(1, MAX_CONCURRENCY)
}
