//! Production observability metrics for the sensor data downloader
//!
//! This module records request, retry, rate limiter and job counters through
//! the `metrics` facade.
//!
//! ## Architecture
//!
//! - Uses `metrics` crate for low-overhead metric collection
//! - Prometheus exporter for scraping endpoint (`--metrics-addr`)
//! - Recording is a no-op until [`init_metrics`] installs a recorder

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::Lazy;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Global metrics registry initialization flag
static METRICS_INITIALIZED: Lazy<Arc<RwLock<bool>>> = Lazy::new(|| Arc::new(RwLock::new(false)));

/// Initialize metrics system with Prometheus exporter
///
/// This should be called once at application startup, typically in main().
/// The function is idempotent and will not reinitialize if already called.
///
/// # Arguments
/// * `addr` - Socket address to bind Prometheus scrape endpoint (e.g., "0.0.0.0:9090")
///
/// # Returns
/// Ok(()) if metrics initialized successfully, Err if binding fails
pub async fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    let mut initialized = METRICS_INITIALIZED.write().await;
    if *initialized {
        debug!("Metrics already initialized, skipping");
        return Ok(());
    }

    info!("Initializing metrics system on {}", addr);

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        "http_requests_total",
        Unit::Count,
        "Total number of HTTP requests made per API key"
    );

    describe_counter!(
        "http_429_errors_total",
        Unit::Count,
        "Total number of 429 rate limit errors received per API key"
    );

    describe_histogram!(
        "http_request_duration_seconds",
        Unit::Seconds,
        "HTTP request duration in seconds"
    );

    describe_counter!(
        "retry_attempts_total",
        Unit::Count,
        "Total number of retry attempts"
    );

    describe_histogram!(
        "retry_backoff_duration_seconds",
        Unit::Seconds,
        "Duration of retry backoff in seconds"
    );

    describe_histogram!(
        "rate_limit_wait_seconds",
        Unit::Seconds,
        "Time spent waiting for a key slot"
    );

    describe_counter!(
        "units_completed_total",
        Unit::Count,
        "Units appended to the output and checkpointed"
    );

    describe_counter!(
        "units_failed_total",
        Unit::Count,
        "Units that failed after exhausting retries"
    );

    describe_counter!(
        "records_written_total",
        Unit::Count,
        "Records appended to output files"
    );

    describe_counter!(
        "malformed_lines_total",
        Unit::Count,
        "Archive lines skipped as malformed"
    );

    describe_counter!(
        "archive_downloads_total",
        Unit::Count,
        "Archive download attempts by outcome"
    );

    *initialized = true;
    info!("Metrics system initialized successfully on {}", addr);
    Ok(())
}

/// Check if metrics system is initialized
pub async fn is_initialized() -> bool {
    *METRICS_INITIALIZED.read().await
}

/// Record a completed HTTP request on `key`
pub fn record_http_request(key: &str, status_code: u16, duration: Duration) {
    counter!(
        "http_requests_total",
        "key" => key.to_string(),
        "status" => status_code.to_string(),
    )
    .increment(1);

    histogram!("http_request_duration_seconds").record(duration.as_secs_f64());

    if status_code == 429 {
        counter!("http_429_errors_total", "key" => key.to_string()).increment(1);
        warn!(
            key = %key,
            duration_ms = duration.as_millis(),
            "Rate limit error (429) recorded"
        );
    }
}

/// Record a request that failed without a status code
pub fn record_network_error(key: &str) {
    counter!(
        "http_requests_total",
        "key" => key.to_string(),
        "status" => "network_error",
    )
    .increment(1);
}

/// Record one retry and its backoff
pub fn record_retry(label: &str, backoff: Duration) {
    counter!("retry_attempts_total", "operation" => label.to_string()).increment(1);
    histogram!("retry_backoff_duration_seconds").record(backoff.as_secs_f64());

    debug!(
        operation = %label,
        backoff_ms = backoff.as_millis(),
        "Retry backoff recorded"
    );
}

/// Record time spent waiting for a key slot
pub fn record_rate_limit_wait(key: &str, waited: Duration) {
    histogram!("rate_limit_wait_seconds").record(waited.as_secs_f64());
    if waited.as_millis() > 100 {
        debug!(key = %key, wait_ms = waited.as_millis(), "Key slot granted after wait");
    }
}

/// Record a unit appended and checkpointed
pub fn record_unit_completed() {
    counter!("units_completed_total").increment(1);
}

/// Record a unit that exhausted its retries
pub fn record_unit_failed() {
    counter!("units_failed_total").increment(1);
}

/// Record appended records
pub fn record_records_written(count: u64) {
    counter!("records_written_total").increment(count);
}

/// Record skipped malformed archive lines
pub fn record_malformed_lines(count: u64) {
    if count > 0 {
        counter!("malformed_lines_total").increment(count);
    }
}

/// Record an archive download attempt; `outcome` is `cache_hit`, `downloaded` or `failed`
pub fn record_archive_download(outcome: &str) {
    counter!("archive_downloads_total", "outcome" => outcome.to_string()).increment(1);
}
