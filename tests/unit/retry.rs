//! Retry policy behaviour through the public API

use sensor_data_downloader::downloader::retry::{CircuitState, LinearBackoff};
use sensor_data_downloader::downloader::{CircuitBreaker, RetryPolicy};
use sensor_data_downloader::fetcher::FetcherError;
use sensor_data_downloader::shutdown::ShutdownCoordinator;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;

fn linear(ms: u64) -> LinearBackoff {
    LinearBackoff {
        base: Duration::from_millis(ms),
        increment: Duration::from_millis(ms),
        max: Duration::from_secs(60),
    }
}

#[tokio::test(start_paused = true)]
async fn test_transient_errors_retry_until_success() {
    let policy = RetryPolicy::new(4, linear(100));
    let calls = AtomicU32::new(0);
    let start = Instant::now();

    let value = policy
        .retry("sensor 11", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(FetcherError::NetworkError("reset".into()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await
        .unwrap();

    assert_eq!(value, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // 100ms after the first failure, 200ms after the second
    assert!(start.elapsed() >= Duration::from_millis(300));
}

#[tokio::test(start_paused = true)]
async fn test_definitive_errors_are_not_retried() {
    let policy = RetryPolicy::new(5, linear(100));
    let calls = AtomicU32::new(0);

    let result: Result<(), _> = policy
        .retry("sensor 12", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(FetcherError::DataSourceError("HTTP 404".into())) }
        })
        .await;

    assert!(matches!(result, Err(FetcherError::DataSourceError(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_after_overrides_backoff() {
    let policy = RetryPolicy::new(2, linear(10));
    let start = Instant::now();

    let value = policy
        .retry("archive 2024-01", |attempt| async move {
            if attempt == 1 {
                Err(FetcherError::RateLimitError {
                    retry_after: Some(Duration::from_secs(30)),
                })
            } else {
                Ok(())
            }
        })
        .await;

    assert!(value.is_ok());
    assert!(start.elapsed() >= Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn test_missing_retry_after_uses_fallback() {
    let policy = RetryPolicy::new(3, linear(10)).with_rate_limit_fallback(Duration::from_secs(5));
    let err = FetcherError::RateLimitError { retry_after: None };
    assert_eq!(policy.delay_for(&err, 1), Duration::from_secs(5));
    let err = FetcherError::NetworkError("timeout".into());
    assert_eq!(policy.delay_for(&err, 2), Duration::from_millis(20));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cuts_backoff_short() {
    let shutdown = ShutdownCoordinator::shared();
    let policy = RetryPolicy::new(10, linear(60_000)).with_shutdown(shutdown.clone());
    let calls = AtomicU32::new(0);

    let trigger = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            shutdown.request_shutdown();
        })
    };

    let start = Instant::now();
    let result: Result<(), _> = policy
        .retry("sensor 13", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(FetcherError::NetworkError("reset".into())) }
        })
        .await;
    trigger.await.unwrap();

    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(start.elapsed() < Duration::from_secs(60));
}

#[tokio::test]
async fn test_breaker_opens_and_rejects() {
    let breaker = CircuitBreaker::new(2, Duration::from_secs(3600));
    for _ in 0..2 {
        let _: Result<(), _> = breaker
            .call(async { Err(FetcherError::NetworkError("down".into())) })
            .await;
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let rejected: Result<(), _> = breaker.call(async { Ok(()) }).await;
    assert!(matches!(rejected, Err(FetcherError::CircuitOpen(_))));
}

#[tokio::test]
async fn test_breaker_ignores_definitive_errors() {
    let breaker = CircuitBreaker::new(1, Duration::from_secs(3600));
    let _: Result<(), _> = breaker
        .call(async { Err(FetcherError::DataSourceError("bad request".into())) })
        .await;
    assert_eq!(breaker.state(), CircuitState::Closed);
}
