//! Multi-key HTTP client pool
//!
//! Requests are issued on the least recently used idle key. Each key has at
//! most one request in flight and its own rate-limit clock, so N keys give up
//! to N times the single-key throughput. 429 responses defer the throttled key
//! and move the retry to a different key; 5xx and transport errors follow the
//! [`RetryPolicy`]; the whole retried call runs through a [`CircuitBreaker`].

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore, SemaphorePermit};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::credentials::Credential;
use super::retry_formatter::{extract_error_type, RetryContext, RetryErrorType};
use super::{FetcherError, FetcherResult};
use crate::downloader::rate_limit::KeyedRateLimiter;
use crate::downloader::retry::{CircuitBreaker, RetryPolicy};

/// Default header carrying the API key
pub const DEFAULT_AUTH_HEADER: &str = "X-API-Key";

/// One request for [`MultiKeyHttpClient::get_many`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Endpoint path appended to the base URL
    pub endpoint: String,
    /// Query parameters
    pub params: Vec<(String, String)>,
}

impl HttpRequest {
    /// Create a request
    pub fn new(endpoint: impl Into<String>, params: Vec<(String, String)>) -> Self {
        Self {
            endpoint: endpoint.into(),
            params,
        }
    }
}

/// Per-key usage counters, exposed for diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyStats {
    /// Key label
    pub label: String,
    /// Requests sent with this key
    pub request_count: u64,
    /// Failed requests with this key
    pub error_count: u64,
}

#[derive(Debug)]
struct KeySlot {
    credential: Option<Credential>,
    label: String,
    last_request_time: Option<Instant>,
    request_count: u64,
    error_count: u64,
    in_flight: bool,
}

/// Outcome of one request on one key
struct Attempt<T> {
    /// Slot used, if one was leased
    index: Option<usize>,
    /// Classification from the HTTP status or transport error
    kind: Option<RetryErrorType>,
    result: FetcherResult<T>,
}

/// Exclusive use of one key slot; released on drop
struct KeyLease<'a> {
    pool: &'a MultiKeyHttpClient,
    index: usize,
    label: String,
    secret: Option<String>,
    _permit: SemaphorePermit<'a>,
}

impl Drop for KeyLease<'_> {
    fn drop(&mut self) {
        let mut slots = self.pool.lock_slots();
        if let Some(slot) = slots.get_mut(self.index) {
            slot.in_flight = false;
        }
        drop(slots);
        self.pool.released.notify_waiters();
    }
}

/// HTTP client that spreads requests over a pool of API keys
pub struct MultiKeyHttpClient {
    client: Arc<Client>,
    base_url: String,
    auth_header: String,
    slots: Mutex<Vec<KeySlot>>,
    idle: Semaphore,
    // signalled whenever a lease ends
    released: Notify,
    limiter: KeyedRateLimiter,
    policy: RetryPolicy,
    breaker: CircuitBreaker,
}

impl MultiKeyHttpClient {
    /// Create a pool over `credentials`.
    ///
    /// Without credentials the pool has a single anonymous slot that sends no
    /// auth header.
    pub fn new(
        client: Arc<Client>,
        base_url: impl Into<String>,
        credentials: Vec<Credential>,
        limiter: KeyedRateLimiter,
    ) -> Self {
        let slots: Vec<KeySlot> = if credentials.is_empty() {
            vec![KeySlot::new(None, "anonymous".to_string())]
        } else {
            credentials
                .into_iter()
                .map(|c| {
                    let label = c.label().to_string();
                    KeySlot::new(Some(c), label)
                })
                .collect()
        };
        let idle = Semaphore::new(slots.len());
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_header: DEFAULT_AUTH_HEADER.to_string(),
            slots: Mutex::new(slots),
            idle,
            released: Notify::new(),
            limiter,
            policy: RetryPolicy::default(),
            breaker: CircuitBreaker::default(),
        }
    }

    /// Use a different header name for the API key
    pub fn with_auth_header(mut self, header: impl Into<String>) -> Self {
        self.auth_header = header.into();
        self
    }

    /// Replace the retry policy
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replace the circuit breaker
    pub fn with_circuit_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = breaker;
        self
    }

    /// Number of key slots
    pub fn num_keys(&self) -> usize {
        self.lock_slots().len()
    }

    /// Base URL requests are issued against
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The breaker guarding this pool
    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Request and error counters per key, in key order
    pub fn key_stats(&self) -> Vec<KeyStats> {
        self.lock_slots()
            .iter()
            .map(|s| KeyStats {
                label: s.label.clone(),
                request_count: s.request_count,
                error_count: s.error_count,
            })
            .collect()
    }

    fn lock_slots(&self) -> MutexGuard<'_, Vec<KeySlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// GET `endpoint` and deserialize the JSON body
    pub async fn get<T>(&self, endpoint: &str, params: &[(&str, String)]) -> FetcherResult<T>
    where
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, endpoint);
        debug!("Making GET request to: {} with {} params", url, params.len());
        self.breaker
            .call(self.request_with_retry(&url, endpoint, params))
            .await
    }

    /// Issue many GETs concurrently across all keys.
    ///
    /// Results come back in submission order. At most one request per key is
    /// in flight; the rest queue for an idle key.
    pub async fn get_many(&self, requests: &[HttpRequest]) -> Vec<FetcherResult<serde_json::Value>> {
        let calls = requests.iter().map(|request| {
            let params: Vec<(&str, String)> = request
                .params
                .iter()
                .map(|(k, v)| (k.as_str(), v.clone()))
                .collect();
            async move { self.get(&request.endpoint, &params).await }
        });
        futures::future::join_all(calls).await
    }

    async fn request_with_retry<T>(
        &self,
        url: &str,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> FetcherResult<T>
    where
        T: DeserializeOwned,
    {
        let max_attempts = self.policy.max_attempts();
        // keys that answered 401/403 during this call are never used again for it
        let mut rejected: HashSet<usize> = HashSet::new();
        let mut avoid: Option<usize> = None;
        let mut attempt = 1;

        loop {
            let Attempt { index, kind, result } =
                self.attempt_once(url, params, &rejected, avoid).await;
            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if let (FetcherError::AuthenticationError(_), Some(index)) = (&err, index) {
                rejected.insert(index);
                if rejected.len() >= self.num_keys() {
                    error!(endpoint, keys = rejected.len(), "Every API key was rejected");
                    return Err(err);
                }
            }

            let retryable =
                err.is_transient() || matches!(err, FetcherError::AuthenticationError(_));
            let delay = match err {
                FetcherError::AuthenticationError(_) => Duration::ZERO,
                _ => self.policy.delay_for(&err, attempt),
            };
            let context = RetryContext::new(
                attempt,
                max_attempts,
                kind.unwrap_or_else(|| err.classify()),
                delay,
                endpoint,
                err.to_string(),
            );

            if !retryable {
                return Err(err);
            }
            if attempt >= max_attempts {
                error!("{}", context.format_failure());
                return Err(err);
            }

            avoid = None;
            if let (FetcherError::RateLimitError { .. }, Some(index)) = (&err, index) {
                if let Some(label) = self.label_of(index) {
                    self.limiter.defer(&label, delay).await;
                }
                avoid = Some(index);
            }

            warn!("{}", context.format_retry());
            crate::metrics::record_retry(endpoint, delay);
            if !delay.is_zero() && !self.policy.pause(delay).await {
                return Err(err);
            }
            attempt += 1;
        }
    }

    async fn attempt_once<T>(
        &self,
        url: &str,
        params: &[(&str, String)],
        rejected: &HashSet<usize>,
        avoid: Option<usize>,
    ) -> Attempt<T>
    where
        T: DeserializeOwned,
    {
        match self.checkout(rejected, avoid).await {
            Ok(lease) => self.send_with(lease, url, params).await,
            Err(e) => Attempt {
                index: None,
                kind: None,
                result: Err(e),
            },
        }
    }

    async fn send_with<T>(&self, lease: KeyLease<'_>, url: &str, params: &[(&str, String)]) -> Attempt<T>
    where
        T: DeserializeOwned,
    {
        let index = lease.index;
        let failed = |kind: RetryErrorType, err: FetcherError| Attempt {
            index: Some(index),
            kind: Some(kind),
            result: Err(err),
        };

        self.limiter.acquire(&lease.label).await;
        self.note_sent(index);

        let mut request = self.client.get(url).query(params);
        if let Some(secret) = &lease.secret {
            request = request.header(self.auth_header.as_str(), secret.as_str());
        }

        let started = std::time::Instant::now();
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                self.note_error(index);
                crate::metrics::record_network_error(&lease.label);
                let kind = extract_error_type(None, Some(&e));
                return failed(
                    kind,
                    FetcherError::NetworkError(format!("{}: {e}", kind.description())),
                );
            }
        };

        let status = response.status();
        let kind = extract_error_type(Some(status), None);
        crate::metrics::record_http_request(&lease.label, status.as_u16(), started.elapsed());

        if status == StatusCode::TOO_MANY_REQUESTS {
            self.note_error(index);
            let retry_after = parse_retry_after(response.headers());
            warn!(key = %lease.label, retry_after = ?retry_after, "Key throttled by upstream (429)");
            return failed(kind, FetcherError::RateLimitError { retry_after });
        }

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            self.note_error(index);
            return failed(
                kind,
                FetcherError::AuthenticationError(format!("key {} rejected with {status}", lease.label)),
            );
        }

        if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
            self.note_error(index);
            return failed(kind, FetcherError::NetworkError(format!("server error {status}")));
        }

        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(200).collect();
            return failed(kind, FetcherError::DataSourceError(format!("HTTP {status}: {body}")));
        }

        let result = response.json::<T>().await.map_err(|e| {
            FetcherError::ParseError(format!("Failed to deserialize response: {e}"))
        });
        drop(lease);
        Attempt {
            index: Some(index),
            kind: None,
            result,
        }
    }

    /// Lease the least recently used idle key outside `rejected`.
    ///
    /// `avoid` is only a preference. Waits for a release when every idle key
    /// is rejected, and fails once all keys are.
    async fn checkout(
        &self,
        rejected: &HashSet<usize>,
        avoid: Option<usize>,
    ) -> FetcherResult<KeyLease<'_>> {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let permit = self
                .idle
                .acquire()
                .await
                .map_err(|e| FetcherError::NetworkError(format!("key pool closed: {e}")))?;

            {
                let mut slots = self.lock_slots();
                if (0..slots.len()).all(|i| rejected.contains(&i)) {
                    return Err(FetcherError::AuthenticationError(format!(
                        "all {} keys were rejected",
                        slots.len()
                    )));
                }
                let chosen = slots
                    .iter()
                    .enumerate()
                    .filter(|(i, slot)| !slot.in_flight && !rejected.contains(i))
                    .min_by_key(|(i, slot)| (Some(*i) == avoid, slot.last_request_time))
                    .map(|(i, _)| i);
                if let Some(index) = chosen {
                    let slot = &mut slots[index];
                    slot.in_flight = true;
                    slot.last_request_time = Some(Instant::now());
                    return Ok(KeyLease {
                        pool: self,
                        index,
                        label: slot.label.clone(),
                        secret: slot.credential.as_ref().map(|c| c.secret().to_string()),
                        _permit: permit,
                    });
                }
            }

            drop(permit);
            released.await;
        }
    }

    fn label_of(&self, index: usize) -> Option<String> {
        self.lock_slots().get(index).map(|s| s.label.clone())
    }

    fn note_sent(&self, index: usize) {
        if let Some(slot) = self.lock_slots().get_mut(index) {
            slot.request_count += 1;
        }
    }

    fn note_error(&self, index: usize) {
        if let Some(slot) = self.lock_slots().get_mut(index) {
            slot.error_count += 1;
        }
    }
}

impl KeySlot {
    fn new(credential: Option<Credential>, label: String) -> Self {
        Self {
            credential,
            label,
            last_request_time: None,
            request_count: 0,
            error_count: 0,
            in_flight: false,
        }
    }
}

impl std::fmt::Debug for MultiKeyHttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiKeyHttpClient")
            .field("base_url", &self.base_url)
            .field("keys", &self.num_keys())
            .finish()
    }
}

/// Parse `Retry-After` as delta-seconds or an HTTP date
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let date = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = date.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}
