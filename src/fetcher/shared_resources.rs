//! Shared HTTP client
//!
//! One `reqwest::Client` is shared by every key pool so connection pooling
//! works across concurrent units. The client carries the per-request timeouts
//! that bound individual calls; no timeout governs a job. Archive transfers
//! use their own client with a per-read timeout instead.

use once_cell::sync::OnceCell;
use reqwest::Client;
use std::sync::Arc;

use super::{FetcherError, FetcherResult};
use crate::downloader::config::{HTTP_CONNECT_TIMEOUT, HTTP_REQUEST_TIMEOUT};

static GLOBAL_HTTP_CLIENT: OnceCell<Arc<Client>> = OnceCell::new();

/// Build a client with the standard connect and request timeouts
pub fn build_http_client() -> FetcherResult<Client> {
    Client::builder()
        .connect_timeout(HTTP_CONNECT_TIMEOUT)
        .timeout(HTTP_REQUEST_TIMEOUT)
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| FetcherError::NetworkError(format!("failed to build HTTP client: {e}")))
}

/// Get the process-wide HTTP client, building it on first use
pub fn global_http_client() -> FetcherResult<Arc<Client>> {
    GLOBAL_HTTP_CLIENT
        .get_or_try_init(|| build_http_client().map(Arc::new))
        .cloned()
}
