//! Retry classification and log message formatting.
//!
//! Keeps retry log lines uniform across the HTTP pool and the archive fetcher:
//! one line per retry with attempt counters, and one failure summary with a
//! remediation hint once attempts are exhausted.

use reqwest::{Error as ReqwestError, StatusCode};
use std::time::Duration;

/// Classification of retry errors for user messaging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryErrorType {
    /// Network timeout or connection stalled long enough to trigger a timeout
    NetworkTimeout,
    /// Connection refused, DNS failure, or other offline scenarios
    NetworkOffline,
    /// HTTP 429 rate limit exceeded
    RateLimit,
    /// HTTP 5xx server error
    ServerError(u16),
    /// Authentication failures (401/403); `None` when no response carried a status
    AuthFailed(Option<u16>),
    /// Other client errors (4xx, except 429)
    ClientError(u16),
    /// Archive could not be opened or failed its checksum
    CorruptArchive,
    /// Upstream answered with data that could not be used
    InvalidData,
    /// Circuit breaker rejected the call
    CircuitOpen,
    /// Generic fallback when no better classification fits
    NetworkGeneric,
}

impl RetryErrorType {
    /// User-friendly description string used inside retry log messages.
    pub fn description(&self) -> &'static str {
        match self {
            Self::NetworkTimeout => "network timeout",
            Self::NetworkOffline => "connection failed",
            Self::RateLimit => "rate limit exceeded",
            Self::ServerError(code) => match code {
                500 => "internal server error",
                502 => "bad gateway",
                503 => "service unavailable",
                504 => "gateway timeout",
                _ => "server error",
            },
            Self::AuthFailed(code) => match code {
                Some(401) => "authentication failed (401)",
                Some(403) => "authentication failed (403)",
                _ => "authentication failed",
            },
            Self::ClientError(code) => match code {
                404 => "resource not found",
                416 => "range not satisfiable",
                _ => "client error",
            },
            Self::CorruptArchive => "corrupt archive",
            Self::InvalidData => "invalid upstream data",
            Self::CircuitOpen => "circuit open",
            Self::NetworkGeneric => "network error",
        }
    }

    /// Suggested remediation presented after failures.
    pub fn suggestion(&self) -> &'static str {
        match self {
            Self::NetworkTimeout => "Check your network connection and firewall settings",
            Self::NetworkOffline => "Verify internet connectivity and DNS resolution",
            Self::RateLimit => "Add more API keys or lower requests per minute",
            Self::ServerError(_) => "Provider may be experiencing issues, re-run later",
            Self::AuthFailed(_) => "Verify the API keys in your environment or .env file",
            Self::ClientError(_) => "Review the unit catalog and date window",
            Self::CorruptArchive => "Delete the cached archive and re-run to download it again",
            Self::InvalidData => "Provider returned unexpected data; check the field mapping",
            Self::CircuitOpen => "Upstream keeps failing; wait for recovery and re-run",
            Self::NetworkGeneric => "Check network connectivity and try again",
        }
    }
}

/// Context for formatting retry messages.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Current attempt number (1-based)
    pub attempt: u32,
    /// Maximum number of attempts configured
    pub max_attempts: u32,
    /// Type of error that triggered retry
    pub error_type: RetryErrorType,
    /// Backoff duration until next attempt
    pub backoff_duration: Duration,
    /// What was being fetched (endpoint, unit key, archive bucket)
    pub target: String,
    /// Original error message for details
    pub error_message: String,
}

impl RetryContext {
    /// Convenience constructor used throughout the retry logic.
    pub fn new(
        attempt: u32,
        max_attempts: u32,
        error_type: RetryErrorType,
        backoff_duration: Duration,
        target: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            attempt,
            max_attempts,
            error_type,
            backoff_duration,
            target: target.into(),
            error_message: error_message.into(),
        }
    }

    /// Standardized retry message with attempt counters.
    pub fn format_retry(&self) -> String {
        format!(
            "Retrying (attempt {}/{}) after {} - waiting {:.1} seconds... ({})",
            self.attempt + 1,
            self.max_attempts,
            self.error_type.description(),
            self.backoff_duration.as_secs_f64(),
            self.target
        )
    }

    /// Final failure summary with an actionable suggestion.
    pub fn format_failure(&self) -> String {
        [
            format!("[FAILED] {} failed after {} attempts", self.target, self.attempt),
            format!("  Last error: {}", self.error_message),
            format!("  Suggestion: {}", self.error_type.suggestion()),
        ]
        .join("\n")
    }
}

/// Extract a [`RetryErrorType`] from an HTTP status or reqwest error.
pub fn extract_error_type(
    status: Option<StatusCode>,
    err: Option<&ReqwestError>,
) -> RetryErrorType {
    if let Some(status) = status {
        match status.as_u16() {
            401 | 403 => return RetryErrorType::AuthFailed(Some(status.as_u16())),
            408 => return RetryErrorType::NetworkTimeout,
            429 => return RetryErrorType::RateLimit,
            _ => {}
        }

        if status.is_server_error() {
            return RetryErrorType::ServerError(status.as_u16());
        }

        if status.is_client_error() {
            return RetryErrorType::ClientError(status.as_u16());
        }
    }

    if let Some(err) = err {
        if err.is_timeout() {
            return RetryErrorType::NetworkTimeout;
        }

        if err.is_connect() {
            return RetryErrorType::NetworkOffline;
        }
    }

    RetryErrorType::NetworkGeneric
}
