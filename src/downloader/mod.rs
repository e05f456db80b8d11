//! Job orchestration and rate limiting
//!
//! This module provides the execution engine that turns a catalog of units
//! into an append-only output file, one checkpointed unit at a time.
//!
//! # Overview
//!
//! 1. **Job Creation**: describe the run with [`job::Job`] and [`job::JobControls`]
//! 2. **Execution**: [`runner::ResumableJobRunner`] fetches units concurrently,
//!    appends each as one batch and checkpoints it
//! 3. **Rate Limiting**: per-key throttling via [`rate_limit::KeyedRateLimiter`]
//! 4. **Retry**: backoff strategies and a circuit breaker in [`retry`]
//! 5. **Progress**: events aggregated by a single task in [`progress`]
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use sensor_data_downloader::downloader::{Job, JobControls, ResumableJobRunner};
//! use sensor_data_downloader::fetcher::catalog::JsonFileCatalog;
//! use sensor_data_downloader::registry;
//! use sensor_data_downloader::resume::CheckpointStore;
//! use sensor_data_downloader::DateWindow;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let descriptor = registry::lookup("openaq")?;
//! let source = sensor_data_downloader::fetcher::create_source(&descriptor, "./cache".as_ref())?;
//! let window = DateWindow::parse("2024-01-01", "2024-01-31")?;
//!
//! let mut job = Job::new("jp", "openaq", JobControls::new(window, "./output"));
//! let runner = ResumableJobRunner::new(Arc::new(source), CheckpointStore::new("./checkpoints"));
//! let summary = runner.run(&mut job, &JsonFileCatalog::new("locations_jp.json")).await?;
//! println!("{}/{} units failed", summary.failed_units, summary.total_units);
//! # Ok(())
//! # }
//! ```
//!
//! # Error Handling
//!
//! [`runner::ResumableJobRunner::run`] returns `Err(DownloadError)` only for
//! fatal conditions:
//! - output or checkpoint writes failing
//! - corrupt or inconsistent checkpoints
//! - the output file being locked by another process
//!
//! A unit that fails after its retries is counted in the summary instead.

pub mod config;
pub mod job;
pub mod progress;
pub mod rate_limit;
pub mod retry;
pub mod runner;

pub use job::{Job, JobControls, JobStatus};
pub use progress::{ProgressEvent, ProgressTotals};
pub use rate_limit::KeyedRateLimiter;
pub use retry::{CircuitBreaker, RetryPolicy};
pub use runner::{ResumableJobRunner, RunSummary};

use crate::fetcher::FetcherError;
use crate::output::OutputError;
use crate::resume::ResumeError;

/// Job-level errors
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    /// Catalog or source failure outside a unit
    #[error("fetcher error: {0}")]
    FetcherError(#[from] FetcherError),

    /// Checkpoint failure
    #[error("resume error: {0}")]
    ResumeError(#[from] ResumeError),

    /// Output failure
    #[error("output error: {0}")]
    OutputError(#[from] OutputError),

    /// Status machine violation
    #[error("invalid job transition from {from} to {to}")]
    InvalidTransition {
        /// Current status
        from: JobStatus,
        /// Requested status
        to: JobStatus,
    },

    /// Validation error
    #[error("validation error: {0}")]
    ValidationError(String),

    /// A worker task panicked or was cancelled
    #[error("task failed: {0}")]
    TaskFailed(String),
}
