//! Data fetchers
//!
//! A [`UnitSource`] turns one [`Unit`] into normalized [`Record`]s. Two
//! sources ship with the crate: [`MeasurementsSource`] (paged HTTP API behind
//! a multi-key pool) and [`ArchiveSource`] (monthly ZIP archives). The
//! registry resolves a source name into a [`Source`] at startup.

use crate::downloader::RetryPolicy;
use crate::registry::{SourceDescriptor, SourceKind};
use crate::{DateWindow, Record, Unit};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use futures_util::Stream;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

pub mod archive;
pub mod archive_parser;
pub mod catalog;
pub mod credentials;
pub mod http;
pub mod measurements;
pub mod retry_formatter;
pub mod shared_resources;

pub use archive::{ArchiveBucket, ArchiveDescriptor, ArchiveFetcher, ArchiveFetcherConfig};
pub use archive_parser::{NestedArchiveStreamParser, ParseStats, ParserConfig};
pub use catalog::{ArchiveMonthCatalog, Catalog, JsonFileCatalog, StaticCatalog};
pub use credentials::{Credential, CredentialError};
pub use http::{HttpRequest, KeyStats, MultiKeyHttpClient};
pub use measurements::{FieldMapping, MeasurementsConfig, MeasurementsSource};

use archive_parser::ArchiveQuery;
use retry_formatter::RetryErrorType;

/// Fetcher errors
#[derive(Debug, thiserror::Error)]
pub enum FetcherError {
    /// Connectivity problem, timeout or 5xx response
    #[error("network error: {0}")]
    NetworkError(String),

    /// Upstream throttling
    #[error("rate limit exceeded{}", retry_after_suffix(.retry_after))]
    RateLimitError {
        /// Delay requested by the upstream, if any
        retry_after: Option<Duration>,
    },

    /// Credential rejected
    #[error("authentication error: {0}")]
    AuthenticationError(String),

    /// Well-formed but semantically invalid upstream data
    #[error("data source error: {0}")]
    DataSourceError(String),

    /// Corrupt or incomplete archive
    #[error("archive integrity error: {0}")]
    ArchiveIntegrityError(String),

    /// Circuit breaker rejected the call
    #[error("circuit open: {0}")]
    CircuitOpen(String),

    /// Response body could not be decoded
    #[error("parse error: {0}")]
    ParseError(String),

    /// Local file system error
    #[error("IO error: {0}")]
    IoError(String),

    /// No credentials configured
    #[error(transparent)]
    CredentialError(#[from] CredentialError),

    /// Unit kind not handled by this source
    #[error("unsupported unit: {0}")]
    UnsupportedUnit(String),
}

fn retry_after_suffix(retry_after: &Option<Duration>) -> String {
    retry_after
        .map(|d| format!(" (retry after {}s)", d.as_secs()))
        .unwrap_or_default()
}

impl FetcherError {
    /// Whether the error may go away on retry
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetcherError::NetworkError(_)
                | FetcherError::RateLimitError { .. }
                | FetcherError::ArchiveIntegrityError(_)
        )
    }

    /// Classification used for retry log messages
    pub fn classify(&self) -> RetryErrorType {
        match self {
            FetcherError::NetworkError(_) => RetryErrorType::NetworkGeneric,
            FetcherError::RateLimitError { .. } => RetryErrorType::RateLimit,
            FetcherError::AuthenticationError(_) => RetryErrorType::AuthFailed(None),
            FetcherError::ArchiveIntegrityError(_) => RetryErrorType::CorruptArchive,
            FetcherError::CircuitOpen(_) => RetryErrorType::CircuitOpen,
            FetcherError::DataSourceError(_)
            | FetcherError::ParseError(_)
            | FetcherError::UnsupportedUnit(_) => RetryErrorType::InvalidData,
            FetcherError::IoError(_) | FetcherError::CredentialError(_) => {
                RetryErrorType::NetworkGeneric
            }
        }
    }
}

impl From<std::io::Error> for FetcherError {
    fn from(err: std::io::Error) -> Self {
        FetcherError::IoError(err.to_string())
    }
}

/// Result type for fetcher operations
pub type FetcherResult<T> = Result<T, FetcherError>;

/// Stream of records from a fetcher
pub type RecordStream = Pin<Box<dyn Stream<Item = FetcherResult<Record>> + Send>>;

/// Produces the records of one unit
#[async_trait]
pub trait UnitSource: Send + Sync {
    /// Fetch every record of `unit` inside `window`.
    ///
    /// A unit either yields all of its records or an error; callers never see
    /// a partial unit.
    async fn fetch_unit(&self, unit: &Unit, window: &DateWindow) -> FetcherResult<Vec<Record>>;

    /// Short name used in logs
    fn name(&self) -> &str;

    /// Number of independent request lanes (API keys, worker threads)
    fn parallelism(&self) -> usize {
        1
    }
}

/// Records of `units`, in unit order, as a stream.
///
/// A failing unit yields one error item and the stream moves on to the next
/// unit.
pub fn record_stream(source: Arc<dyn UnitSource>, units: Vec<Unit>, window: DateWindow) -> RecordStream {
    let stream = stream::iter(units)
        .then(move |unit| {
            let source = source.clone();
            async move { source.fetch_unit(&unit, &window).await }
        })
        .flat_map(|result| match result {
            Ok(records) => stream::iter(records.into_iter().map(Ok).collect::<Vec<_>>()),
            Err(err) => stream::iter(vec![Err(err)]),
        });
    Box::pin(stream)
}

/// Built-in sources, resolved from the registry
pub enum Source {
    /// Paged HTTP measurements
    Measurements(MeasurementsSource),
    /// Monthly archives
    Archive(ArchiveSource),
}

#[async_trait]
impl UnitSource for Source {
    async fn fetch_unit(&self, unit: &Unit, window: &DateWindow) -> FetcherResult<Vec<Record>> {
        match self {
            Source::Measurements(source) => source.fetch_unit(unit, window).await,
            Source::Archive(source) => source.fetch_unit(unit, window).await,
        }
    }

    fn name(&self) -> &str {
        match self {
            Source::Measurements(source) => source.name(),
            Source::Archive(source) => source.name(),
        }
    }

    fn parallelism(&self) -> usize {
        match self {
            Source::Measurements(source) => source.parallelism(),
            Source::Archive(source) => source.parallelism(),
        }
    }
}

/// Build the source described by `descriptor`.
///
/// HTTP sources read their keys from the environment; archive sources cache
/// into `cache_dir`.
pub fn create_source(descriptor: &SourceDescriptor, cache_dir: &Path) -> FetcherResult<Source> {
    match descriptor.kind {
        SourceKind::Http => {
            let credentials = match &descriptor.credential_prefix {
                Some(prefix) => credentials::credentials_from_env(prefix)?,
                None => Vec::new(),
            };
            let limiter = crate::downloader::KeyedRateLimiter::per_minute(descriptor.requests_per_minute);
            let mut client = MultiKeyHttpClient::new(
                shared_resources::global_http_client()?,
                descriptor.base_url.clone(),
                credentials,
                limiter,
            );
            if let Some(header) = &descriptor.auth_header {
                client = client.with_auth_header(header.clone());
            }
            if let Some(shutdown) = crate::shutdown::get_global_shutdown() {
                client = client.with_retry_policy(RetryPolicy::default().with_shutdown(shutdown));
            }
            let config = MeasurementsConfig::default();
            Ok(Source::Measurements(MeasurementsSource::new(
                descriptor.name.clone(),
                Arc::new(client),
                config,
            )))
        }
        SourceKind::Archive => {
            let mut config = ArchiveFetcherConfig::new(descriptor.base_url.clone(), cache_dir);
            if let Some(prefix) = &descriptor.archive_prefix {
                config = config.with_file_prefix(prefix.clone());
            }
            if let Some(template) = &descriptor.archive_url_template {
                config = config.with_url_template(template.clone());
            }
            if let Some(index) = descriptor.index_url() {
                config = config.with_index_url(index);
            }
            if let Some(shutdown) = crate::shutdown::get_global_shutdown() {
                config = config.with_retry_policy(RetryPolicy::default().with_shutdown(shutdown));
            }
            let fetcher = ArchiveFetcher::new(config);
            let parameter = descriptor
                .parameter
                .clone()
                .unwrap_or_else(|| descriptor.name.clone());
            Ok(Source::Archive(
                ArchiveSource::new(fetcher, ParserConfig::default(), parameter).with_name(descriptor.name.clone()),
            ))
        }
    }
}

/// Archive-backed source: download the unit's month, then parse it
pub struct ArchiveSource {
    name: String,
    fetcher: ArchiveFetcher,
    parser: NestedArchiveStreamParser,
    parameter: String,
}

impl ArchiveSource {
    /// Create a source emitting records for `parameter`
    pub fn new(fetcher: ArchiveFetcher, config: ParserConfig, parameter: impl Into<String>) -> Self {
        Self {
            name: "archive".to_string(),
            fetcher,
            parser: NestedArchiveStreamParser::new(config),
            parameter: parameter.into(),
        }
    }

    /// Set the log name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// The underlying fetcher
    pub fn fetcher(&self) -> &ArchiveFetcher {
        &self.fetcher
    }

    async fn parse(&self, path: PathBuf, query: ArchiveQuery) -> FetcherResult<(Vec<Record>, ParseStats)> {
        let parser = self.parser.clone();
        // decode and parse are CPU bound
        tokio::task::spawn_blocking(move || parser.collect(&path, &query))
            .await
            .map_err(|e| FetcherError::IoError(format!("parser task failed: {e}")))?
    }
}

#[async_trait]
impl UnitSource for ArchiveSource {
    async fn fetch_unit(&self, unit: &Unit, window: &DateWindow) -> FetcherResult<Vec<Record>> {
        let crate::UnitKind::ArchiveMonth { year, month, group } = &unit.kind else {
            return Err(FetcherError::UnsupportedUnit(format!(
                "{} expects archive-month units, got {}",
                self.name, unit.key
            )));
        };

        let bucket = ArchiveBucket::new(*year, *month)?;
        let query = ArchiveQuery {
            group: group.clone(),
            parameter: self.parameter.clone(),
            window: *window,
        };
        let unit_key = unit.key.clone();

        let path = self.fetcher.download(bucket).await?;
        let (records, stats) = match self.parse(path, query.clone()).await {
            Err(FetcherError::ArchiveIntegrityError(reason)) => {
                // central directory was fine but an entry is damaged
                tracing::warn!(unit = %unit_key, %reason, "Cached archive is damaged, downloading again");
                self.fetcher.invalidate(bucket).await?;
                let path = self.fetcher.download(bucket).await?;
                self.parse(path, query).await?
            }
            other => other?,
        };

        tracing::info!(
            unit = %unit_key,
            records = records.len(),
            malformed = stats.malformed_lines,
            out_of_window = stats.out_of_window,
            files = stats.files_parsed,
            "Parsed archive unit"
        );
        Ok(records)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn parallelism(&self) -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(4)
    }
}
