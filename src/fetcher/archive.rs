//! Monthly archive downloader with a verified local cache
//!
//! One file per month lives in the cache directory, named from the bucket
//! (`{prefix}_{YYYY}_{MM}.zip`). A file under that name always opened as a
//! ZIP when it was written; in-progress downloads use a `.tmp` sibling that is
//! resumed with a `Range` request and renamed only after verification.

use chrono::Datelike;
use once_cell::sync::OnceCell;
use regex::Regex;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use zip::ZipArchive;

use super::{FetcherError, FetcherResult};
use crate::downloader::config::{HTTP_CONNECT_TIMEOUT, HTTP_REQUEST_TIMEOUT};
use crate::downloader::retry::RetryPolicy;
use crate::DateWindow;

const DEFAULT_FILE_PREFIX: &str = "archive";
const DEFAULT_URL_TEMPLATE: &str = "{base}/{year}_{month}.zip";

/// A calendar month of archived data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArchiveBucket {
    year: i32,
    month: u32,
}

impl ArchiveBucket {
    /// Create a bucket, rejecting months outside 1-12
    pub fn new(year: i32, month: u32) -> FetcherResult<Self> {
        if !(1..=12).contains(&month) {
            return Err(FetcherError::DataSourceError(format!(
                "invalid archive month {year}-{month}"
            )));
        }
        Ok(Self { year, month })
    }

    /// Year of the bucket
    pub fn year(&self) -> i32 {
        self.year
    }

    /// Month of the bucket
    pub fn month(&self) -> u32 {
        self.month
    }

    /// The following month
    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// Every month from `start` to `end`, inclusive
    pub fn range(start: Self, end: Self) -> Vec<Self> {
        let mut buckets = Vec::new();
        let mut current = start;
        while current <= end {
            buckets.push(current);
            current = current.next();
        }
        buckets
    }

    /// Every month touched by `window`
    pub fn covering(window: &DateWindow) -> Vec<Self> {
        let start = Self {
            year: window.start().year(),
            month: window.start().month(),
        };
        let end = Self {
            year: window.end().year(),
            month: window.end().month(),
        };
        Self::range(start, end)
    }

    /// Parse an archive file name ending in `YYYY_MM.zip`
    pub fn from_file_name(name: &str) -> Option<Self> {
        let caps = link_patterns().ok()?.archive.captures(name)?;
        Self::new(caps[1].parse().ok()?, caps[2].parse().ok()?).ok()
    }
}

impl fmt::Display for ArchiveBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// What is known about one remote archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveDescriptor {
    /// Time bucket
    pub bucket: ArchiveBucket,
    /// Remote URL
    pub url: String,
    /// Local cache path
    pub cache_path: PathBuf,
    /// Whether the cached file exists and opened as an archive
    pub verified: bool,
    /// Size of the cached file in bytes
    pub size: Option<u64>,
}

/// Archive fetcher settings
#[derive(Debug, Clone)]
pub struct ArchiveFetcherConfig {
    base_url: String,
    cache_dir: PathBuf,
    file_prefix: String,
    url_template: String,
    index_url: Option<String>,
    verify_checksum: bool,
    policy: RetryPolicy,
}

impl ArchiveFetcherConfig {
    /// Archives under `base_url`, cached in `cache_dir`
    pub fn new(base_url: impl Into<String>, cache_dir: impl AsRef<Path>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            cache_dir: cache_dir.as_ref().to_path_buf(),
            file_prefix: DEFAULT_FILE_PREFIX.to_string(),
            url_template: DEFAULT_URL_TEMPLATE.to_string(),
            index_url: None,
            verify_checksum: false,
            policy: RetryPolicy::default(),
        }
    }

    /// Cache file prefix (`{prefix}_{YYYY}_{MM}.zip`)
    pub fn with_file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.file_prefix = prefix.into();
        self
    }

    /// URL template with `{base}`, `{year}` and `{month}` placeholders
    pub fn with_url_template(mut self, template: impl Into<String>) -> Self {
        self.url_template = template.into();
        self
    }

    /// Page listing the available archives (defaults to the base URL)
    pub fn with_index_url(mut self, url: impl Into<String>) -> Self {
        self.index_url = Some(url.into());
        self
    }

    /// Verify downloads against a `{url}.CHECKSUM` sidecar
    pub fn with_checksum_sidecar(mut self, enabled: bool) -> Self {
        self.verify_checksum = enabled;
        self
    }

    /// Retry policy for transfers
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Cache directory
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

/// Downloads monthly archives into a verified cache
pub struct ArchiveFetcher {
    client: Arc<Client>,
    config: ArchiveFetcherConfig,
    resolved_urls: Mutex<HashMap<ArchiveBucket, String>>,
    bucket_locks: Mutex<HashMap<ArchiveBucket, Arc<tokio::sync::Mutex<()>>>>,
}

impl ArchiveFetcher {
    /// Create a fetcher with its own streaming-friendly HTTP client
    pub fn new(config: ArchiveFetcherConfig) -> Self {
        // archives can take minutes; bound each read instead of the whole body
        let client = Client::builder()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .read_timeout(HTTP_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Falling back to default HTTP client for archives");
                Client::new()
            });
        Self::with_client(Arc::new(client), config)
    }

    /// Create a fetcher on an existing client
    pub fn with_client(client: Arc<Client>, config: ArchiveFetcherConfig) -> Self {
        Self {
            client,
            config,
            resolved_urls: Mutex::new(HashMap::new()),
            bucket_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Settings in use
    pub fn config(&self) -> &ArchiveFetcherConfig {
        &self.config
    }

    /// Deterministic cache path of `bucket`
    pub fn cache_path(&self, bucket: ArchiveBucket) -> PathBuf {
        self.config.cache_dir.join(format!(
            "{}_{:04}_{:02}.zip",
            self.config.file_prefix,
            bucket.year(),
            bucket.month()
        ))
    }

    /// Remote URL of `bucket`, preferring links found in the index
    pub fn archive_url(&self, bucket: ArchiveBucket) -> String {
        if let Some(url) = self
            .resolved_urls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&bucket)
        {
            return url.clone();
        }
        self.config
            .url_template
            .replace("{base}", &self.config.base_url)
            .replace("{year}", &format!("{:04}", bucket.year()))
            .replace("{month}", &format!("{:02}", bucket.month()))
    }

    fn bucket_lock(&self, bucket: ArchiveBucket) -> Arc<tokio::sync::Mutex<()>> {
        self.bucket_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(bucket)
            .or_default()
            .clone()
    }

    /// Local path of a verified archive for `bucket`.
    ///
    /// Returns the cached file without any network call when it verifies;
    /// otherwise downloads (resuming a `.tmp` partial when possible).
    pub async fn download(&self, bucket: ArchiveBucket) -> FetcherResult<PathBuf> {
        let lock = self.bucket_lock(bucket);
        let _guard = lock.lock().await;

        let final_path = self.cache_path(bucket);
        if tokio::fs::try_exists(&final_path).await.unwrap_or(false) {
            match verify_archive(final_path.clone()).await {
                Ok(()) => {
                    debug!(bucket = %bucket, path = %final_path.display(), "Archive cache hit");
                    crate::metrics::record_archive_download("cache_hit");
                    return Ok(final_path);
                }
                Err(e) => {
                    warn!(bucket = %bucket, error = %e, "Cached archive failed verification, downloading again");
                    tokio::fs::remove_file(&final_path).await?;
                }
            }
        }

        let url = self.archive_url(bucket);
        let label = format!("archive {bucket}");
        let result = self
            .config
            .policy
            .retry(&label, |_| self.fetch_once(bucket, &url, &final_path))
            .await;

        match &result {
            Ok(()) => crate::metrics::record_archive_download("downloaded"),
            Err(_) => crate::metrics::record_archive_download("failed"),
        }
        result.map(|()| final_path)
    }

    /// Drop the cached archive of `bucket` so the next download fetches it again
    pub async fn invalidate(&self, bucket: ArchiveBucket) -> FetcherResult<()> {
        let lock = self.bucket_lock(bucket);
        let _guard = lock.lock().await;
        match tokio::fs::remove_file(self.cache_path(bucket)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Download every bucket in order, collecting per-bucket results
    pub async fn download_range(
        &self,
        buckets: &[ArchiveBucket],
    ) -> Vec<(ArchiveBucket, FetcherResult<PathBuf>)> {
        let mut results = Vec::with_capacity(buckets.len());
        for bucket in buckets {
            results.push((*bucket, self.download(*bucket).await));
        }
        results
    }

    async fn fetch_once(&self, bucket: ArchiveBucket, url: &str, final_path: &Path) -> FetcherResult<()> {
        tokio::fs::create_dir_all(&self.config.cache_dir).await?;
        let tmp_path = tmp_path_for(final_path);
        let offset = tokio::fs::metadata(&tmp_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        let mut request = self.client.get(url);
        if offset > 0 {
            debug!(bucket = %bucket, offset, "Requesting byte range continuation");
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        let mut response = request
            .send()
            .await
            .map_err(|e| FetcherError::NetworkError(format!("archive request failed: {e}")))?;
        let status = response.status();

        let mut file = if status == StatusCode::PARTIAL_CONTENT && offset > 0 {
            let content_range = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            if !content_range.starts_with(&format!("bytes {offset}-")) {
                tokio::fs::remove_file(&tmp_path).await?;
                return Err(FetcherError::ArchiveIntegrityError(format!(
                    "unexpected Content-Range '{content_range}' for offset {offset}"
                )));
            }
            info!(bucket = %bucket, offset, "Resuming partial archive download");
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(&tmp_path)
                .await?
        } else if status == StatusCode::RANGE_NOT_SATISFIABLE && offset > 0 {
            drop(response);
            if verify_archive(tmp_path.clone()).await.is_ok() {
                self.promote(bucket, &tmp_path, final_path).await?;
                return Ok(());
            }
            tokio::fs::remove_file(&tmp_path).await?;
            return Err(FetcherError::ArchiveIntegrityError(
                "partial download could not be resumed".to_string(),
            ));
        } else if status.is_success() {
            if offset > 0 {
                info!(bucket = %bucket, "Server ignored range request, restarting from zero");
            }
            tokio::fs::File::create(&tmp_path).await?
        } else if status == StatusCode::NOT_FOUND {
            return Err(FetcherError::DataSourceError(format!(
                "no archive for {bucket} at {url}"
            )));
        } else if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(FetcherError::RateLimitError {
                retry_after: super::http::parse_retry_after(response.headers()),
            });
        } else if status.is_server_error() {
            return Err(FetcherError::NetworkError(format!(
                "archive download failed: HTTP {status}"
            )));
        } else {
            return Err(FetcherError::DataSourceError(format!(
                "archive download failed: HTTP {status}"
            )));
        };

        // A failure mid-stream keeps the partial .tmp for the next attempt.
        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| FetcherError::NetworkError(format!("archive transfer interrupted: {e}")))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        debug!(bucket = %bucket, bytes = written, "Archive transfer finished");

        if let Err(e) = self.verify_download(url, &tmp_path).await {
            warn!(bucket = %bucket, error = %e, "Downloaded archive failed verification");
            tokio::fs::remove_file(&tmp_path).await?;
            return Err(e);
        }
        self.promote(bucket, &tmp_path, final_path).await
    }

    async fn verify_download(&self, url: &str, tmp_path: &Path) -> FetcherResult<()> {
        verify_archive(tmp_path.to_path_buf()).await?;
        if self.config.verify_checksum {
            let expected = self.download_checksum(&format!("{url}.CHECKSUM")).await?;
            let path = tmp_path.to_path_buf();
            let actual = tokio::task::spawn_blocking(move || compute_sha256(&path))
                .await
                .map_err(|e| FetcherError::IoError(format!("checksum task failed: {e}")))??;
            if !actual.eq_ignore_ascii_case(&expected) {
                return Err(FetcherError::ArchiveIntegrityError(format!(
                    "checksum mismatch: expected {expected}, got {actual}"
                )));
            }
        }
        Ok(())
    }

    async fn download_checksum(&self, checksum_url: &str) -> FetcherResult<String> {
        let response = self
            .client
            .get(checksum_url)
            .send()
            .await
            .map_err(|e| FetcherError::NetworkError(e.to_string()))?;
        if !response.status().is_success() {
            return Err(FetcherError::DataSourceError(format!(
                "CHECKSUM download failed: HTTP {}",
                response.status()
            )));
        }
        let text = response
            .text()
            .await
            .map_err(|e| FetcherError::NetworkError(e.to_string()))?;
        // "hash  filename" or just "hash"
        text.split_whitespace()
            .next()
            .map(str::to_lowercase)
            .ok_or_else(|| FetcherError::DataSourceError("empty CHECKSUM file".to_string()))
    }

    async fn promote(&self, bucket: ArchiveBucket, tmp_path: &Path, final_path: &Path) -> FetcherResult<()> {
        tokio::fs::rename(tmp_path, final_path).await?;
        if let Some(parent) = final_path.parent() {
            if let Ok(dir) = std::fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        info!(bucket = %bucket, path = %final_path.display(), "Archive verified and cached");
        Ok(())
    }

    /// Enumerate archives linked from the index page.
    ///
    /// Links whose file name ends in `YYYY_MM.zip` become descriptors; their
    /// URLs are remembered for later downloads.
    pub async fn list_archives(&self) -> FetcherResult<Vec<ArchiveDescriptor>> {
        let index_url = self
            .config
            .index_url
            .clone()
            .unwrap_or_else(|| format!("{}/", self.config.base_url));
        let response = self
            .client
            .get(&index_url)
            .send()
            .await
            .map_err(|e| FetcherError::NetworkError(format!("index request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(FetcherError::DataSourceError(format!(
                "index request failed: HTTP {}",
                response.status()
            )));
        }
        let html = response
            .text()
            .await
            .map_err(|e| FetcherError::NetworkError(e.to_string()))?;

        let mut found = archive_links(&index_url, &html)?;
        found.sort();
        found.dedup_by_key(|(bucket, _)| *bucket);

        {
            let mut resolved = self
                .resolved_urls
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for (bucket, url) in &found {
                resolved.insert(*bucket, url.clone());
            }
        }

        let mut descriptors = Vec::with_capacity(found.len());
        for (bucket, _) in found {
            descriptors.push(self.archive_info(bucket).await);
        }
        info!(count = descriptors.len(), "Enumerated remote archives");
        Ok(descriptors)
    }

    /// Cache status of `bucket`
    pub async fn archive_info(&self, bucket: ArchiveBucket) -> ArchiveDescriptor {
        let cache_path = self.cache_path(bucket);
        let size = tokio::fs::metadata(&cache_path).await.ok().map(|m| m.len());
        let verified = size.is_some() && verify_archive(cache_path.clone()).await.is_ok();
        ArchiveDescriptor {
            bucket,
            url: self.archive_url(bucket),
            cache_path,
            verified,
            size,
        }
    }
}

fn tmp_path_for(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Check that `path` opens as a ZIP and its central directory is readable
pub async fn verify_archive(path: PathBuf) -> FetcherResult<()> {
    tokio::task::spawn_blocking(move || verify_archive_blocking(&path))
        .await
        .map_err(|e| FetcherError::IoError(format!("verification task failed: {e}")))?
}

fn verify_archive_blocking(path: &Path) -> FetcherResult<()> {
    let file = std::fs::File::open(path)?;
    let mut archive = ZipArchive::new(file).map_err(|e| {
        FetcherError::ArchiveIntegrityError(format!("{}: {e}", path.display()))
    })?;
    for i in 0..archive.len() {
        archive.by_index_raw(i).map_err(|e| {
            FetcherError::ArchiveIntegrityError(format!("{} entry {i}: {e}", path.display()))
        })?;
    }
    Ok(())
}

/// SHA-256 of a file as lowercase hex
pub fn compute_sha256(path: &Path) -> FetcherResult<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

struct LinkPatterns {
    href: Regex,
    archive: Regex,
}

static LINK_PATTERNS: OnceCell<LinkPatterns> = OnceCell::new();

fn link_patterns() -> FetcherResult<&'static LinkPatterns> {
    LINK_PATTERNS.get_or_try_init(|| {
        let compile = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| FetcherError::ParseError(format!("invalid link pattern: {e}")))
        };
        Ok(LinkPatterns {
            // quoted or bare attribute values
            href: compile(r#"(?i)\bhref\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'<>`]+))"#)?,
            archive: compile(r"(?i)(\d{4})_(\d{2})\.zip$")?,
        })
    })
}

/// `href` values of an HTML page, in document order
fn extract_links(html: &str) -> FetcherResult<Vec<String>> {
    let patterns = link_patterns()?;
    Ok(patterns
        .href
        .captures_iter(html)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3)))
        .map(|m| m.as_str().trim().to_string())
        .filter(|href| !href.is_empty())
        .collect())
}

/// Archive links of an index page, resolved against the page URL
fn archive_links(index_url: &str, html: &str) -> FetcherResult<Vec<(ArchiveBucket, String)>> {
    let base = Url::parse(index_url)
        .map_err(|e| FetcherError::DataSourceError(format!("invalid index URL {index_url}: {e}")))?;
    let mut found = Vec::new();
    for href in extract_links(html)? {
        let url = match base.join(&href) {
            Ok(url) => url,
            Err(e) => {
                debug!(href = %href, error = %e, "Skipping unresolvable link");
                continue;
            }
        };
        let bucket = url
            .path_segments()
            .and_then(|segments| segments.last())
            .and_then(ArchiveBucket::from_file_name);
        if let Some(bucket) = bucket {
            found.push((bucket, url.to_string()));
        }
    }
    Ok(found)
}
