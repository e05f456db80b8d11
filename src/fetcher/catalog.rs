//! Unit catalogs
//!
//! A catalog produces the ordered unit list of a job. The position of a unit
//! in that list is its index for checkpointing, so catalogs must return the
//! same order on every call.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::debug;

use super::archive::ArchiveBucket;
use super::{FetcherError, FetcherResult};
use crate::{DateWindow, Unit};

/// Ordered source of units
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Units in processing order
    async fn units(&self) -> FetcherResult<Vec<Unit>>;
}

/// Reject catalogs with duplicate unit keys
pub fn ensure_unique_keys(units: &[Unit]) -> FetcherResult<()> {
    let mut seen = HashSet::with_capacity(units.len());
    for unit in units {
        if !seen.insert(&unit.key) {
            return Err(FetcherError::DataSourceError(format!(
                "duplicate unit key '{}' in catalog",
                unit.key
            )));
        }
    }
    Ok(())
}

/// Fixed list of units
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    units: Vec<Unit>,
}

impl StaticCatalog {
    /// Wrap `units`
    pub fn new(units: Vec<Unit>) -> Self {
        Self { units }
    }
}

#[async_trait]
impl Catalog for StaticCatalog {
    async fn units(&self) -> FetcherResult<Vec<Unit>> {
        ensure_unique_keys(&self.units)?;
        Ok(self.units.clone())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CatalogFile {
    List(Vec<Unit>),
    Wrapped { units: Vec<Unit> },
}

/// Units listed in a JSON file, either as an array or as `{"units": [...]}`
#[derive(Debug, Clone)]
pub struct JsonFileCatalog {
    path: PathBuf,
}

impl JsonFileCatalog {
    /// Catalog backed by `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Catalog for JsonFileCatalog {
    async fn units(&self) -> FetcherResult<Vec<Unit>> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            FetcherError::IoError(format!("failed to read catalog {}: {e}", self.path.display()))
        })?;
        let parsed: CatalogFile = serde_json::from_str(&content).map_err(|e| {
            FetcherError::ParseError(format!("invalid catalog {}: {e}", self.path.display()))
        })?;
        let units = match parsed {
            CatalogFile::List(units) | CatalogFile::Wrapped { units } => units,
        };
        ensure_unique_keys(&units)?;
        debug!(path = %self.path.display(), units = units.len(), "Loaded catalog");
        Ok(units)
    }
}

/// One archive-month unit per month touched by a window
#[derive(Debug, Clone)]
pub struct ArchiveMonthCatalog {
    window: DateWindow,
    group: Option<String>,
}

impl ArchiveMonthCatalog {
    /// Months of `window`, optionally restricted to one group
    pub fn new(window: DateWindow, group: Option<String>) -> Self {
        Self { window, group }
    }
}

#[async_trait]
impl Catalog for ArchiveMonthCatalog {
    async fn units(&self) -> FetcherResult<Vec<Unit>> {
        Ok(ArchiveBucket::covering(&self.window)
            .into_iter()
            .map(|bucket| Unit::archive_month(bucket.year(), bucket.month(), self.group.clone()))
            .collect())
    }
}
