//! # Sensor Data Downloader Library
//!
//! Acquires large volumes of timestamped sensor measurements (weather, air
//! quality, traffic, fire detection) from external providers under strict
//! per-key rate limits, across jobs that run for hours and survive
//! interruption.
//!
//! ## Features
//!
//! - **Multi-Key HTTP Pool**: least-recently-used key selection, per-key rate
//!   limiting, 429 handling with key rotation, retry and circuit breaker
//! - **Resume Capability**: crash-safe checkpoints per unit with a history
//!   ledger keyed by output file
//! - **Archive Support**: resumable byte-range downloads with a verified local
//!   cache, and a streaming parser for nested, mixed-encoding ZIP archives
//! - **Append-Only Output**: CSV sink with header-once semantics
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use sensor_data_downloader::downloader::{Job, JobControls, ResumableJobRunner};
//! use sensor_data_downloader::fetcher::catalog::ArchiveMonthCatalog;
//! use sensor_data_downloader::fetcher::archive::{ArchiveFetcher, ArchiveFetcherConfig};
//! use sensor_data_downloader::fetcher::archive_parser::ParserConfig;
//! use sensor_data_downloader::fetcher::ArchiveSource;
//! use sensor_data_downloader::resume::CheckpointStore;
//! use sensor_data_downloader::DateWindow;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let window = DateWindow::parse("2024-01-01", "2024-03-31")?;
//! let fetcher = ArchiveFetcher::new(ArchiveFetcherConfig::new("https://example.org/archives", "./cache"));
//! let source = Arc::new(ArchiveSource::new(fetcher, ParserConfig::default(), "traffic_volume"));
//! let catalog = ArchiveMonthCatalog::new(window, Some("tokyo".to_string()));
//!
//! let mut job = Job::new("traffic-tokyo", "traffic", JobControls::new(window, "./output"));
//! let runner = ResumableJobRunner::new(source, CheckpointStore::new("./checkpoints"));
//! let summary = runner.run(&mut job, &catalog).await?;
//! println!("{}/{} units failed", summary.failed_units, summary.total_units);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`downloader`] - job runner, rate limiter, retry policy, progress aggregation
//! - [`fetcher`] - HTTP key pool, archive fetcher, nested archive parser, catalogs
//! - [`output`] - append-only record sinks
//! - [`resume`] - checkpoint store and history ledger
//! - [`registry`] - embedded registry of known sources

#![warn(missing_docs)]
#![warn(clippy::all)]

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// CLI command implementations
pub mod cli;

/// Job orchestration, rate limiting and retry policy
pub mod downloader;

/// Data fetchers for HTTP and archive sources
pub mod fetcher;

/// Metrics collection and Prometheus export
pub mod metrics;

/// Record output writers
pub mod output;

/// Registry of known data sources
pub mod registry;

/// Checkpoint persistence for resumable jobs
pub mod resume;

/// Graceful shutdown coordination shared across modules
pub mod shutdown;

/// Errors raised when a [`Record`] or [`DateWindow`] fails validation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    /// Entity identifier was empty
    #[error("entity_id must not be empty")]
    EmptyEntityId,

    /// Parameter name was empty
    #[error("parameter must not be empty")]
    EmptyParameter,

    /// Window start lies after its end
    #[error("window start ({start}) is after end ({end})")]
    InvertedWindow {
        /// Window start
        start: DateTime<Utc>,
        /// Window end
        end: DateTime<Utc>,
    },

    /// Date string could not be parsed
    #[error("invalid date '{0}': expected YYYY-MM-DD or RFC 3339")]
    InvalidDate(String),
}

/// A single normalized measurement.
///
/// Records are validated at construction and immutable afterwards; they are the
/// only values crossing from the fetchers into a [`output::Sink`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    timestamp: DateTime<Utc>,
    entity_id: String,
    parameter: String,
    value: Decimal,
    unit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    quality_flag: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    metadata: BTreeMap<String, String>,
}

impl Record {
    /// Create a validated record
    pub fn new(
        timestamp: DateTime<Utc>,
        entity_id: impl Into<String>,
        parameter: impl Into<String>,
        value: Decimal,
        unit: impl Into<String>,
    ) -> Result<Self, RecordError> {
        let record = Self {
            timestamp,
            entity_id: entity_id.into(),
            parameter: parameter.into(),
            value,
            unit: unit.into(),
            quality_flag: None,
            metadata: BTreeMap::new(),
        };
        record.validate()?;
        Ok(record)
    }

    /// Attach a quality flag
    pub fn with_quality_flag(mut self, flag: impl Into<String>) -> Self {
        self.quality_flag = Some(flag.into());
        self
    }

    /// Attach a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Validate record integrity
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.entity_id.trim().is_empty() {
            return Err(RecordError::EmptyEntityId);
        }
        if self.parameter.trim().is_empty() {
            return Err(RecordError::EmptyParameter);
        }
        Ok(())
    }

    /// Measurement time in UTC
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Identifier of the measuring entity (location, sensor, counting point)
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Measured parameter name
    pub fn parameter(&self) -> &str {
        &self.parameter
    }

    /// Measured value
    pub fn value(&self) -> Decimal {
        self.value
    }

    /// Unit label of the value
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Optional provider quality flag
    pub fn quality_flag(&self) -> Option<&str> {
        self.quality_flag.as_deref()
    }

    /// Free-form metadata
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }
}

/// Inclusive `[start, end]` time window applied to every fetched record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl DateWindow {
    /// Create a window, rejecting an inverted range
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, RecordError> {
        if start > end {
            return Err(RecordError::InvertedWindow { start, end });
        }
        Ok(Self { start, end })
    }

    /// Parse a window from `YYYY-MM-DD` or RFC 3339 strings.
    ///
    /// A date-only end is extended to the last second of that day so the date
    /// is fully included.
    pub fn parse(start: &str, end: &str) -> Result<Self, RecordError> {
        let start = parse_bound(start, false)?;
        let end = parse_bound(end, true)?;
        Self::new(start, end)
    }

    /// Window start (inclusive)
    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// Window end (inclusive)
    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// Whether `ts` falls inside the window
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }
}

fn parse_bound(input: &str, end_of_day: bool) -> Result<DateTime<Utc>, RecordError> {
    let input = input.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .map_err(|_| RecordError::InvalidDate(input.to_string()))?;
    let naive = if end_of_day {
        date.and_hms_opt(23, 59, 59)
    } else {
        date.and_hms_opt(0, 0, 0)
    }
    .ok_or_else(|| RecordError::InvalidDate(input.to_string()))?;
    Ok(naive.and_utc())
}

/// Stable natural key of a [`Unit`], unique within a job
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct UnitKey(String);

impl UnitKey {
    /// Create a key
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key as string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UnitKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// Older checkpoint files store numeric location ids.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawUnitKey {
    Text(String),
    Number(i64),
}

impl<'de> Deserialize<'de> for UnitKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match RawUnitKey::deserialize(deserializer)? {
            RawUnitKey::Text(text) => UnitKey(text),
            RawUnitKey::Number(n) => UnitKey(n.to_string()),
        })
    }
}

/// Reference to one sensor exposed by an HTTP provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorRef {
    /// Provider sensor id
    pub id: String,
    /// Parameter the sensor measures
    pub parameter: String,
    /// Unit label, when the catalog knows it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

/// What a unit fetches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitKind {
    /// A location with one or more sensors
    Location {
        /// Provider location id, used as the record entity id
        location_id: String,
        /// Human readable location name
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        /// Sensors to fetch
        sensors: Vec<SensorRef>,
    },
    /// A single sensor
    Sensor {
        /// Entity id for produced records
        entity_id: String,
        /// Sensor to fetch
        sensor: SensorRef,
    },
    /// One calendar month of an archive source
    ArchiveMonth {
        /// Year of the bucket
        year: i32,
        /// Month of the bucket (1-12)
        month: u32,
        /// Grouping key of the inner containers to read (e.g. prefecture)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group: Option<String>,
    },
}

/// The atomic resumption granularity of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    /// Natural key
    pub key: UnitKey,
    /// Work description
    #[serde(flatten)]
    pub kind: UnitKind,
}

impl Unit {
    /// Location unit keyed by its location id
    pub fn location(location_id: impl Into<String>, sensors: Vec<SensorRef>) -> Self {
        let location_id = location_id.into();
        Self {
            key: UnitKey::new(location_id.clone()),
            kind: UnitKind::Location {
                location_id,
                name: None,
                sensors,
            },
        }
    }

    /// Sensor unit keyed by the sensor id
    pub fn sensor(entity_id: impl Into<String>, sensor: SensorRef) -> Self {
        Self {
            key: UnitKey::new(sensor.id.clone()),
            kind: UnitKind::Sensor {
                entity_id: entity_id.into(),
                sensor,
            },
        }
    }

    /// Archive-month unit keyed as `YYYY-MM` or `YYYY-MM/group`
    pub fn archive_month(year: i32, month: u32, group: Option<String>) -> Self {
        let key = match &group {
            Some(group) => format!("{year:04}-{month:02}/{group}"),
            None => format!("{year:04}-{month:02}"),
        };
        Self {
            key: UnitKey::new(key),
            kind: UnitKind::ArchiveMonth { year, month, group },
        }
    }

    /// Approximate number of upstream requests needed for this unit
    pub fn request_cost(&self) -> usize {
        match &self.kind {
            UnitKind::Location { sensors, .. } => sensors.len().max(1),
            UnitKind::Sensor { .. } | UnitKind::ArchiveMonth { .. } => 1,
        }
    }
}
