//! Paged HTTP measurement source
//!
//! Each sensor exposes `GET {endpoint}?datetime_from=..&datetime_to=..&limit=..&page=..`
//! returning a JSON envelope with a result array. Field locations inside a
//! result are configured as JSON pointers so one implementation covers
//! providers with different response shapes.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::http::{HttpRequest, MultiKeyHttpClient};
use super::{FetcherError, FetcherResult, UnitSource};
use crate::downloader::config::{MAX_PAGES_PER_SENSOR, PAGE_SIZE};
use crate::{DateWindow, Record, SensorRef, Unit, UnitKind};

/// JSON pointers locating record fields inside a response
#[derive(Debug, Clone)]
pub struct FieldMapping {
    /// Array of results in the envelope
    pub results: String,
    /// UTC timestamp of a result
    pub timestamp: String,
    /// Numeric value
    pub value: String,
    /// Unit label
    pub unit: String,
    /// Parameter name, used when the catalog does not name one
    pub parameter: String,
    /// Optional quality flag
    pub quality: Option<String>,
}

impl Default for FieldMapping {
    fn default() -> Self {
        Self {
            results: "/results".to_string(),
            timestamp: "/period/datetimeFrom/utc".to_string(),
            value: "/value".to_string(),
            unit: "/parameter/units".to_string(),
            parameter: "/parameter/name".to_string(),
            quality: None,
        }
    }
}

/// Paging and request layout
#[derive(Debug, Clone)]
pub struct MeasurementsConfig {
    /// Endpoint with a `{sensor_id}` placeholder
    pub endpoint_template: String,
    /// Results per page; a shorter page ends paging
    pub page_size: usize,
    /// Hard page cap per sensor
    pub max_pages: u32,
    /// Field locations
    pub fields: FieldMapping,
}

impl Default for MeasurementsConfig {
    fn default() -> Self {
        Self {
            endpoint_template: "/sensors/{sensor_id}/measurements".to_string(),
            page_size: PAGE_SIZE,
            max_pages: MAX_PAGES_PER_SENSOR,
            fields: FieldMapping::default(),
        }
    }
}

/// Measurements API behind a multi-key client pool
pub struct MeasurementsSource {
    name: String,
    client: Arc<MultiKeyHttpClient>,
    config: MeasurementsConfig,
}

impl MeasurementsSource {
    /// Create a source
    pub fn new(name: impl Into<String>, client: Arc<MultiKeyHttpClient>, config: MeasurementsConfig) -> Self {
        Self {
            name: name.into(),
            client,
            config,
        }
    }

    /// The client pool
    pub fn client(&self) -> &Arc<MultiKeyHttpClient> {
        &self.client
    }

    fn endpoint(&self, sensor: &SensorRef) -> String {
        self.config.endpoint_template.replace("{sensor_id}", &sensor.id)
    }

    fn params(&self, window: &DateWindow, page: u32) -> Vec<(String, String)> {
        vec![
            (
                "datetime_from".to_string(),
                window.start().to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
            (
                "datetime_to".to_string(),
                window.end().to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
            ("limit".to_string(), self.config.page_size.to_string()),
            ("page".to_string(), page.to_string()),
        ]
    }

    fn results<'a>(&self, body: &'a Value) -> FetcherResult<&'a [Value]> {
        body.pointer(&self.config.fields.results)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .ok_or_else(|| {
                FetcherError::DataSourceError(format!(
                    "response has no result array at '{}'",
                    self.config.fields.results
                ))
            })
    }

    /// Convert one result; `None` when a required field is missing or invalid
    fn to_record(&self, row: &Value, entity_id: &str, sensor: &SensorRef) -> Option<Record> {
        let fields = &self.config.fields;
        let timestamp = row
            .pointer(&fields.timestamp)
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())?
            .with_timezone(&Utc);
        let value = row.pointer(&fields.value).and_then(decimal_from_json)?;
        let unit = row
            .pointer(&fields.unit)
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| sensor.unit.clone())
            .unwrap_or_default();
        let parameter = if sensor.parameter.is_empty() {
            row.pointer(&fields.parameter)?.as_str()?.to_string()
        } else {
            sensor.parameter.clone()
        };

        let mut record = Record::new(timestamp, entity_id, parameter, value, unit)
            .ok()?
            .with_metadata("sensor_id", sensor.id.clone())
            .with_metadata("source", self.name.clone());
        if let Some(flag) = fields
            .quality
            .as_deref()
            .and_then(|pointer| row.pointer(pointer))
            .and_then(flag_from_json)
        {
            record = record.with_quality_flag(flag);
        }
        Some(record)
    }

    fn collect_page(
        &self,
        rows: &[Value],
        entity_id: &str,
        sensor: &SensorRef,
        window: &DateWindow,
        out: &mut Vec<Record>,
    ) -> usize {
        let mut skipped = 0;
        for row in rows {
            match self.to_record(row, entity_id, sensor) {
                Some(record) if window.contains(record.timestamp()) => out.push(record),
                Some(_) => {}
                None => skipped += 1,
            }
        }
        skipped
    }

    async fn remaining_pages(
        &self,
        entity_id: &str,
        sensor: &SensorRef,
        window: &DateWindow,
        out: &mut Vec<Record>,
    ) -> FetcherResult<usize> {
        let endpoint = self.endpoint(sensor);
        let mut skipped = 0;
        for page in 2..=self.config.max_pages {
            let owned = self.params(window, page);
            let params: Vec<(&str, String)> = owned.iter().map(|(k, v)| (k.as_str(), v.clone())).collect();
            let body: Value = self.client.get(&endpoint, &params).await?;
            let rows = self.results(&body)?;
            skipped += self.collect_page(rows, entity_id, sensor, window, out);
            debug!(sensor = %sensor.id, page, rows = rows.len(), "Fetched measurement page");
            if rows.len() < self.config.page_size {
                return Ok(skipped);
            }
        }
        warn!(
            sensor = %sensor.id,
            max_pages = self.config.max_pages,
            "Page cap reached, later measurements are not available"
        );
        Ok(skipped)
    }
}

fn decimal_from_json(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => {
            let text = n.to_string();
            Decimal::from_str(&text)
                .or_else(|_| Decimal::from_scientific(&text))
                .ok()
        }
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    }
}

fn flag_from_json(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[async_trait]
impl UnitSource for MeasurementsSource {
    async fn fetch_unit(&self, unit: &Unit, window: &DateWindow) -> FetcherResult<Vec<Record>> {
        let (entity_id, sensors): (&str, Vec<&SensorRef>) = match &unit.kind {
            UnitKind::Location {
                location_id,
                sensors,
                ..
            } => (location_id.as_str(), sensors.iter().collect()),
            UnitKind::Sensor { entity_id, sensor } => (entity_id.as_str(), vec![sensor]),
            UnitKind::ArchiveMonth { .. } => {
                return Err(FetcherError::UnsupportedUnit(format!(
                    "{} cannot fetch archive unit {}",
                    self.name, unit.key
                )))
            }
        };
        if sensors.is_empty() {
            debug!(unit = %unit.key, "Unit has no sensors");
            return Ok(Vec::new());
        }

        // first pages of all sensors go out together, one per idle key
        let requests: Vec<HttpRequest> = sensors
            .iter()
            .map(|sensor| HttpRequest::new(self.endpoint(sensor), self.params(window, 1)))
            .collect();
        let first_pages = self.client.get_many(&requests).await;

        let mut records = Vec::new();
        let mut skipped = 0;
        for (sensor, result) in sensors.iter().zip(first_pages) {
            let body = result?;
            let rows = self.results(&body)?;
            skipped += self.collect_page(rows, entity_id, sensor, window, &mut records);
            if rows.len() >= self.config.page_size {
                skipped += self
                    .remaining_pages(entity_id, sensor, window, &mut records)
                    .await?;
            }
        }

        if skipped > 0 {
            warn!(unit = %unit.key, skipped, "Skipped measurements with missing fields");
        }
        info!(
            unit = %unit.key,
            sensors = sensors.len(),
            records = records.len(),
            "Fetched measurements"
        );
        Ok(records)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn parallelism(&self) -> usize {
        self.client.num_keys()
    }
}
