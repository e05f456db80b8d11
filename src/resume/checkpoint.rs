//! Checkpoint document and unit completion tracking
//!
//! The cursor is the length of the confirmed-complete prefix of the unit
//! list: every unit below it is in the output file. Units that finished out
//! of order are remembered separately so a resumed run skips them without
//! the cursor ever jumping over an unfinished unit.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{ResumeError, ResumeResult};
use crate::UnitKey;

/// Current checkpoint schema version
pub const SCHEMA_VERSION: u32 = 1;

fn default_version() -> u32 {
    SCHEMA_VERSION
}

/// Persisted progress of one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Schema version
    #[serde(default = "default_version")]
    pub version: u32,
    /// Job identifier
    #[serde(alias = "country_code")]
    pub job_id: String,
    /// Number of leading units known to be complete
    #[serde(alias = "location_index")]
    pub cursor: usize,
    /// Units in the job's catalog
    #[serde(alias = "total_locations")]
    pub total_units: usize,
    /// Keys of the units below the cursor
    #[serde(default, alias = "completed_locations")]
    pub completed: Vec<UnitKey>,
    /// Units finished beyond the cursor
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub completed_ahead: Vec<UnitKey>,
    /// Units that failed in the most recent run
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<UnitKey>,
    /// Output file the completed units were appended to
    pub output_file: PathBuf,
    /// Most recently completed unit
    #[serde(default, alias = "current_location_id")]
    pub current_unit_id: Option<UnitKey>,
    /// Records appended so far
    #[serde(default, alias = "measurement_count")]
    pub records_written: u64,
    /// Time of the write
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl Checkpoint {
    /// Empty checkpoint for a fresh job
    pub fn new(job_id: impl Into<String>, output_file: impl Into<PathBuf>, total_units: usize) -> Self {
        Self {
            version: SCHEMA_VERSION,
            job_id: job_id.into(),
            cursor: 0,
            total_units,
            completed: Vec::new(),
            completed_ahead: Vec::new(),
            failed: Vec::new(),
            output_file: output_file.into(),
            current_unit_id: None,
            records_written: 0,
            timestamp: Utc::now(),
        }
    }

    /// Whether every unit is complete
    pub fn is_complete(&self) -> bool {
        self.cursor >= self.total_units
    }

    /// Completed share of the job in percent
    pub fn progress_percent(&self) -> f64 {
        if self.total_units == 0 {
            return 100.0;
        }
        self.cursor as f64 * 100.0 / self.total_units as f64
    }

    /// Structural checks that need no catalog
    pub fn validate(&self, path: &Path) -> ResumeResult<()> {
        if self.version > SCHEMA_VERSION {
            return Err(ResumeError::UnsupportedVersion {
                found: self.version,
                supported: SCHEMA_VERSION,
            });
        }
        let corrupt = |reason: String| ResumeError::CheckpointCorruption {
            path: path.to_path_buf(),
            reason,
        };
        if self.cursor > self.total_units {
            return Err(corrupt(format!(
                "cursor {} is beyond total_units {}",
                self.cursor, self.total_units
            )));
        }
        if self.completed.len() > self.cursor {
            return Err(corrupt(format!(
                "{} completed units listed for cursor {}",
                self.completed.len(),
                self.cursor
            )));
        }
        Ok(())
    }
}

// Older writers stored naive ISO timestamps in UTC.
fn deserialize_timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{raw}'")))
}

/// Parse an RFC 3339 or naive ISO-8601 (UTC) timestamp
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// One ledger line per checkpoint write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Checkpoint file written
    pub checkpoint_file: PathBuf,
    /// Job identifier
    #[serde(default)]
    pub job_id: String,
    /// Cursor at the time of the write
    #[serde(alias = "location_index")]
    pub cursor: usize,
    /// Units in the job
    #[serde(default, alias = "total_locations")]
    pub total_units: usize,
    /// Records appended so far
    #[serde(default, alias = "measurements_count")]
    pub records_written: Option<u64>,
    /// Time of the write
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    /// Ledger entry for `checkpoint` stored at `checkpoint_file`
    pub fn for_checkpoint(checkpoint: &Checkpoint, checkpoint_file: &Path) -> Self {
        Self {
            checkpoint_file: checkpoint_file.to_path_buf(),
            job_id: checkpoint.job_id.clone(),
            cursor: checkpoint.cursor,
            total_units: checkpoint.total_units,
            records_written: Some(checkpoint.records_written),
            timestamp: checkpoint.timestamp,
        }
    }
}

/// Tracks which units of a run are done and derives the cursor
#[derive(Debug, Clone)]
pub struct CompletionTracker {
    job_id: String,
    output_file: PathBuf,
    keys: Vec<UnitKey>,
    done: Vec<bool>,
    failed: BTreeSet<usize>,
    cursor: usize,
    records_written: u64,
    current: Option<UnitKey>,
}

impl CompletionTracker {
    /// Tracker for a fresh run over `keys`
    pub fn new(job_id: impl Into<String>, output_file: impl Into<PathBuf>, keys: Vec<UnitKey>) -> Self {
        let done = vec![false; keys.len()];
        Self {
            job_id: job_id.into(),
            output_file: output_file.into(),
            keys,
            done,
            failed: BTreeSet::new(),
            cursor: 0,
            records_written: 0,
            current: None,
        }
    }

    /// Tracker continuing from `checkpoint`.
    ///
    /// A cursor past the end of `keys` means the catalog no longer matches
    /// the checkpoint; that is refused rather than guessed around.
    pub fn resume(keys: Vec<UnitKey>, checkpoint: &Checkpoint) -> ResumeResult<Self> {
        if checkpoint.cursor > keys.len() {
            return Err(ResumeError::InconsistentCheckpoint(format!(
                "cursor {} exceeds the {} units in the catalog",
                checkpoint.cursor,
                keys.len()
            )));
        }
        if checkpoint.total_units != keys.len() {
            warn!(
                job_id = %checkpoint.job_id,
                checkpoint_total = checkpoint.total_units,
                catalog_total = keys.len(),
                "Catalog size differs from checkpoint"
            );
        }

        let mut tracker = Self::new(
            checkpoint.job_id.clone(),
            checkpoint.output_file.clone(),
            keys,
        );
        for flag in tracker.done.iter_mut().take(checkpoint.cursor) {
            *flag = true;
        }
        let ahead: Vec<usize> = {
            let index_of: HashMap<&UnitKey, usize> =
                tracker.keys.iter().enumerate().map(|(i, k)| (k, i)).collect();
            checkpoint
                .completed_ahead
                .iter()
                .filter_map(|key| {
                    let index = index_of.get(key).copied();
                    if index.is_none() {
                        warn!(unit = %key, "Checkpoint lists a unit missing from the catalog");
                    }
                    index
                })
                .collect()
        };
        for index in ahead {
            tracker.done[index] = true;
        }
        tracker.cursor = checkpoint.cursor;
        tracker.records_written = checkpoint.records_written;
        tracker.current = checkpoint.current_unit_id.clone();
        tracker.advance();
        debug!(
            job_id = %tracker.job_id,
            cursor = tracker.cursor,
            pending = tracker.pending().len(),
            "Restored completion state"
        );
        Ok(tracker)
    }

    fn advance(&mut self) {
        while self.cursor < self.done.len() && self.done[self.cursor] {
            self.cursor += 1;
        }
    }

    /// Indices of units still to process, in order
    pub fn pending(&self) -> Vec<usize> {
        (self.cursor..self.done.len()).filter(|i| !self.done[*i]).collect()
    }

    /// Record a completed unit; returns whether the cursor moved
    pub fn mark_completed(&mut self, index: usize, records: u64) -> bool {
        let Some(flag) = self.done.get_mut(index) else {
            return false;
        };
        if *flag {
            return false;
        }
        *flag = true;
        self.failed.remove(&index);
        self.records_written += records;
        self.current = Some(self.keys[index].clone());
        let before = self.cursor;
        self.advance();
        self.cursor != before
    }

    /// Record a unit whose retries were exhausted
    pub fn mark_failed(&mut self, index: usize) {
        if index < self.done.len() && !self.done[index] {
            self.failed.insert(index);
        }
    }

    /// Confirmed-prefix cursor
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Units in the run
    pub fn total(&self) -> usize {
        self.keys.len()
    }

    /// Units marked failed and not completed since
    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    /// Records appended by this job, including earlier runs
    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    /// Whether all units are done
    pub fn is_complete(&self) -> bool {
        self.cursor == self.keys.len()
    }

    /// Snapshot for persistence
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            version: SCHEMA_VERSION,
            job_id: self.job_id.clone(),
            cursor: self.cursor,
            total_units: self.keys.len(),
            completed: self.keys[..self.cursor].to_vec(),
            completed_ahead: (self.cursor..self.keys.len())
                .filter(|i| self.done[*i])
                .map(|i| self.keys[i].clone())
                .collect(),
            failed: self.failed.iter().map(|i| self.keys[*i].clone()).collect(),
            output_file: self.output_file.clone(),
            current_unit_id: self.current.clone(),
            records_written: self.records_written,
            timestamp: Utc::now(),
        }
    }
}
