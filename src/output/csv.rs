//! CSV sink
//!
//! The output file is only ever opened in append mode. The header row is
//! written when the file is empty at open time, so a resumed job never writes
//! it twice.

use crate::downloader::config::FLUSH_INTERVAL;
use crate::Record;
use chrono::SecondsFormat;
use csv::{Writer, WriterBuilder};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{OutputError, OutputResult, Sink};

const DEFAULT_BUFFER_SIZE: usize = 8192; // 8KB buffer

/// Column names of the output file
pub const HEADER: [&str; 7] = [
    "timestamp",
    "entity_id",
    "parameter",
    "value",
    "unit",
    "quality_flag",
    "metadata",
];

/// CSV row for one record
#[derive(Debug, Serialize)]
struct CsvRow<'a> {
    timestamp: String,
    entity_id: &'a str,
    parameter: &'a str,
    value: String,
    unit: &'a str,
    quality_flag: &'a str,
    metadata: String,
}

impl<'a> CsvRow<'a> {
    fn from_record(record: &'a Record) -> OutputResult<Self> {
        let metadata = if record.metadata().is_empty() {
            String::new()
        } else {
            serde_json::to_string(record.metadata())
                .map_err(|e| OutputError::SerializationError(e.to_string()))?
        };
        Ok(Self {
            timestamp: record.timestamp().to_rfc3339_opts(SecondsFormat::Secs, true),
            entity_id: record.entity_id(),
            parameter: record.parameter(),
            value: record.value().to_string(),
            unit: record.unit(),
            quality_flag: record.quality_flag().unwrap_or_default(),
            metadata,
        })
    }
}

/// Append-only CSV file sink
pub struct CsvSink {
    path: PathBuf,
    writer: Option<Writer<BufWriter<File>>>,
    records_written: u64,
    since_flush: usize,
}

impl CsvSink {
    /// Open `path` for appending, creating it (and its directory) if needed
    pub fn open<P: AsRef<Path>>(path: P) -> OutputResult<Self> {
        Self::open_with_buffer_size(path, DEFAULT_BUFFER_SIZE)
    }

    /// Open with a custom write buffer size
    pub fn open_with_buffer_size<P: AsRef<Path>>(path: P, buffer_size: usize) -> OutputResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| OutputError::IoError(format!("Failed to create directory: {}", e)))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| OutputError::IoError(format!("Failed to open {}: {}", path.display(), e)))?;
        let existing = file
            .metadata()
            .map_err(|e| OutputError::IoError(e.to_string()))?
            .len();

        let mut writer = WriterBuilder::new()
            .has_headers(false)
            .from_writer(BufWriter::with_capacity(buffer_size, file));

        if existing == 0 {
            writer
                .write_record(HEADER)
                .map_err(|e| OutputError::CsvError(format!("Failed to write header: {}", e)))?;
            writer
                .flush()
                .map_err(|e| OutputError::FlushError(format!("Failed to flush: {}", e)))?;
            info!("Created CSV output: path={}", path.display());
        } else {
            info!(
                "Appending to existing CSV output: path={}, bytes={}",
                path.display(),
                existing
            );
        }

        Ok(Self {
            path: path.to_path_buf(),
            writer: Some(writer),
            records_written: 0,
            since_flush: 0,
        })
    }

    /// Output path
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn writer(&mut self) -> OutputResult<&mut Writer<BufWriter<File>>> {
        self.writer
            .as_mut()
            .ok_or_else(|| OutputError::IoError(format!("{} is closed", self.path.display())))
    }

    fn sync(&mut self) -> OutputResult<()> {
        let writer = self.writer()?;
        writer
            .flush()
            .map_err(|e| OutputError::FlushError(format!("Failed to flush: {}", e)))?;
        writer
            .get_ref()
            .get_ref()
            .sync_data()
            .map_err(|e| OutputError::IoError(format!("Failed to sync file: {}", e)))
    }
}

impl Sink for CsvSink {
    fn append_batch(&mut self, records: &[Record]) -> OutputResult<()> {
        for record in records {
            let row = CsvRow::from_record(record)?;
            self.writer()?
                .serialize(&row)
                .map_err(|e| OutputError::CsvError(format!("Failed to write record: {}", e)))?;
            self.since_flush += 1;
            if self.since_flush >= FLUSH_INTERVAL {
                self.flush()?;
            }
        }
        self.sync()?;
        self.records_written += records.len() as u64;
        debug!("Appended batch: {} records, {} total", records.len(), self.records_written);
        Ok(())
    }

    fn flush(&mut self) -> OutputResult<()> {
        self.since_flush = 0;
        self.writer()?
            .flush()
            .map_err(|e| OutputError::FlushError(format!("Failed to flush: {}", e)))
    }

    fn close(&mut self) -> OutputResult<()> {
        if self.writer.is_none() {
            return Ok(());
        }
        self.flush()?;
        let Some(writer) = self.writer.take() else {
            return Ok(());
        };

        let buf_writer = writer.into_inner().map_err(|e| {
            OutputError::IoError(format!("Failed to get inner writer: {}", e))
        })?;
        let file = buf_writer.into_inner().map_err(|e| {
            OutputError::IoError(format!("Failed to get file handle: {}", e))
        })?;
        file.sync_all()
            .map_err(|e| OutputError::IoError(format!("Failed to sync file: {}", e)))?;

        info!(
            "CSV output closed: path={}, {} records written",
            self.path.display(),
            self.records_written
        );
        Ok(())
    }

    fn records_written(&self) -> u64 {
        self.records_written
    }
}
