//! Record sinks

use crate::Record;

pub mod csv;

pub use self::csv::CsvSink;

/// Output writer errors
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// CSV write error
    #[error("CSV error: {0}")]
    CsvError(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Buffer flush error
    #[error("flush error: {0}")]
    FlushError(String),
}

/// Result type for output operations
pub type OutputResult<T> = Result<T, OutputError>;

/// Append-only destination for records.
///
/// A sink has a single writer; the job runner serializes calls behind a lock
/// and issues them from the blocking pool, since they end in fsync.
pub trait Sink: Send {
    /// Append one unit's records and make them durable before returning
    fn append_batch(&mut self, records: &[Record]) -> OutputResult<()>;

    /// Flush any buffered data to disk
    fn flush(&mut self) -> OutputResult<()>;

    /// Flush and sync; later appends are an error
    fn close(&mut self) -> OutputResult<()>;

    /// Records appended through this handle
    fn records_written(&self) -> u64;
}
