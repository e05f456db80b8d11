//! Crash-safe job progress
//!
//! Provides checkpoint persistence with atomic writes, a history ledger for
//! resume discovery and file locking for output ownership.

use std::path::PathBuf;

pub mod checkpoint;
pub mod lock;
pub mod store;

pub use checkpoint::{Checkpoint, CompletionTracker, HistoryEntry, SCHEMA_VERSION};
pub use lock::ResumeLock;
pub use store::{CheckpointStore, DownloadSummary};

/// Resume errors
#[derive(Debug, thiserror::Error)]
pub enum ResumeError {
    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Unparseable or self-contradicting checkpoint; needs an operator
    #[error("checkpoint {path} is corrupt: {reason}")]
    CheckpointCorruption {
        /// Offending file
        path: PathBuf,
        /// Parser or validation message
        reason: String,
    },

    /// Checkpoint does not fit the job's catalog
    #[error("checkpoint does not match the job: {0}")]
    InconsistentCheckpoint(String),

    /// Written by a newer schema
    #[error("checkpoint schema version {found} is newer than supported version {supported}")]
    UnsupportedVersion {
        /// Version in the file
        found: u32,
        /// Highest version this build reads
        supported: u32,
    },

    /// State file too large
    #[error("state file too large: {size} bytes (max {max})")]
    StateTooLarge {
        /// Actual size
        size: u64,
        /// Limit
        max: u64,
    },

    /// Lock error
    #[error("lock error: {0}")]
    LockError(String),

    /// Output is owned by another process
    #[error("output is locked by another process ({path})")]
    JobLocked {
        /// Lock file
        path: PathBuf,
    },

    /// Attempt to move the cursor backwards
    #[error("refusing to move cursor of job {job_id} back from {persisted} to {attempted}")]
    CursorRegression {
        /// Job identifier
        job_id: String,
        /// Cursor on disk
        persisted: usize,
        /// Cursor being saved
        attempted: usize,
    },
}

/// Result type for resume operations
pub type ResumeResult<T> = Result<T, ResumeError>;
