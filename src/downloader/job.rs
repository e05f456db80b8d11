//! Job specification and status tracking

use super::DownloadError;
use crate::DateWindow;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Caller-supplied knobs of one job run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobControls {
    /// Date window applied to every unit
    pub window: DateWindow,
    /// Directory for new output files
    pub output_dir: PathBuf,
    /// Append to this file instead of creating a new one
    #[serde(default)]
    pub output_file: Option<PathBuf>,
    /// Archive cache directory override
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// Upper bound on concurrently processed units; derived from the source when unset
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    /// Continue from an existing checkpoint
    #[serde(default = "default_resume")]
    pub resume: bool,
}

fn default_resume() -> bool {
    true
}

impl JobControls {
    /// Resumable controls writing new files into `output_dir`
    pub fn new(window: DateWindow, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            window,
            output_dir: output_dir.into(),
            output_file: None,
            cache_dir: None,
            max_concurrency: None,
            resume: true,
        }
    }

    /// Append to a specific output file
    pub fn with_output_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_file = Some(path.into());
        self
    }

    /// Override the archive cache directory
    pub fn with_cache_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(path.into());
        self
    }

    /// Cap concurrently processed units
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = Some(max);
        self
    }

    /// Enable or disable resuming from a checkpoint
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }
}

/// One download job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Identifier; names the checkpoint file
    pub id: String,
    /// Dataset label, used as the output file prefix
    pub dataset: String,
    /// Run controls
    pub controls: JobControls,
    /// Current status
    #[serde(default)]
    pub status: JobStatus,
    /// Fatal error of the last run
    #[serde(default)]
    pub error: Option<String>,
}

impl Job {
    /// Create a pending job
    pub fn new(id: impl Into<String>, dataset: impl Into<String>, controls: JobControls) -> Self {
        Self {
            id: id.into(),
            dataset: dataset.into(),
            controls,
            status: JobStatus::Pending,
            error: None,
        }
    }

    /// Validate job parameters
    pub fn validate(&self) -> Result<(), DownloadError> {
        if self.id.trim().is_empty() {
            return Err(DownloadError::ValidationError("Job id cannot be empty".to_string()));
        }

        if self.dataset.trim().is_empty() {
            return Err(DownloadError::ValidationError("Dataset cannot be empty".to_string()));
        }

        if self.controls.max_concurrency == Some(0) {
            return Err(DownloadError::ValidationError(
                "Concurrency must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Move to `next`, rejecting transitions the status machine forbids
    pub fn transition(&mut self, next: JobStatus) -> Result<(), DownloadError> {
        if !self.status.can_transition_to(next) {
            return Err(DownloadError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Record a fatal error and mark the job failed
    pub fn fail(&mut self, error: &DownloadError) {
        self.error = Some(error.to_string());
        if self.status.can_transition_to(JobStatus::Failed) {
            self.status = JobStatus::Failed;
        }
    }
}

/// Job execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum JobStatus {
    /// Job has not started yet
    #[default]
    Pending,
    /// Units are being processed
    Running,
    /// Every unit completed
    Completed,
    /// Every unit was attempted and some failed after retries
    PartiallyFailed,
    /// Shutdown was requested before the unit list was exhausted
    Cancelled,
    /// A fatal error stopped the run
    Failed,
}

impl JobStatus {
    /// Whether no further transition is allowed
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::PartiallyFailed | Self::Cancelled | Self::Failed
        )
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Running | Self::Failed),
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::PartiallyFailed => "partially failed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}
