//! Checkpoint persistence
//!
//! Each job has `checkpoint_{job_id}.json` in the checkpoint directory. Every
//! write also appends to `checkpoint_history.json`, a ledger keyed by output
//! file that lets a run find the checkpoint of an output file it did not
//! create.

use chrono::{DateTime, Utc};
use fd_lock::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

use super::checkpoint::{Checkpoint, HistoryEntry};
use super::{ResumeError, ResumeResult};

/// Maximum allowed checkpoint or ledger size (10 MB) to prevent memory exhaustion
pub const MAX_STATE_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Ledger entries kept per output file; older ones are pruned
pub const MAX_HISTORY_PER_OUTPUT: usize = 100;

/// Ledger file name inside the checkpoint directory
pub const HISTORY_FILE: &str = "checkpoint_history.json";

type History = BTreeMap<String, Vec<HistoryEntry>>;

/// One line of `checkpoints list`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadSummary {
    /// Output file
    pub output_file: PathBuf,
    /// Job that last wrote it
    pub job_id: String,
    /// Whether the output file is still on disk
    pub exists: bool,
    /// Output size in bytes
    pub size_bytes: Option<u64>,
    /// Confirmed-complete units
    pub cursor: usize,
    /// Units in the job
    pub total_units: usize,
    /// `cursor / total_units` in percent
    pub progress_percent: f64,
    /// Time of the last checkpoint write
    pub last_update: DateTime<Utc>,
    /// Checkpoint file of the last write
    pub checkpoint_file: PathBuf,
}

/// Durable checkpoint storage rooted at one directory
#[derive(Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
    last_saved: Mutex<HashMap<String, (PathBuf, usize)>>,
}

impl CheckpointStore {
    /// Store rooted at `dir` (created on first save)
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            last_saved: Mutex::new(HashMap::new()),
        }
    }

    /// Checkpoint directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the checkpoint file for `job_id`
    pub fn checkpoint_path(&self, job_id: &str) -> PathBuf {
        let safe: String = job_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
            .collect();
        self.dir.join(format!("checkpoint_{safe}.json"))
    }

    /// Path of the history ledger
    pub fn history_path(&self) -> PathBuf {
        self.dir.join(HISTORY_FILE)
    }

    fn remember(&self, job_id: &str, checkpoint: &Checkpoint) {
        self.last_saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_id.to_string(), (checkpoint.output_file.clone(), checkpoint.cursor));
    }

    /// Persist `checkpoint` for `job_id` and record it in the ledger.
    ///
    /// The previous checkpoint stays intact if the write fails. A cursor
    /// lower than the last one saved for the same job and output file is
    /// rejected.
    pub fn save(&self, job_id: &str, checkpoint: &Checkpoint) -> ResumeResult<()> {
        if let Some((output, cursor)) = self
            .last_saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id)
        {
            if *output == checkpoint.output_file && checkpoint.cursor < *cursor {
                return Err(ResumeError::CursorRegression {
                    job_id: job_id.to_string(),
                    persisted: *cursor,
                    attempted: checkpoint.cursor,
                });
            }
        }

        let path = self.checkpoint_path(job_id);
        let json = serde_json::to_string_pretty(checkpoint)
            .map_err(|e| ResumeError::SerializationError(e.to_string()))?;
        {
            let _lock = lock_exclusive(&path)?;
            write_atomic(&path, json.as_bytes())?;
        }
        self.remember(job_id, checkpoint);

        self.append_history(checkpoint, &path)?;
        debug!(
            path = %path.display(),
            cursor = checkpoint.cursor,
            total_units = checkpoint.total_units,
            "Checkpoint saved"
        );
        Ok(())
    }

    /// Load the checkpoint of `job_id`, if any.
    ///
    /// An unreadable or inconsistent file is [`ResumeError::CheckpointCorruption`].
    pub fn load(&self, job_id: &str) -> ResumeResult<Option<Checkpoint>> {
        let path = self.checkpoint_path(job_id);
        if !path.exists() {
            return Ok(None);
        }
        let checkpoint = self.load_path(&path)?;
        self.remember(job_id, &checkpoint);
        Ok(Some(checkpoint))
    }

    /// Load a checkpoint from an explicit path
    pub fn load_path(&self, path: &Path) -> ResumeResult<Checkpoint> {
        let contents = read_limited(path)?;
        let checkpoint: Checkpoint = serde_json::from_str(&contents).map_err(|e| {
            warn!(path = %path.display(), error = %e, "Checkpoint file is corrupt");
            ResumeError::CheckpointCorruption {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
        })?;
        checkpoint.validate(path)?;
        Ok(checkpoint)
    }

    /// Remove the checkpoint of `job_id`
    pub fn remove(&self, job_id: &str) -> ResumeResult<()> {
        let path = self.checkpoint_path(job_id);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ResumeError::IoError(e.to_string())),
        }
        self.last_saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(job_id);
        Ok(())
    }

    fn read_history(&self) -> ResumeResult<History> {
        let path = self.history_path();
        if !path.exists() {
            return Ok(History::new());
        }
        let contents = read_limited(&path)?;
        if contents.trim().is_empty() {
            return Ok(History::new());
        }
        serde_json::from_str(&contents).map_err(|e| ResumeError::CheckpointCorruption {
            path: path.clone(),
            reason: format!("{e} (run `checkpoints rebuild` to regenerate the ledger)"),
        })
    }

    fn write_history(&self, history: &History) -> ResumeResult<()> {
        let json = serde_json::to_string_pretty(history)
            .map_err(|e| ResumeError::SerializationError(e.to_string()))?;
        write_atomic(&self.history_path(), json.as_bytes())
    }

    fn append_history(&self, checkpoint: &Checkpoint, checkpoint_file: &Path) -> ResumeResult<()> {
        let _lock = lock_exclusive(&self.history_path())?;
        let mut history = self.read_history()?;
        let entries = history.entry(output_key(&checkpoint.output_file)).or_default();
        entries.push(HistoryEntry::for_checkpoint(checkpoint, checkpoint_file));
        if entries.len() > MAX_HISTORY_PER_OUTPUT {
            let drain_count = entries.len() - MAX_HISTORY_PER_OUTPUT;
            entries.drain(0..drain_count);
        }
        self.write_history(&history)
    }

    /// Ledger entries for `output_file`, oldest first
    pub fn history(&self, output_file: &Path) -> ResumeResult<Vec<HistoryEntry>> {
        Ok(self
            .read_history()?
            .remove(&output_key(output_file))
            .unwrap_or_default())
    }

    /// Most recent checkpoint that still exists and targets `output_file`
    pub fn find_for_output(&self, output_file: &Path) -> ResumeResult<Option<Checkpoint>> {
        let wanted = output_key(output_file);
        for entry in self.history(output_file)?.iter().rev() {
            if !entry.checkpoint_file.exists() {
                continue;
            }
            let checkpoint = self.load_path(&entry.checkpoint_file)?;
            if output_key(&checkpoint.output_file) == wanted {
                self.remember(&checkpoint.job_id, &checkpoint);
                return Ok(Some(checkpoint));
            }
        }

        // ledger may predate the checkpoint; fall back to a directory scan
        let mut found: Option<Checkpoint> = None;
        for path in self.checkpoint_files()? {
            let checkpoint = match self.load_path(&path) {
                Ok(checkpoint) => checkpoint,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable checkpoint during scan");
                    continue;
                }
            };
            if output_key(&checkpoint.output_file) == wanted
                && found.as_ref().map_or(true, |f| f.timestamp < checkpoint.timestamp)
            {
                found = Some(checkpoint);
            }
        }
        if let Some(checkpoint) = &found {
            self.remember(&checkpoint.job_id, checkpoint);
        }
        Ok(found)
    }

    /// One summary per output file in the ledger, newest first
    pub fn list_downloads(&self, job_filter: Option<&str>) -> ResumeResult<Vec<DownloadSummary>> {
        let history = self.read_history()?;
        let mut summaries = Vec::new();
        for (output, entries) in history {
            let Some(latest) = entries.last() else {
                continue;
            };
            if let Some(filter) = job_filter {
                if !latest.job_id.contains(filter) {
                    continue;
                }
            }
            let output_file = PathBuf::from(&output);
            let size_bytes = std::fs::metadata(&output_file).ok().map(|m| m.len());
            let (cursor, total_units, last_update) = match self.load_path(&latest.checkpoint_file) {
                Ok(cp) if output_key(&cp.output_file) == output => (cp.cursor, cp.total_units, cp.timestamp),
                _ => (latest.cursor, latest.total_units, latest.timestamp),
            };
            let progress_percent = if total_units == 0 {
                100.0
            } else {
                cursor as f64 * 100.0 / total_units as f64
            };
            summaries.push(DownloadSummary {
                exists: size_bytes.is_some(),
                output_file,
                job_id: latest.job_id.clone(),
                size_bytes,
                cursor,
                total_units,
                progress_percent,
                last_update,
                checkpoint_file: latest.checkpoint_file.clone(),
            });
        }
        summaries.sort_by(|a, b| b.last_update.cmp(&a.last_update));
        Ok(summaries)
    }

    /// Regenerate the ledger from the checkpoint files on disk.
    ///
    /// Returns the number of checkpoints indexed; corrupt files are skipped.
    pub fn rebuild_history(&self) -> ResumeResult<usize> {
        let _lock = lock_exclusive(&self.history_path())?;
        let mut history = History::new();
        let mut count = 0;
        for path in self.checkpoint_files()? {
            match self.load_path(&path) {
                Ok(checkpoint) => {
                    history
                        .entry(output_key(&checkpoint.output_file))
                        .or_default()
                        .push(HistoryEntry::for_checkpoint(&checkpoint, &path));
                    count += 1;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable checkpoint"),
            }
        }
        for entries in history.values_mut() {
            entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        }
        std::fs::create_dir_all(&self.dir).map_err(|e| ResumeError::IoError(e.to_string()))?;
        self.write_history(&history)?;
        info!(checkpoints = count, outputs = history.len(), "Rebuilt checkpoint history");
        Ok(count)
    }

    fn checkpoint_files(&self) -> ResumeResult<Vec<PathBuf>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ResumeError::IoError(e.to_string())),
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("checkpoint_") && n.ends_with(".json") && n != HISTORY_FILE)
            })
            .collect();
        files.sort();
        Ok(files)
    }
}

fn output_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn read_limited(path: &Path) -> ResumeResult<String> {
    let metadata = std::fs::metadata(path).map_err(|e| ResumeError::IoError(e.to_string()))?;
    if metadata.len() > MAX_STATE_FILE_SIZE {
        return Err(ResumeError::StateTooLarge {
            size: metadata.len(),
            max: MAX_STATE_FILE_SIZE,
        });
    }
    std::fs::read_to_string(path).map_err(|e| ResumeError::IoError(e.to_string()))
}

fn lock_exclusive(path: &Path) -> ResumeResult<LockedFile> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ResumeError::IoError(e.to_string()))?;
    }
    let lock_path = path.with_extension("lock");
    let lock_file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|e| ResumeError::LockError(format!("Failed to create lock file: {e}")))?;
    let mut lock = RwLock::new(lock_file);
    let guard = lock
        .write()
        .map_err(|e| ResumeError::LockError(format!("Failed to acquire write lock: {e}")))?;
    // released when the file closes
    std::mem::forget(guard);
    Ok(LockedFile { _lock: lock })
}

struct LockedFile {
    _lock: RwLock<std::fs::File>,
}

/// Replace `path` with `bytes` via temp file, fsync and rename.
///
/// Callers hold the lock of `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> ResumeResult<()> {
    let parent_dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent_dir).map_err(|e| ResumeError::IoError(e.to_string()))?;

    let mut temp_file = tempfile::NamedTempFile::new_in(parent_dir)
        .map_err(|e| ResumeError::IoError(format!("Failed to create temp file: {e}")))?;
    temp_file
        .write_all(bytes)
        .map_err(|e| ResumeError::IoError(format!("Failed to write to temp file: {e}")))?;
    temp_file
        .flush()
        .map_err(|e| ResumeError::IoError(format!("Failed to flush temp file: {e}")))?;
    temp_file
        .as_file()
        .sync_all()
        .map_err(|e| ResumeError::IoError(format!("Failed to sync temp file: {e}")))?;
    temp_file
        .persist(path)
        .map_err(|e| ResumeError::IoError(format!("Failed to persist temp file: {e}")))?;

    // Fsync parent directory to ensure the rename is durable
    if let Ok(dir) = std::fs::File::open(parent_dir) {
        let _ = dir.sync_all();
    }
    Ok(())
}
