//! Progress aggregation for long-running jobs.
//!
//! Unit tasks never touch shared counters. They send [`ProgressEvent`]s over a
//! single channel to one aggregator task, which owns the totals, emits the
//! periodic `[PROGRESS]` log lines and forwards every event to an optional
//! subscriber (the CLI progress bar).

use crate::UnitKey;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(60);
const MIN_DOWNLOAD_DURATION: Duration = Duration::from_secs(30);

/// Something that happened to one unit
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// Work on the unit began
    UnitStarted {
        /// Position in the catalog
        index: usize,
        /// Unit key
        key: UnitKey,
    },
    /// Unit appended and checkpointed
    UnitCompleted {
        /// Position in the catalog
        index: usize,
        /// Unit key
        key: UnitKey,
        /// Records appended for the unit
        records: u64,
        /// Checkpoint cursor after the unit
        cursor: usize,
    },
    /// Unit gave up after retries
    UnitFailed {
        /// Position in the catalog
        index: usize,
        /// Unit key
        key: UnitKey,
        /// Final error
        error: String,
    },
}

/// Sender half handed to unit tasks
pub type ProgressSender = mpsc::UnboundedSender<ProgressEvent>;

/// Final counters of one run
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProgressTotals {
    /// Units completed in this run
    pub units_completed: usize,
    /// Units failed in this run
    pub units_failed: usize,
    /// Records appended in this run
    pub records: u64,
    /// Wall-clock duration of the run
    pub elapsed: Duration,
}

/// Progress tracking state for one run.
#[derive(Debug, Clone)]
pub struct ProgressState {
    /// Units in the job
    pub total_units: usize,
    /// Units already complete when the run started
    pub units_skipped: usize,
    /// Units completed in this run
    pub units_completed: usize,
    /// Units failed in this run
    pub units_failed: usize,
    /// Records appended in this run
    pub records: u64,
    /// Timestamp when the run started.
    pub start_time: Instant,
    /// Last time progress was reported.
    pub last_update: Instant,
    /// Minimum interval between progress updates.
    pub update_interval: Duration,
    /// Last reported completion percentage (0-100).
    pub last_reported_percentage: f64,
    /// Minimum percentage delta required to emit a new update.
    pub min_percentage_step: f64,
}

impl ProgressState {
    /// Create a state for `total_units`, `units_skipped` of which are already done.
    pub fn new(total_units: usize, units_skipped: usize) -> Self {
        let now = Instant::now();
        Self {
            total_units,
            units_skipped,
            units_completed: 0,
            units_failed: 0,
            records: 0,
            start_time: now,
            last_update: now,
            update_interval: DEFAULT_UPDATE_INTERVAL,
            last_reported_percentage: 0.0,
            min_percentage_step: 10.0,
        }
    }

    /// Fold one event into the counters
    pub fn apply(&mut self, event: &ProgressEvent) {
        match event {
            ProgressEvent::UnitStarted { .. } => {}
            ProgressEvent::UnitCompleted { records, .. } => {
                self.units_completed += 1;
                self.records = self.records.saturating_add(*records);
            }
            ProgressEvent::UnitFailed { .. } => self.units_failed += 1,
        }
    }

    /// Units finished either way, including those done before the run
    pub fn units_done(&self) -> usize {
        self.units_skipped + self.units_completed + self.units_failed
    }

    /// Share of the job's units finished, 0-100
    pub fn percentage(&self) -> f64 {
        if self.total_units == 0 {
            return 100.0;
        }
        (self.units_done() as f64 / self.total_units as f64) * 100.0
    }

    /// Units per second in this run
    pub fn rate(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            (self.units_completed + self.units_failed) as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Whether a progress update should be emitted based on time or percentage.
    pub fn should_emit_update(&self) -> bool {
        if self.units_completed + self.units_failed == 0 {
            return false;
        }

        if self.percentage() - self.last_reported_percentage >= self.min_percentage_step {
            return true;
        }

        self.start_time.elapsed() >= MIN_DOWNLOAD_DURATION
            && self.last_update.elapsed() >= self.update_interval
    }

    /// Call after emitting a progress log to reset timers and cached percentage.
    pub fn mark_emitted(&mut self) {
        self.last_update = Instant::now();
        self.last_reported_percentage = self.percentage();
    }

    /// Estimate remaining time from the unit rate of this run.
    pub fn estimate_remaining(&self) -> Option<Duration> {
        let rate = self.rate();
        let remaining = self.total_units.saturating_sub(self.units_done());
        if rate > 0.0 && remaining > 0 {
            Some(Duration::from_secs_f64(remaining as f64 / rate))
        } else {
            None
        }
    }

    /// Human-readable progress string for logging.
    pub fn format_progress(&self) -> String {
        let mut parts = vec![format!(
            "[PROGRESS] {}/{} units - {:.1}% complete, {} records",
            self.units_done(),
            self.total_units,
            self.percentage(),
            self.records
        )];

        if self.units_failed > 0 {
            parts.push(format!("({} failed)", self.units_failed));
        }

        if let Some(remaining) = self.estimate_remaining() {
            parts.push(format!("- ~{} remaining", format_duration(remaining)));
        }

        parts.join(" ")
    }

    /// Counters as returned to the runner
    pub fn totals(&self) -> ProgressTotals {
        ProgressTotals {
            units_completed: self.units_completed,
            units_failed: self.units_failed,
            records: self.records,
            elapsed: self.start_time.elapsed(),
        }
    }
}

/// Start the aggregator task.
///
/// The task ends once every clone of the returned sender is dropped, and
/// yields the final totals.
pub fn spawn_aggregator(
    mut state: ProgressState,
    subscriber: Option<ProgressSender>,
) -> (ProgressSender, JoinHandle<ProgressTotals>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<ProgressEvent>();
    let handle = tokio::spawn(async move {
        let mut subscriber = subscriber;
        while let Some(event) = rx.recv().await {
            state.apply(&event);
            if state.should_emit_update() {
                info!("{}", state.format_progress());
                state.mark_emitted();
            }
            if let Some(tx) = &subscriber {
                if tx.send(event).is_err() {
                    // receiver went away; keep aggregating without it
                    subscriber = None;
                }
            }
        }
        state.totals()
    });
    (tx, handle)
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else {
        format!("{:.1}h", secs as f64 / 3600.0)
    }
}
