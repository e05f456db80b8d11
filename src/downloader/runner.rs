//! Resumable job runner
//!
//! Drives one [`Job`] over the units of a [`Catalog`]: a bounded number of
//! units are fetched concurrently, each finished unit is appended to the
//! sink as one batch and then checkpointed. The sink and the completion
//! tracker sit behind separate locks, and the checkpoint is written while
//! the tracker lock is held so saves never reorder. Sink writes and
//! checkpoint saves end in fsync and run on the blocking pool.
//!
//! A unit whose retries are exhausted is counted and skipped. Output or
//! checkpoint failures, corrupt checkpoints and a held output lock end the
//! run with an error.

use super::config::default_concurrency;
use super::job::{Job, JobStatus};
use super::progress::{spawn_aggregator, ProgressEvent, ProgressSender, ProgressState, ProgressTotals};
use super::DownloadError;
use crate::fetcher::catalog::{ensure_unique_keys, Catalog};
use crate::fetcher::UnitSource;
use crate::output::{CsvSink, OutputResult, Sink};
use crate::resume::{Checkpoint, CheckpointStore, CompletionTracker, ResumeLock};
use crate::shutdown::{SharedShutdown, ShutdownCoordinator};
use crate::{DateWindow, Unit, UnitKey};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};

/// Outcome of one run
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    /// Job the checkpoint was written for
    pub job_id: String,
    /// Terminal status
    pub status: JobStatus,
    /// Output file appended to
    pub output_file: PathBuf,
    /// Checkpoint file of the job
    pub checkpoint_file: PathBuf,
    /// Units in the catalog
    pub total_units: usize,
    /// Units already complete before this run
    pub skipped_units: usize,
    /// Units completed by this run
    pub completed_units: usize,
    /// Units whose retries were exhausted
    pub failed_units: usize,
    /// Records appended by this run
    pub records_written: u64,
    /// Confirmed-complete prefix after the run
    pub cursor: usize,
    /// Wall-clock duration
    pub elapsed: Duration,
}

enum UnitOutcome {
    Completed,
    Failed,
    Abandoned,
}

/// State shared by the unit tasks of one run
struct RunContext {
    job_id: String,
    window: DateWindow,
    source: Arc<dyn UnitSource>,
    store: Arc<CheckpointStore>,
    sink: Arc<Mutex<Box<dyn Sink>>>,
    tracker: Mutex<CompletionTracker>,
    events: ProgressSender,
    shutdown: Option<SharedShutdown>,
    abort: SharedShutdown,
}

impl RunContext {
    fn stop_requested(&self) -> bool {
        self.abort.is_shutdown_requested()
            || self
                .shutdown
                .as_ref()
                .map(|s| s.is_shutdown_requested())
                .unwrap_or(false)
    }

    async fn stopped(&self) {
        match &self.shutdown {
            Some(shutdown) => {
                tokio::select! {
                    _ = shutdown.wait_for_shutdown() => {},
                    _ = self.abort.wait_for_shutdown() => {},
                }
            }
            None => self.abort.wait_for_shutdown().await,
        }
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), DownloadError> {
        save_checkpoint(self.store.clone(), self.job_id.clone(), checkpoint).await
    }

    fn emit(&self, event: ProgressEvent) {
        // the aggregator outlives every task
        let _ = self.events.send(event);
    }

    async fn process(&self, index: usize, unit: Unit) -> Result<UnitOutcome, DownloadError> {
        self.emit(ProgressEvent::UnitStarted {
            index,
            key: unit.key.clone(),
        });

        // nothing has been written yet, so the fetch may be dropped on shutdown
        let fetched = tokio::select! {
            biased;
            _ = self.stopped() => {
                debug!("Unit abandoned before write");
                return Ok(UnitOutcome::Abandoned);
            }
            result = self.source.fetch_unit(&unit, &self.window) => result,
        };

        let records = match fetched {
            Ok(records) => records,
            Err(e) => {
                error!(
                    error = %e,
                    "Unit failed after retries. Re-run the job to retry the failed units only"
                );
                let mut tracker = self.tracker.lock().await;
                tracker.mark_failed(index);
                self.save(tracker.checkpoint()).await?;
                drop(tracker);
                crate::metrics::record_unit_failed();
                self.emit(ProgressEvent::UnitFailed {
                    index,
                    key: unit.key,
                    error: e.to_string(),
                });
                return Ok(UnitOutcome::Failed);
            }
        };

        let count = records.len() as u64;
        let sink = self.sink.clone().lock_owned().await;
        with_sink(sink, move |sink| sink.append_batch(&records)).await?;

        let cursor = {
            let mut tracker = self.tracker.lock().await;
            tracker.mark_completed(index, count);
            let checkpoint = tracker.checkpoint();
            let cursor = checkpoint.cursor;
            self.save(checkpoint).await?;
            cursor
        };

        crate::metrics::record_unit_completed();
        crate::metrics::record_records_written(count);
        info!(records = count, cursor, "Unit completed");
        self.emit(ProgressEvent::UnitCompleted {
            index,
            key: unit.key,
            records: count,
            cursor,
        });
        Ok(UnitOutcome::Completed)
    }
}

async fn save_checkpoint(
    store: Arc<CheckpointStore>,
    job_id: String,
    checkpoint: Checkpoint,
) -> Result<(), DownloadError> {
    tokio::task::spawn_blocking(move || store.save(&job_id, &checkpoint))
        .await
        .map_err(|e| DownloadError::TaskFailed(format!("checkpoint save: {e}")))??;
    Ok(())
}

/// Run `op` on the blocking pool while keeping the sink locked
async fn with_sink<F>(mut sink: OwnedMutexGuard<Box<dyn Sink>>, op: F) -> Result<(), DownloadError>
where
    F: FnOnce(&mut dyn Sink) -> OutputResult<()> + Send + 'static,
{
    tokio::task::spawn_blocking(move || op(&mut **sink))
        .await
        .map_err(|e| DownloadError::TaskFailed(format!("sink write: {e}")))??;
    Ok(())
}

/// Runs jobs against one source, persisting progress in one store
pub struct ResumableJobRunner {
    source: Arc<dyn UnitSource>,
    store: Arc<CheckpointStore>,
    shutdown: Option<SharedShutdown>,
    subscriber: Option<ProgressSender>,
}

impl ResumableJobRunner {
    /// Runner over `source` with checkpoints in `store`
    pub fn new(source: Arc<dyn UnitSource>, store: CheckpointStore) -> Self {
        Self {
            source,
            store: Arc::new(store),
            shutdown: None,
            subscriber: None,
        }
    }

    /// Stop between units once `shutdown` is requested
    pub fn with_shutdown(mut self, shutdown: SharedShutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Forward every [`ProgressEvent`] to `subscriber`
    pub fn with_progress(mut self, subscriber: ProgressSender) -> Self {
        self.subscriber = Some(subscriber);
        self
    }

    /// Checkpoint store in use
    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Run `job` over the units of `catalog`.
    ///
    /// Returns a summary for every run that reached a terminal state other
    /// than [`JobStatus::Failed`]; units that failed after retries are
    /// reported in [`RunSummary::failed_units`].
    pub async fn run(&self, job: &mut Job, catalog: &dyn Catalog) -> Result<RunSummary, DownloadError> {
        if let Err(e) = job.validate() {
            job.fail(&e);
            return Err(e);
        }
        job.transition(JobStatus::Running)?;

        let span = tracing::info_span!("job", job_id = %job.id, source = %self.source.name());
        match self.execute(job, catalog).instrument(span).await {
            Ok(summary) => {
                job.transition(summary.status)?;
                Ok(summary)
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Job failed");
                job.fail(&e);
                Err(e)
            }
        }
    }

    async fn execute(&self, job: &Job, catalog: &dyn Catalog) -> Result<RunSummary, DownloadError> {
        let units = catalog.units().await?;
        ensure_unique_keys(&units)?;
        let keys: Vec<UnitKey> = units.iter().map(|u| u.key.clone()).collect();

        let (output_file, tracker) = self.resolve(job, keys)?;
        let _lock = ResumeLock::try_acquire(&output_file)?;
        let job_id = tracker.checkpoint().job_id;
        let checkpoint_file = self.store.checkpoint_path(&job_id);
        let skipped_units = tracker.total() - tracker.pending().len();

        info!(
            total_units = tracker.total(),
            cursor = tracker.cursor(),
            pending = tracker.pending().len(),
            output = %output_file.display(),
            "Starting job"
        );

        if tracker.is_complete() {
            info!("All units already complete; start with resume disabled for a fresh run");
            return Ok(RunSummary {
                job_id,
                status: JobStatus::Completed,
                output_file,
                checkpoint_file,
                total_units: tracker.total(),
                skipped_units,
                completed_units: 0,
                failed_units: 0,
                records_written: 0,
                cursor: tracker.cursor(),
                elapsed: Duration::ZERO,
            });
        }

        let sink: Box<dyn Sink> = Box::new(CsvSink::open(&output_file)?);
        // makes a fresh output discoverable before its first unit lands
        save_checkpoint(self.store.clone(), job_id.clone(), tracker.checkpoint()).await?;

        let concurrency = job.controls.max_concurrency.unwrap_or_else(|| {
            let cost = units.iter().map(Unit::request_cost).sum::<usize>() / units.len().max(1);
            default_concurrency(self.source.parallelism(), cost)
        });
        debug!(concurrency, "Unit concurrency");

        let pending = tracker.pending();
        let progress = ProgressState::new(tracker.total(), skipped_units);
        let (events, aggregator) = spawn_aggregator(progress, self.subscriber.clone());

        let ctx = Arc::new(RunContext {
            job_id: job_id.clone(),
            window: job.controls.window,
            source: self.source.clone(),
            store: self.store.clone(),
            sink: Arc::new(Mutex::new(sink)),
            tracker: Mutex::new(tracker),
            events,
            shutdown: self.shutdown.clone(),
            abort: ShutdownCoordinator::shared(),
        });

        let (scheduled, fatal) = Self::schedule(&ctx, units, pending, concurrency).await;

        let ctx = match Arc::try_unwrap(ctx) {
            Ok(ctx) => ctx,
            Err(_) => {
                return Err(DownloadError::TaskFailed(
                    "unit tasks still hold the run state".to_string(),
                ))
            }
        };
        let RunContext {
            sink,
            tracker,
            events,
            ..
        } = ctx;
        drop(events);
        let totals: ProgressTotals = aggregator
            .await
            .map_err(|e| DownloadError::TaskFailed(format!("progress aggregator: {e}")))?;

        let close_result = with_sink(sink.lock_owned().await, |sink| sink.close()).await;
        if let Some(e) = fatal {
            return Err(e);
        }
        close_result?;

        let tracker = tracker.into_inner();
        let status = if tracker.is_complete() {
            JobStatus::Completed
        } else if scheduled && tracker.pending().len() == tracker.failed_count() {
            JobStatus::PartiallyFailed
        } else {
            JobStatus::Cancelled
        };

        let summary = RunSummary {
            job_id,
            status,
            output_file,
            checkpoint_file,
            total_units: tracker.total(),
            skipped_units,
            completed_units: totals.units_completed,
            failed_units: tracker.failed_count(),
            records_written: totals.records,
            cursor: tracker.cursor(),
            elapsed: totals.elapsed,
        };

        match status {
            JobStatus::Cancelled => warn!(
                cursor = summary.cursor,
                total_units = summary.total_units,
                "Job interrupted; progress is checkpointed and the next run resumes it"
            ),
            _ => info!(
                status = %status,
                records = summary.records_written,
                "{}/{} units failed",
                summary.failed_units,
                summary.total_units
            ),
        }
        Ok(summary)
    }

    /// Spawn a task per pending unit, at most `concurrency` at a time.
    ///
    /// Returns whether every pending unit was handed out and the first fatal
    /// error, if any.
    async fn schedule(
        ctx: &Arc<RunContext>,
        units: Vec<Unit>,
        pending: Vec<usize>,
        concurrency: usize,
    ) -> (bool, Option<DownloadError>) {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut tasks: JoinSet<Result<UnitOutcome, DownloadError>> = JoinSet::new();
        let mut units: Vec<Option<Unit>> = units.into_iter().map(Some).collect();
        let mut scheduled = true;

        for index in pending {
            if ctx.stop_requested() {
                scheduled = false;
                break;
            }
            let permit = tokio::select! {
                _ = ctx.stopped() => {
                    scheduled = false;
                    break;
                }
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        scheduled = false;
                        break;
                    }
                },
            };
            let Some(unit) = units.get_mut(index).and_then(Option::take) else {
                continue;
            };

            let ctx = ctx.clone();
            let span = tracing::info_span!("unit", index, key = %unit.key);
            tasks.spawn(
                async move {
                    let _permit = permit;
                    let result = ctx.process(index, unit).await;
                    if result.is_err() {
                        ctx.abort.request_shutdown();
                    }
                    result
                }
                .instrument(span),
            );
        }

        let mut fatal = None;
        let mut abandoned = 0usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(UnitOutcome::Abandoned)) => abandoned += 1,
                Ok(Ok(UnitOutcome::Completed | UnitOutcome::Failed)) => {}
                Ok(Err(e)) => {
                    fatal.get_or_insert(e);
                }
                Err(e) => {
                    ctx.abort.request_shutdown();
                    fatal.get_or_insert(DownloadError::TaskFailed(e.to_string()));
                }
            }
        }
        if abandoned > 0 {
            info!(abandoned, "In-flight units abandoned before writing");
        }
        (scheduled && abandoned == 0, fatal)
    }

    /// Pick the output file and completion state for `job`.
    fn resolve(&self, job: &Job, keys: Vec<UnitKey>) -> Result<(PathBuf, CompletionTracker), DownloadError> {
        let controls = &job.controls;

        if !controls.resume {
            let output = match &controls.output_file {
                Some(path) => {
                    if non_empty(path) {
                        return Err(DownloadError::ValidationError(format!(
                            "{} already has data; enable resume to append to it",
                            path.display()
                        )));
                    }
                    path.clone()
                }
                None => fresh_output(job),
            };
            info!(output = %output.display(), "Starting fresh (resume disabled)");
            return Ok((output.clone(), CompletionTracker::new(&job.id, output, keys)));
        }

        if let Some(path) = &controls.output_file {
            return match self.store.find_for_output(path)? {
                Some(checkpoint) => {
                    if checkpoint.job_id != job.id {
                        warn!(
                            checkpoint_job = %checkpoint.job_id,
                            "Output was written by another job id; continuing its checkpoint"
                        );
                    }
                    Ok((path.clone(), resume_from(keys, &checkpoint)?))
                }
                None => {
                    if non_empty(path) {
                        warn!(
                            output = %path.display(),
                            "No checkpoint for existing output; all units will be appended"
                        );
                    }
                    Ok((path.clone(), CompletionTracker::new(&job.id, path.clone(), keys)))
                }
            };
        }

        if let Some(checkpoint) = self.store.load(&job.id)? {
            if checkpoint.output_file.exists() {
                let output = checkpoint.output_file.clone();
                return Ok((output, resume_from(keys, &checkpoint)?));
            }
            warn!(
                output = %checkpoint.output_file.display(),
                "Checkpointed output file is gone; starting fresh"
            );
        }

        let output = fresh_output(job);
        Ok((output.clone(), CompletionTracker::new(&job.id, output, keys)))
    }
}

fn resume_from(keys: Vec<UnitKey>, checkpoint: &Checkpoint) -> Result<CompletionTracker, DownloadError> {
    info!(
        cursor = checkpoint.cursor,
        total_units = checkpoint.total_units,
        completed_ahead = checkpoint.completed_ahead.len(),
        previously_failed = checkpoint.failed.len(),
        "Resuming from checkpoint"
    );
    Ok(CompletionTracker::resume(keys, checkpoint)?)
}

fn fresh_output(job: &Job) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    job.controls
        .output_dir
        .join(format!("{}_{}_{}.csv", job.dataset, job.id, stamp))
}

fn non_empty(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}
