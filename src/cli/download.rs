//! Download command implementation

use crate::downloader::{Job, JobControls, ProgressEvent, ResumableJobRunner, RunSummary};
use crate::fetcher::catalog::{ArchiveMonthCatalog, Catalog, JsonFileCatalog};
use crate::fetcher::create_source;
use crate::registry::{self, SourceKind};
use crate::resume::CheckpointStore;
use crate::shutdown::SharedShutdown;
use crate::DateWindow;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

use super::CliError;
use crate::downloader::config::MAX_CONCURRENCY;

/// Parse and validate concurrency value
fn parse_concurrency(s: &str) -> Result<usize, String> {
    let value: usize = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;

    if value == 0 {
        return Err("concurrency must be at least 1".to_string());
    }
    if value > MAX_CONCURRENCY {
        return Err(format!(
            "concurrency {value} exceeds maximum of {MAX_CONCURRENCY}"
        ));
    }
    Ok(value)
}

/// Sensor Data Downloader CLI
#[derive(Parser, Debug)]
#[command(name = "sensor-data-downloader")]
#[command(about = "Download sensor measurements from rate-limited APIs and archives", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Output format (json or human)
    #[arg(long, global = true, default_value = "human")]
    pub output_format: OutputFormat,

    /// Checkpoint directory
    #[arg(long, global = true, default_value = ".checkpoints")]
    pub checkpoint_dir: PathBuf,
}

/// CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download measurements for a catalog of units
    Download(DownloadArgs),

    /// Inspect and repair checkpoints
    Checkpoints(super::CheckpointsCommand),

    /// List registered data sources
    Sources(super::SourcesCommand),
}

/// Download command arguments
#[derive(Parser, Debug)]
pub struct DownloadArgs {
    /// Registered source name (see `sources`)
    #[arg(long)]
    pub source: String,

    /// JSON file listing the units to fetch
    #[arg(long, conflicts_with = "months")]
    pub catalog: Option<PathBuf>,

    /// One unit per calendar month between --start and --end
    #[arg(long, default_value_t = false)]
    pub months: bool,

    /// Start date (YYYY-MM-DD or RFC 3339)
    #[arg(long)]
    pub start: String,

    /// End date, inclusive (YYYY-MM-DD or RFC 3339)
    #[arg(long)]
    pub end: String,

    /// Grouping key of archive containers (e.g. a prefecture)
    #[arg(long)]
    pub group: Option<String>,

    /// Job identifier; derived from the source and catalog when omitted
    #[arg(long)]
    pub job_id: Option<String>,

    /// Directory for new output files
    #[arg(long, default_value = "data")]
    pub output_dir: PathBuf,

    /// Append to this output file
    #[arg(long)]
    pub output_file: Option<PathBuf>,

    /// Archive cache directory
    #[arg(long, default_value = ".cache/archives")]
    pub cache_dir: PathBuf,

    /// Concurrently processed units (default: derived from API keys, max: 32)
    #[arg(long, value_parser = parse_concurrency)]
    pub concurrency: Option<usize>,

    /// Ignore existing checkpoints and start a new output file
    #[arg(long, default_value_t = false)]
    pub no_resume: bool,

    /// Serve Prometheus metrics on this address
    #[arg(long)]
    pub metrics_addr: Option<SocketAddr>,
}

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// JSON output
    Json,
    /// Human-readable output
    Human,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "human" => Ok(OutputFormat::Human),
            _ => Err(format!("Invalid output format: {s}")),
        }
    }
}

impl DownloadArgs {
    /// Run the download and print its summary
    pub async fn execute(&self, cli: &Cli, shutdown: SharedShutdown) -> Result<RunSummary, CliError> {
        let window = DateWindow::parse(&self.start, &self.end)
            .map_err(|e| CliError::InvalidArgument(e.to_string()))?;

        if let Some(addr) = self.metrics_addr {
            crate::metrics::init_metrics(addr)
                .await
                .map_err(|e| CliError::ConfigurationError(format!("metrics exporter: {e}")))?;
        }

        let descriptor = registry::lookup(&self.source)?;
        let source = create_source(&descriptor, &self.cache_dir)?;
        let catalog = self.catalog(descriptor.kind, window)?;
        let total_units = catalog.units().await?.len();

        let mut controls = JobControls::new(window, &self.output_dir)
            .with_cache_dir(&self.cache_dir)
            .with_resume(!self.no_resume);
        if let Some(path) = &self.output_file {
            controls = controls.with_output_file(path);
        }
        if let Some(concurrency) = self.concurrency {
            controls = controls.with_max_concurrency(concurrency);
        }
        let mut job = Job::new(self.job_id(), descriptor.name.clone(), controls);

        info!(
            source = %descriptor.name,
            job_id = %job.id,
            units = total_units,
            "Starting download"
        );

        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let bar = create_progress_bar(total_units as u64, &job.id);
        let bar_task = tokio::spawn(drive_progress_bar(bar.clone(), progress_rx));

        let runner = ResumableJobRunner::new(Arc::new(source), CheckpointStore::new(&cli.checkpoint_dir))
            .with_shutdown(shutdown)
            .with_progress(progress_tx);
        let result = runner.run(&mut job, catalog.as_ref()).await;
        drop(runner);
        let _ = bar_task.await;
        bar.finish_and_clear();

        match cli.output_format {
            OutputFormat::Json => output_json(&job, &result),
            OutputFormat::Human => output_human(&job, &result),
        }
        Ok(result?)
    }

    fn catalog(&self, kind: SourceKind, window: DateWindow) -> Result<Box<dyn Catalog>, CliError> {
        if let Some(path) = &self.catalog {
            return Ok(Box::new(JsonFileCatalog::new(path)));
        }
        if self.months || kind == SourceKind::Archive {
            return Ok(Box::new(ArchiveMonthCatalog::new(window, self.group.clone())));
        }
        Err(CliError::InvalidArgument(format!(
            "source '{}' needs a unit catalog: pass --catalog <file.json>",
            self.source
        )))
    }

    fn job_id(&self) -> String {
        if let Some(id) = &self.job_id {
            return id.clone();
        }
        let scope = match (&self.catalog, &self.group) {
            (Some(path), _) => file_stem(path),
            (None, Some(group)) => group.clone(),
            (None, None) => "all".to_string(),
        };
        format!("{}_{}", self.source.to_ascii_lowercase(), scope)
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "catalog".to_string())
}

async fn drive_progress_bar(bar: ProgressBar, mut events: mpsc::UnboundedReceiver<ProgressEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ProgressEvent::UnitStarted { key, .. } => bar.set_message(key.to_string()),
            ProgressEvent::UnitCompleted { .. } | ProgressEvent::UnitFailed { .. } => bar.inc(1),
        }
    }
}

/// Create progress bar with style
fn create_progress_bar(total_units: u64, job_id: &str) -> ProgressBar {
    let pb = ProgressBar::new(total_units);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} units ({percent}%) {msg}")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb.set_prefix(job_id.to_string());
    pb
}

/// Output result as JSON
fn output_json(job: &Job, result: &Result<RunSummary, crate::downloader::DownloadError>) {
    let output = match result {
        Ok(summary) => serde_json::json!({
            "success": true,
            "job_id": summary.job_id,
            "status": summary.status.to_string(),
            "output_file": summary.output_file.display().to_string(),
            "checkpoint_file": summary.checkpoint_file.display().to_string(),
            "total_units": summary.total_units,
            "skipped_units": summary.skipped_units,
            "completed_units": summary.completed_units,
            "failed_units": summary.failed_units,
            "records_written": summary.records_written,
            "cursor": summary.cursor,
            "elapsed_secs": summary.elapsed.as_secs_f64(),
        }),
        Err(e) => serde_json::json!({
            "success": false,
            "job_id": job.id,
            "status": job.status.to_string(),
            "error": e.to_string(),
        }),
    };
    println!("{output}");
}

/// Output result in human-readable format
fn output_human(job: &Job, result: &Result<RunSummary, crate::downloader::DownloadError>) {
    match result {
        Ok(summary) => {
            println!("\nDownload {}", summary.status);
            println!("Job: {}", summary.job_id);
            println!("Output: {}", summary.output_file.display());
            println!(
                "Units: {}/{} complete ({} skipped from earlier runs)",
                summary.cursor, summary.total_units, summary.skipped_units
            );
            println!("Records written: {}", summary.records_written);
            println!("{}/{} units failed", summary.failed_units, summary.total_units);
            if summary.failed_units > 0 {
                println!("Re-run the same command to retry the failed units.");
            }
        }
        Err(e) => {
            eprintln!("\nDownload failed!");
            eprintln!("Job: {}", job.id);
            eprintln!("Error: {e}");
            error!("Download failed: {}", e);
        }
    }
}
