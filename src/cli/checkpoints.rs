//! Checkpoint inspection commands

use super::download::OutputFormat;
use super::CliError;
use crate::resume::CheckpointStore;
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};

/// Checkpoints subcommand
#[derive(Debug, Args)]
pub struct CheckpointsCommand {
    #[command(subcommand)]
    action: CheckpointsAction,
}

#[derive(Debug, Subcommand)]
enum CheckpointsAction {
    /// One line per output file known to the history ledger
    List {
        /// Only outputs written by this job
        #[arg(long)]
        job: Option<String>,
    },
    /// Checkpoint and history of one output file
    Show {
        /// Output file to inspect
        #[arg(long)]
        file: PathBuf,
    },
    /// Rebuild the history ledger from the checkpoint files
    Rebuild,
}

impl CheckpointsCommand {
    /// Execute against the checkpoints in `dir`
    pub fn execute(&self, dir: &Path, format: OutputFormat) -> Result<(), CliError> {
        let store = CheckpointStore::new(dir);
        match &self.action {
            CheckpointsAction::List { job } => list(&store, job.as_deref(), format),
            CheckpointsAction::Show { file } => show(&store, file, format),
            CheckpointsAction::Rebuild => {
                let count = store.rebuild_history()?;
                match format {
                    OutputFormat::Json => println!("{}", serde_json::json!({ "entries": count })),
                    OutputFormat::Human => println!("Rebuilt history from {count} checkpoint(s)"),
                }
                Ok(())
            }
        }
    }
}

fn list(store: &CheckpointStore, job: Option<&str>, format: OutputFormat) -> Result<(), CliError> {
    let downloads = store.list_downloads(job)?;
    match format {
        OutputFormat::Json => println!("{}", to_json(&downloads)?),
        OutputFormat::Human => {
            if downloads.is_empty() {
                println!("No checkpointed downloads in {}", store.dir().display());
                return Ok(());
            }
            println!("Found {} download(s):\n", downloads.len());
            for d in downloads {
                let size = d
                    .size_bytes
                    .map(|b| format!("{b} bytes"))
                    .unwrap_or_else(|| "missing".to_string());
                println!(
                    "{} | {} | {}/{} units ({:.1}%) | {} | {}",
                    d.job_id,
                    d.output_file.display(),
                    d.cursor,
                    d.total_units,
                    d.progress_percent,
                    size,
                    d.last_update.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
    }
    Ok(())
}

fn show(store: &CheckpointStore, file: &Path, format: OutputFormat) -> Result<(), CliError> {
    let checkpoint = store.find_for_output(file)?;
    let history = store.history(file)?;
    match format {
        OutputFormat::Json => println!(
            "{}",
            to_json(&serde_json::json!({ "checkpoint": checkpoint, "history": history }))?
        ),
        OutputFormat::Human => {
            let Some(checkpoint) = checkpoint else {
                println!("No checkpoint found for {}", file.display());
                return Ok(());
            };
            println!("Job: {}", checkpoint.job_id);
            println!(
                "Cursor: {}/{} ({:.1}%)",
                checkpoint.cursor,
                checkpoint.total_units,
                checkpoint.progress_percent()
            );
            if let Some(unit) = &checkpoint.current_unit_id {
                println!("Last unit: {unit}");
            }
            println!("Records written: {}", checkpoint.records_written);
            if !checkpoint.completed_ahead.is_empty() {
                println!("Completed ahead of cursor: {}", checkpoint.completed_ahead.len());
            }
            if !checkpoint.failed.is_empty() {
                let failed: Vec<String> = checkpoint.failed.iter().map(ToString::to_string).collect();
                println!("Failed: {}", failed.join(", "));
            }
            println!("Updated: {}", checkpoint.timestamp.to_rfc3339());
            println!("History entries: {}", history.len());
        }
    }
    Ok(())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, CliError> {
    serde_json::to_string_pretty(value)
        .map_err(|e| CliError::ConfigurationError(format!("Failed to serialize output: {e}")))
}
