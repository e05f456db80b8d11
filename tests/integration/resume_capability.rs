//! Interrupted jobs resume to the same output as an uninterrupted run

use super::support::{month_catalog, window, CountingSource};
use sensor_data_downloader::downloader::{Job, JobControls, JobStatus, ResumableJobRunner};
use sensor_data_downloader::resume::{CheckpointStore, ResumeLock};
use sensor_data_downloader::shutdown::ShutdownCoordinator;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

fn job(id: &str, out_dir: &Path) -> Job {
    Job::new(
        id,
        "counting",
        JobControls::new(window(), out_dir).with_max_concurrency(2),
    )
}

fn runner(source: Arc<CountingSource>, checkpoints: &Path) -> ResumableJobRunner {
    ResumableJobRunner::new(source, CheckpointStore::new(checkpoints))
}

/// Data rows sorted, plus the number of header rows
fn rows(path: &PathBuf) -> (Vec<String>, usize) {
    let contents = std::fs::read_to_string(path).unwrap();
    let headers = contents
        .lines()
        .filter(|l| l.starts_with("timestamp,"))
        .count();
    let mut data: Vec<String> = contents
        .lines()
        .filter(|l| !l.starts_with("timestamp,"))
        .map(str::to_string)
        .collect();
    data.sort();
    (data, headers)
}

#[tokio::test]
async fn test_interrupted_run_resumes_to_uninterrupted_output() {
    let reference_dir = TempDir::new().unwrap();
    let reference = runner(
        Arc::new(CountingSource::new()),
        &reference_dir.path().join("checkpoints"),
    )
    .run(&mut job("stations", &reference_dir.path().join("out")), &month_catalog(5))
    .await
    .unwrap();
    assert_eq!(reference.status, JobStatus::Completed);
    let (expected, _) = rows(&reference.output_file);
    assert_eq!(expected.len(), 10);

    let dir = TempDir::new().unwrap();
    let checkpoints = dir.path().join("checkpoints");
    let out = dir.path().join("out");

    let shutdown = ShutdownCoordinator::shared();
    let interrupted_source = Arc::new(CountingSource::new().shutdown_after(3, shutdown.clone()));
    let interrupted = runner(interrupted_source, &checkpoints)
        .with_shutdown(shutdown)
        .run(&mut job("stations", &out), &month_catalog(5))
        .await
        .unwrap();
    assert_eq!(interrupted.status, JobStatus::Cancelled);
    assert!(interrupted.cursor < 5);

    let checkpoint = CheckpointStore::new(&checkpoints)
        .load("stations")
        .unwrap()
        .expect("checkpoint written before shutdown");
    assert_eq!(checkpoint.cursor, interrupted.cursor);

    let source = Arc::new(CountingSource::new());
    let resumed = runner(source.clone(), &checkpoints)
        .run(&mut job("stations", &out), &month_catalog(5))
        .await
        .unwrap();
    assert_eq!(resumed.status, JobStatus::Completed);
    assert_eq!(resumed.output_file, interrupted.output_file);
    assert_eq!(
        resumed.skipped_units,
        checkpoint.cursor + checkpoint.completed_ahead.len()
    );

    // confirmed units are never fetched again
    for (index, month) in (1..=5).enumerate() {
        let key = format!("2024-{month:02}");
        let confirmed = index < checkpoint.cursor
            || checkpoint.completed_ahead.iter().any(|k| k.as_str() == key);
        if confirmed {
            assert_eq!(source.calls(&key), 0, "{key} was fetched again");
        } else {
            assert_eq!(source.calls(&key), 1, "{key} was not fetched");
        }
    }

    let (actual, headers) = rows(&resumed.output_file);
    assert_eq!(headers, 1);
    assert_eq!(actual, expected);
}

#[tokio::test]
async fn test_header_written_once_across_resumes() {
    let dir = TempDir::new().unwrap();
    let checkpoints = dir.path().join("checkpoints");
    let out = dir.path().join("out");

    let first = runner(
        Arc::new(CountingSource::new().failing(&["2024-02", "2024-03"])),
        &checkpoints,
    )
    .run(&mut job("header", &out), &month_catalog(3))
    .await
    .unwrap();
    assert_eq!(first.status, JobStatus::PartiallyFailed);

    let second = runner(Arc::new(CountingSource::new().failing(&["2024-03"])), &checkpoints)
        .run(&mut job("header", &out), &month_catalog(3))
        .await
        .unwrap();
    assert_eq!(second.status, JobStatus::PartiallyFailed);
    assert_eq!(second.cursor, 2);

    let third = runner(Arc::new(CountingSource::new()), &checkpoints)
        .run(&mut job("header", &out), &month_catalog(3))
        .await
        .unwrap();
    assert_eq!(third.status, JobStatus::Completed);

    let (data, headers) = rows(&third.output_file);
    assert_eq!(headers, 1);
    assert_eq!(data.len(), 6);
}

#[tokio::test]
async fn test_explicit_output_file_finds_checkpoint_of_another_job() {
    let dir = TempDir::new().unwrap();
    let checkpoints = dir.path().join("checkpoints");
    let output = dir.path().join("shared.csv");

    let mut first = job("alpha", dir.path());
    first.controls = first.controls.clone().with_output_file(&output);
    let summary = runner(
        Arc::new(CountingSource::new().failing(&["2024-04"])),
        &checkpoints,
    )
    .run(&mut first, &month_catalog(4))
    .await
    .unwrap();
    assert_eq!(summary.failed_units, 1);

    let source = Arc::new(CountingSource::new());
    let mut second = job("beta", dir.path());
    second.controls = second.controls.clone().with_output_file(&output);
    let summary = runner(source.clone(), &checkpoints)
        .run(&mut second, &month_catalog(4))
        .await
        .unwrap();

    assert_eq!(summary.status, JobStatus::Completed);
    assert_eq!(summary.skipped_units, 3);
    assert_eq!(source.total_calls(), 1);
    assert_eq!(source.calls("2024-04"), 1);

    let (data, headers) = rows(&output);
    assert_eq!(headers, 1);
    assert_eq!(data.len(), 8);
}

#[tokio::test]
async fn test_missing_output_starts_fresh() {
    let dir = TempDir::new().unwrap();
    let checkpoints = dir.path().join("checkpoints");
    let out = dir.path().join("out");

    let first = runner(Arc::new(CountingSource::new().failing(&["2024-02"])), &checkpoints)
        .run(&mut job("lost", &out), &month_catalog(2))
        .await
        .unwrap();
    std::fs::remove_file(&first.output_file).unwrap();

    let source = Arc::new(CountingSource::new());
    let second = runner(source.clone(), &checkpoints)
        .run(&mut job("lost", &out), &month_catalog(2))
        .await
        .unwrap();
    assert_eq!(second.status, JobStatus::Completed);
    assert_eq!(second.skipped_units, 0);
    assert_eq!(source.total_calls(), 2);
    assert_eq!(rows(&second.output_file).0.len(), 4);
}

#[tokio::test]
async fn test_locked_output_is_fatal() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("busy.csv");
    let _held = ResumeLock::try_acquire(&output).unwrap();

    let source = Arc::new(CountingSource::new());
    let mut job = job("busy", dir.path());
    job.controls = job.controls.clone().with_output_file(&output);
    let result = runner(source.clone(), &dir.path().join("checkpoints"))
        .run(&mut job, &month_catalog(2))
        .await;

    assert!(result.is_err());
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(source.total_calls(), 0);
}
