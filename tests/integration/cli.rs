//! End-to-end tests of the command line

use assert_cmd::Command;
use sensor_data_downloader::resume::{Checkpoint, CheckpointStore};
use serde_json::Value;
use tempfile::TempDir;

fn cli() -> Command {
    let mut cmd = Command::cargo_bin("sensor-data-downloader").unwrap();
    cmd.env("RUST_LOG", "off");
    cmd
}

fn stdout_json(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn test_sources_json_lists_registry() {
    let output = cli()
        .args(["sources", "--output-format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let sources = stdout_json(&output);
    let names: Vec<&str> = sources
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"openaq"));
    assert!(names.contains(&"jartic"));
}

#[test]
fn test_sources_single_entry() {
    let output = cli()
        .args(["sources", "OpenAQ", "--output-format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let sources = stdout_json(&output);
    assert_eq!(sources[0]["credential_env"], "OPENAQ_API_KEY");
    assert_eq!(sources[0]["kind"], "http");
}

#[test]
fn test_unknown_source_fails() {
    let dir = TempDir::new().unwrap();
    cli()
        .current_dir(dir.path())
        .args([
            "download",
            "--source",
            "nowhere",
            "--months",
            "--start",
            "2024-01-01",
            "--end",
            "2024-02-29",
        ])
        .assert()
        .failure();

    cli().args(["sources", "nowhere"]).assert().failure();
}

#[test]
fn test_invalid_arguments_are_rejected() {
    let dir = TempDir::new().unwrap();
    cli()
        .current_dir(dir.path())
        .args([
            "download",
            "--source",
            "jartic",
            "--start",
            "2024-01-01",
            "--end",
            "2024-01-31",
            "--concurrency",
            "0",
        ])
        .assert()
        .failure();

    cli()
        .current_dir(dir.path())
        .args([
            "download",
            "--source",
            "jartic",
            "--start",
            "2024-03-01",
            "--end",
            "2024-01-31",
        ])
        .assert()
        .failure();
}

#[test]
fn test_http_source_without_keys_fails() {
    let dir = TempDir::new().unwrap();
    cli()
        .current_dir(dir.path())
        .env_remove("OPENAQ_API_KEY")
        .args([
            "download",
            "--source",
            "openaq",
            "--start",
            "2024-01-01",
            "--end",
            "2024-01-31",
        ])
        .assert()
        .failure();
}

#[test]
fn test_checkpoints_list_empty_dir() {
    let dir = TempDir::new().unwrap();
    let output = cli()
        .args(["checkpoints", "list", "--checkpoint-dir"])
        .arg(dir.path())
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("No checkpointed downloads"));
}

#[test]
fn test_checkpoints_list_and_show() {
    let dir = TempDir::new().unwrap();
    let output_file = dir.path().join("openaq_jp.csv");
    std::fs::write(&output_file, "timestamp\n").unwrap();

    let store = CheckpointStore::new(dir.path().join("checkpoints"));
    let mut checkpoint = Checkpoint::new("openaq_jp", &output_file, 4);
    checkpoint.cursor = 1;
    store.save("openaq_jp", &checkpoint).unwrap();

    let output = cli()
        .args(["checkpoints", "list", "--output-format", "json", "--checkpoint-dir"])
        .arg(dir.path().join("checkpoints"))
        .output()
        .unwrap();
    assert!(output.status.success());
    let listed = stdout_json(&output);
    assert_eq!(listed[0]["job_id"], "openaq_jp");
    assert_eq!(listed[0]["cursor"], 1);
    assert_eq!(listed[0]["total_units"], 4);

    let output = cli()
        .args(["checkpoints", "show", "--output-format", "json", "--file"])
        .arg(&output_file)
        .arg("--checkpoint-dir")
        .arg(dir.path().join("checkpoints"))
        .output()
        .unwrap();
    assert!(output.status.success());
    let shown = stdout_json(&output);
    assert_eq!(shown["checkpoint"]["job_id"], "openaq_jp");
    assert_eq!(shown["history"].as_array().unwrap().len(), 1);

    let output = cli()
        .args(["checkpoints", "rebuild", "--output-format", "json", "--checkpoint-dir"])
        .arg(dir.path().join("checkpoints"))
        .output()
        .unwrap();
    assert!(output.status.success());
    assert_eq!(stdout_json(&output)["entries"], 1);
}
