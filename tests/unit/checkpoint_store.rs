//! Checkpoint store behaviour across processes and file formats

use sensor_data_downloader::resume::{
    Checkpoint, CheckpointStore, CompletionTracker, ResumeError, SCHEMA_VERSION,
};
use sensor_data_downloader::UnitKey;
use serde_json::json;
use std::path::Path;
use tempfile::TempDir;

fn keys(n: usize) -> Vec<UnitKey> {
    (0..n).map(|i| UnitKey::new(format!("{}", 2178 + i))).collect()
}

fn write_json(path: &Path, value: &serde_json::Value) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, serde_json::to_string_pretty(value).unwrap()).unwrap();
}

#[test]
fn test_legacy_files_resume() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path());
    let output = dir.path().join("JP_measurements.csv");
    let checkpoint_file = store.checkpoint_path("JP");

    write_json(
        &checkpoint_file,
        &json!({
            "country_code": "JP",
            "location_index": 2,
            "total_locations": 4,
            "completed_locations": [2178, 2179],
            "output_file": output,
            "current_location_id": 2179,
            "timestamp": "2024-05-01T10:20:30.123456",
            "measurement_count": 812
        }),
    );
    let ledger_key = output.to_string_lossy().into_owned();
    write_json(
        &store.history_path(),
        &json!({
            ledger_key: [{
                "checkpoint_file": checkpoint_file,
                "location_index": 2,
                "total_locations": 4,
                "measurements_count": 812,
                "timestamp": "2024-05-01T10:20:30.123456"
            }]
        }),
    );

    let found = store.find_for_output(&output).unwrap().unwrap();
    assert_eq!(found.job_id, "JP");
    assert_eq!(found.cursor, 2);
    assert_eq!(found.records_written, 812);

    let tracker = CompletionTracker::resume(keys(4), &found).unwrap();
    assert_eq!(tracker.pending(), vec![2, 3]);

    // the next save writes the current schema and keeps the cursor
    store.save(&found.job_id, &tracker.checkpoint()).unwrap();
    let reloaded = store.load("JP").unwrap().unwrap();
    assert_eq!(reloaded.version, SCHEMA_VERSION);
    assert_eq!(reloaded.cursor, 2);
    assert_eq!(store.history(&output).unwrap().len(), 2);
}

#[test]
fn test_newer_schema_is_refused() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path());
    let mut checkpoint = Checkpoint::new("openaq_jp", dir.path().join("out.csv"), 3);
    checkpoint.version = SCHEMA_VERSION + 1;
    write_json(
        &store.checkpoint_path("openaq_jp"),
        &serde_json::to_value(&checkpoint).unwrap(),
    );

    assert!(matches!(
        store.load("openaq_jp"),
        Err(ResumeError::UnsupportedVersion { found, supported })
            if found == SCHEMA_VERSION + 1 && supported == SCHEMA_VERSION
    ));
}

#[test]
fn test_find_for_output_scans_without_ledger() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path().join("checkpoints"));
    let output = dir.path().join("traffic.csv");

    let mut checkpoint = Checkpoint::new("jartic_tokyo", &output, 12);
    checkpoint.cursor = 5;
    store.save("jartic_tokyo", &checkpoint).unwrap();
    store
        .save("other", &Checkpoint::new("other", dir.path().join("other.csv"), 1))
        .unwrap();
    std::fs::remove_file(store.history_path()).unwrap();

    let fresh = CheckpointStore::new(dir.path().join("checkpoints"));
    let found = fresh.find_for_output(&output).unwrap().unwrap();
    assert_eq!(found.job_id, "jartic_tokyo");
    assert_eq!(found.cursor, 5);
    assert!(fresh
        .find_for_output(&dir.path().join("missing.csv"))
        .unwrap()
        .is_none());
}

#[test]
fn test_list_downloads_filters_by_job() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path());
    for (job, cursor) in [("openaq_jp", 1), ("openaq_kr", 2), ("jartic_tokyo", 3)] {
        let mut checkpoint = Checkpoint::new(job, dir.path().join(format!("{job}.csv")), 4);
        checkpoint.cursor = cursor;
        store.save(job, &checkpoint).unwrap();
    }
    std::fs::write(dir.path().join("openaq_jp.csv"), "header\n").unwrap();

    let all = store.list_downloads(None).unwrap();
    assert_eq!(all.len(), 3);

    let openaq = store.list_downloads(Some("openaq")).unwrap();
    assert_eq!(openaq.len(), 2);
    assert!(openaq.iter().all(|s| s.job_id.starts_with("openaq")));

    let jp = openaq.iter().find(|s| s.job_id == "openaq_jp").unwrap();
    assert!(jp.exists);
    assert_eq!(jp.size_bytes, Some(7));
    assert_eq!(jp.progress_percent, 25.0);

    let kr = openaq.iter().find(|s| s.job_id == "openaq_kr").unwrap();
    assert!(!kr.exists);
    assert_eq!(kr.cursor, 2);
}

#[test]
fn test_regression_guard_is_per_output() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path());
    let mut checkpoint = Checkpoint::new("job", dir.path().join("a.csv"), 4);
    checkpoint.cursor = 3;
    store.save("job", &checkpoint).unwrap();

    // a new output file for the same job starts over at zero
    store
        .save("job", &Checkpoint::new("job", dir.path().join("b.csv"), 4))
        .unwrap();
    assert_eq!(store.load("job").unwrap().unwrap().cursor, 0);
}
