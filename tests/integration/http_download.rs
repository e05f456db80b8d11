//! Paged measurements API through the job runner

use super::support::serve;
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use sensor_data_downloader::downloader::retry::LinearBackoff;
use sensor_data_downloader::downloader::{
    Job, JobControls, JobStatus, KeyedRateLimiter, ResumableJobRunner, RetryPolicy,
};
use sensor_data_downloader::fetcher::{
    Credential, MeasurementsConfig, MeasurementsSource, MultiKeyHttpClient, StaticCatalog,
};
use sensor_data_downloader::resume::CheckpointStore;
use sensor_data_downloader::{DateWindow, SensorRef, Unit};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const PAGE_SIZE: usize = 2;

#[derive(Deserialize)]
struct PageQuery {
    page: usize,
    limit: usize,
}

struct Api {
    /// Rows per sensor id
    rows: HashMap<String, Vec<Value>>,
    /// Sensors answered with 500
    broken: Vec<String>,
    requests: AtomicUsize,
}

fn row(hour: u32, value: f64) -> Value {
    json!({
        "value": value,
        "parameter": { "name": "pm25", "units": "µg/m³" },
        "period": { "datetimeFrom": { "utc": format!("2024-01-05T{hour:02}:00:00Z") } }
    })
}

async fn measurements(
    State(api): State<Arc<Api>>,
    UrlPath(sensor): UrlPath<String>,
    Query(query): Query<PageQuery>,
) -> Response {
    api.requests.fetch_add(1, Ordering::SeqCst);
    if api.broken.contains(&sensor) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response();
    }
    let rows = api.rows.get(&sensor).cloned().unwrap_or_default();
    let page: Vec<Value> = rows
        .into_iter()
        .skip((query.page - 1) * query.limit)
        .take(query.limit)
        .collect();
    Json(json!({ "meta": { "page": query.page }, "results": page })).into_response()
}

async fn start(api: Api) -> (String, Arc<Api>) {
    let api = Arc::new(api);
    let app = Router::new()
        .route("/v3/sensors/{sensor}/measurements", get(measurements))
        .with_state(api.clone());
    let addr = serve(app).await;
    (format!("http://{addr}/v3"), api)
}

fn source(base: &str) -> MeasurementsSource {
    let client = MultiKeyHttpClient::new(
        Arc::new(reqwest::Client::new()),
        base,
        vec![Credential::new("key01", "a"), Credential::new("key02", "b")],
        KeyedRateLimiter::new(Duration::ZERO),
    )
    .with_retry_policy(RetryPolicy::new(
        2,
        LinearBackoff {
            base: Duration::from_millis(5),
            increment: Duration::ZERO,
            max: Duration::from_millis(5),
        },
    ));
    MeasurementsSource::new(
        "openaq",
        Arc::new(client),
        MeasurementsConfig {
            page_size: PAGE_SIZE,
            ..Default::default()
        },
    )
}

fn sensor(id: &str) -> SensorRef {
    SensorRef {
        id: id.to_string(),
        parameter: "pm25".to_string(),
        unit: None,
    }
}

#[tokio::test]
async fn test_location_units_page_through_sensors() {
    let mut rows = HashMap::new();
    rows.insert(
        "11".to_string(),
        (0..5).map(|h| row(h, 10.0 + f64::from(h))).collect(),
    );
    let mut short = vec![row(1, 3.5)];
    short.push(json!({ "parameter": { "name": "pm25" } }));
    rows.insert("12".to_string(), short);
    let (base, api) = start(Api {
        rows,
        broken: vec!["99".to_string()],
        requests: AtomicUsize::new(0),
    })
    .await;

    let dir = TempDir::new().unwrap();
    let window = DateWindow::parse("2024-01-01", "2024-01-31").unwrap();
    let catalog = StaticCatalog::new(vec![
        Unit::location("2178", vec![sensor("11"), sensor("12")]),
        Unit::location("3001", vec![sensor("99")]),
    ]);
    let runner = ResumableJobRunner::new(
        Arc::new(source(&base)),
        CheckpointStore::new(dir.path().join("checkpoints")),
    );
    let mut job = Job::new("jp", "openaq", JobControls::new(window, dir.path().join("out")));

    let summary = runner.run(&mut job, &catalog).await.unwrap();
    assert_eq!(summary.status, JobStatus::PartiallyFailed);
    assert_eq!(summary.completed_units, 1);
    assert_eq!(summary.failed_units, 1);
    // five rows of sensor 11, one valid row of sensor 12
    assert_eq!(summary.records_written, 6);
    // 11: pages 1-3, 12: a full first page then an empty one, 99: two attempts
    assert_eq!(api.requests.load(Ordering::SeqCst), 7);

    let mut reader = csv::Reader::from_path(&summary.output_file).unwrap();
    let rows: Vec<csv::StringRecord> = reader.records().map(Result::unwrap).collect();
    assert_eq!(rows.len(), 6);
    assert!(rows.iter().all(|r| &r[1] == "2178" && &r[2] == "pm25"));
    assert!(rows.iter().any(|r| &r[0] == "2024-01-05T04:00:00Z" && &r[3] == "14.0"));

    let sensors: Vec<String> = rows
        .iter()
        .map(|r| {
            let metadata: Value = serde_json::from_str(&r[6]).unwrap();
            metadata["sensor_id"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(sensors.iter().filter(|s| *s == "11").count(), 5);
    assert_eq!(sensors.iter().filter(|s| *s == "12").count(), 1);
}
