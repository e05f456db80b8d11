//! Archive fetcher against a local server

use super::support::{serve, traffic_line, zip_bytes, HEADER};
use axum::extract::{Path as UrlPath, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use encoding_rs::SHIFT_JIS;
use sensor_data_downloader::downloader::{Job, JobControls, JobStatus, ResumableJobRunner};
use sensor_data_downloader::fetcher::archive_parser::ParserConfig;
use sensor_data_downloader::fetcher::{
    ArchiveBucket, ArchiveFetcher, ArchiveFetcherConfig, ArchiveMonthCatalog, ArchiveSource,
    FetcherError,
};
use sensor_data_downloader::resume::CheckpointStore;
use sensor_data_downloader::DateWindow;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

#[derive(Default)]
struct ArchiveServer {
    files: HashMap<String, Vec<u8>>,
    requests: Mutex<Vec<(String, Option<String>)>>,
}

impl ArchiveServer {
    fn with_file(mut self, name: &str, bytes: Vec<u8>) -> Self {
        self.files.insert(name.to_string(), bytes);
        self
    }

    fn requests_for(&self, name: &str) -> Vec<Option<String>> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(file, _)| file == name)
            .map(|(_, range)| range.clone())
            .collect()
    }
}

async fn archive(
    State(server): State<Arc<ArchiveServer>>,
    UrlPath(file): UrlPath<String>,
    headers: HeaderMap,
) -> Response {
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    server
        .requests
        .lock()
        .unwrap()
        .push((file.clone(), range.clone()));

    let Some(bytes) = server.files.get(&file) else {
        return (StatusCode::NOT_FOUND, "no such archive").into_response();
    };
    let offset = range
        .as_deref()
        .and_then(|r| r.strip_prefix("bytes="))
        .and_then(|r| r.strip_suffix('-'))
        .and_then(|r| r.parse::<usize>().ok());
    match offset {
        Some(offset) if offset < bytes.len() => (
            StatusCode::PARTIAL_CONTENT,
            [(
                header::CONTENT_RANGE,
                format!("bytes {offset}-{}/{}", bytes.len() - 1, bytes.len()),
            )],
            bytes[offset..].to_vec(),
        )
            .into_response(),
        _ => (StatusCode::OK, bytes.clone()).into_response(),
    }
}

async fn index(State(server): State<Arc<ArchiveServer>>) -> Response {
    let mut names: Vec<&String> = server.files.keys().collect();
    names.sort();
    let links: String = names
        .iter()
        .map(|n| format!("<a href=\"{n}\">{n}</a>\n"))
        .collect();
    format!("<html><body>{links}<a href=\"readme.txt\">readme</a></body></html>").into_response()
}

async fn start(server: ArchiveServer) -> (String, Arc<ArchiveServer>) {
    let server = Arc::new(server);
    let app = Router::new()
        .route("/archives/", get(index))
        .route("/archives/{file}", get(archive))
        .with_state(server.clone());
    let addr = serve(app).await;
    (format!("http://{addr}/archives"), server)
}

fn month_archive(month: u32) -> Vec<u8> {
    let ts = format!("2024/{month:02}/10 08:00");
    let tokyo = format!(
        "{HEADER}{}{}",
        traffic_line(&ts, "1001", "120"),
        traffic_line(&ts, "1002", "80")
    );
    let (tokyo, _, _) = SHIFT_JIS.encode(&tokyo);
    let aichi = format!("{HEADER}{}", traffic_line(&ts, "2001", "55"));
    zip_bytes(&[
        (
            &format!("typeB_tokyo_2024_{month:02}.zip"),
            zip_bytes(&[("tokyo.csv", tokyo.into_owned())]),
        ),
        (
            &format!("typeB_aichi_2024_{month:02}.zip"),
            zip_bytes(&[("aichi.csv", aichi.into_bytes())]),
        ),
    ])
}

fn fetcher(base: &str, cache: &TempDir) -> ArchiveFetcher {
    ArchiveFetcher::new(ArchiveFetcherConfig::new(base, cache.path()).with_file_prefix("traffic"))
}

#[tokio::test]
async fn test_second_download_is_served_from_cache() {
    let (base, server) = start(ArchiveServer::default().with_file("2024_01.zip", month_archive(1))).await;
    let cache = TempDir::new().unwrap();
    let fetcher = fetcher(&base, &cache);
    let bucket = ArchiveBucket::new(2024, 1).unwrap();

    let first = fetcher.download(bucket).await.unwrap();
    let second = fetcher.download(bucket).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first, cache.path().join("traffic_2024_01.zip"));
    assert_eq!(server.requests_for("2024_01.zip").len(), 1);
    assert_eq!(std::fs::read(&first).unwrap(), month_archive(1));
}

#[tokio::test]
async fn test_concurrent_downloads_share_one_transfer() {
    let (base, server) = start(ArchiveServer::default().with_file("2024_02.zip", month_archive(2))).await;
    let cache = TempDir::new().unwrap();
    let fetcher = Arc::new(fetcher(&base, &cache));
    let bucket = ArchiveBucket::new(2024, 2).unwrap();

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let fetcher = fetcher.clone();
            tokio::spawn(async move { fetcher.download(bucket).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert_eq!(server.requests_for("2024_02.zip").len(), 1);
}

#[tokio::test]
async fn test_partial_download_resumes_with_range() {
    let bytes = month_archive(3);
    let (base, server) = start(ArchiveServer::default().with_file("2024_03.zip", bytes.clone())).await;
    let cache = TempDir::new().unwrap();
    let fetcher = fetcher(&base, &cache);
    let bucket = ArchiveBucket::new(2024, 3).unwrap();

    let half = bytes.len() / 2;
    let tmp = cache.path().join("traffic_2024_03.zip.tmp");
    std::fs::write(&tmp, &bytes[..half]).unwrap();

    let path = fetcher.download(bucket).await.unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), bytes);
    assert!(!tmp.exists());
    assert_eq!(
        server.requests_for("2024_03.zip"),
        vec![Some(format!("bytes={half}-"))]
    );
}

#[tokio::test]
async fn test_corrupt_cache_is_downloaded_again() {
    let (base, server) = start(ArchiveServer::default().with_file("2024_04.zip", month_archive(4))).await;
    let cache = TempDir::new().unwrap();
    let fetcher = fetcher(&base, &cache);
    let bucket = ArchiveBucket::new(2024, 4).unwrap();
    std::fs::write(fetcher.cache_path(bucket), b"truncated garbage").unwrap();

    let path = fetcher.download(bucket).await.unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), month_archive(4));
    assert_eq!(server.requests_for("2024_04.zip").len(), 1);
}

#[tokio::test]
async fn test_missing_archive_is_not_cached() {
    let (base, server) = start(ArchiveServer::default()).await;
    let cache = TempDir::new().unwrap();
    let fetcher = fetcher(&base, &cache);
    let bucket = ArchiveBucket::new(2023, 12).unwrap();

    let err = fetcher.download(bucket).await.unwrap_err();
    assert!(matches!(err, FetcherError::DataSourceError(_)));
    assert!(!fetcher.cache_path(bucket).exists());
    assert_eq!(server.requests_for("2023_12.zip").len(), 1);
}

#[tokio::test]
async fn test_index_lists_monthly_archives() {
    let (base, _server) = start(
        ArchiveServer::default()
            .with_file("2024_01.zip", month_archive(1))
            .with_file("2024_02.zip", month_archive(2)),
    )
    .await;
    let cache = TempDir::new().unwrap();
    let fetcher = ArchiveFetcher::new(
        ArchiveFetcherConfig::new(&base, cache.path()).with_index_url(format!("{base}/")),
    );

    let archives = fetcher.list_archives().await.unwrap();
    let buckets: Vec<String> = archives.iter().map(|a| a.bucket.to_string()).collect();
    assert_eq!(buckets, vec!["2024-01", "2024-02"]);
    assert!(archives.iter().all(|a| !a.verified && a.size.is_none()));
    assert_eq!(archives[0].url, format!("{base}/2024_01.zip"));

    fetcher.download(archives[0].bucket).await.unwrap();
    let info = fetcher.archive_info(archives[0].bucket).await;
    assert!(info.verified);
}

#[tokio::test]
async fn test_archive_job_end_to_end() {
    let (base, server) = start(
        ArchiveServer::default()
            .with_file("2024_01.zip", month_archive(1))
            .with_file("2024_02.zip", month_archive(2)),
    )
    .await;
    let dir = TempDir::new().unwrap();
    let source = ArchiveSource::new(
        ArchiveFetcher::new(
            ArchiveFetcherConfig::new(&base, dir.path().join("cache")).with_file_prefix("traffic"),
        ),
        ParserConfig::default(),
        "traffic_volume",
    )
    .with_name("traffic");

    let window = DateWindow::parse("2024-01-01", "2024-02-29").unwrap();
    let catalog = ArchiveMonthCatalog::new(window, Some("tokyo".to_string()));
    let runner = ResumableJobRunner::new(Arc::new(source), CheckpointStore::new(dir.path().join("checkpoints")));

    let mut job = Job::new("tokyo", "traffic", JobControls::new(window, dir.path().join("out")));
    let summary = runner.run(&mut job, &catalog).await.unwrap();
    assert_eq!(summary.status, JobStatus::Completed);
    assert_eq!(summary.total_units, 2);
    assert_eq!(summary.records_written, 4);

    let contents = std::fs::read_to_string(&summary.output_file).unwrap();
    assert!(contents.contains("地点1001"));
    assert!(!contents.contains("2001"));

    // a rerun of the finished job touches neither the network nor the output
    let mut rerun = Job::new("tokyo", "traffic", JobControls::new(window, dir.path().join("out")));
    let again = runner.run(&mut rerun, &catalog).await.unwrap();
    assert_eq!(again.status, JobStatus::Completed);
    assert_eq!(again.skipped_units, 2);
    assert_eq!(std::fs::read_to_string(&summary.output_file).unwrap(), contents);
    assert_eq!(server.requests_for("2024_01.zip").len(), 1);
    assert_eq!(server.requests_for("2024_02.zip").len(), 1);
}
