//! Catalog loading and unit ordering

use sensor_data_downloader::fetcher::{ArchiveMonthCatalog, Catalog, FetcherError, JsonFileCatalog};
use sensor_data_downloader::{DateWindow, Unit, UnitKind};
use tempfile::TempDir;

#[tokio::test]
async fn test_sensor_units_keep_file_order() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sensors.json");
    std::fs::write(
        &path,
        r#"[
            {"key": "901", "kind": "sensor", "entity_id": "2178",
             "sensor": {"id": "901", "parameter": "no2", "unit": "ppb"}},
            {"key": 17, "kind": "sensor", "entity_id": "2178",
             "sensor": {"id": "17", "parameter": "pm25"}},
            {"key": "2024-03/osaka", "kind": "archive_month", "year": 2024, "month": 3, "group": "osaka"}
        ]"#,
    )
    .unwrap();

    let catalog = JsonFileCatalog::new(&path);
    let units = catalog.units().await.unwrap();
    let keys: Vec<&str> = units.iter().map(|u| u.key.as_str()).collect();
    assert_eq!(keys, vec!["901", "17", "2024-03/osaka"]);

    match &units[1].kind {
        UnitKind::Sensor { entity_id, sensor } => {
            assert_eq!(entity_id, "2178");
            assert_eq!(sensor.parameter, "pm25");
            assert!(sensor.unit.is_none());
        }
        other => panic!("unexpected kind {other:?}"),
    }
    assert_eq!(units[2], Unit::archive_month(2024, 3, Some("osaka".into())));

    // same order on every call
    assert_eq!(catalog.units().await.unwrap(), units);
}

#[tokio::test]
async fn test_wrapped_catalog_rejects_duplicate_keys() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("dupes.json");
    std::fs::write(
        &path,
        r#"{"units": [
            {"key": "2024-01", "kind": "archive_month", "year": 2024, "month": 1},
            {"key": "2024-01", "kind": "archive_month", "year": 2024, "month": 1}
        ]}"#,
    )
    .unwrap();

    assert!(matches!(
        JsonFileCatalog::new(&path).units().await,
        Err(FetcherError::DataSourceError(_))
    ));
}

#[tokio::test]
async fn test_missing_catalog_file() {
    let dir = TempDir::new().unwrap();
    assert!(matches!(
        JsonFileCatalog::new(dir.path().join("nope.json")).units().await,
        Err(FetcherError::IoError(_))
    ));
}

#[tokio::test]
async fn test_month_catalog_spans_years() {
    let window = DateWindow::parse("2023-11-30", "2024-02-29").unwrap();
    let units = ArchiveMonthCatalog::new(window, None).units().await.unwrap();
    let keys: Vec<&str> = units.iter().map(|u| u.key.as_str()).collect();
    assert_eq!(keys, vec!["2023-11", "2023-12", "2024-01", "2024-02"]);
    assert!(matches!(
        units[1].kind,
        UnitKind::ArchiveMonth { year: 2023, month: 12, group: None }
    ));
}

#[tokio::test]
async fn test_month_catalog_single_day() {
    let window = DateWindow::parse("2024-06-15", "2024-06-15").unwrap();
    let units = ArchiveMonthCatalog::new(window, Some("tokyo".into()))
        .units()
        .await
        .unwrap();
    assert_eq!(units, vec![Unit::archive_month(2024, 6, Some("tokyo".into()))]);
}
