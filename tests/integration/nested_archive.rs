//! Nested archive parsing from files on disk

use super::support::{traffic_line, zip_bytes, HEADER};
use encoding_rs::SHIFT_JIS;
use rust_decimal::Decimal;
use sensor_data_downloader::fetcher::archive_parser::{ArchiveQuery, NestedArchiveStreamParser};
use sensor_data_downloader::DateWindow;
use std::path::PathBuf;
use tempfile::TempDir;

fn query(group: Option<&str>) -> ArchiveQuery {
    ArchiveQuery {
        group: group.map(str::to_string),
        parameter: "traffic_volume".to_string(),
        window: DateWindow::parse("2024-01-01", "2024-01-31").unwrap(),
    }
}

fn write_archive(dir: &TempDir, bytes: Vec<u8>) -> PathBuf {
    let path = dir.path().join("typeB_2024_01.zip");
    std::fs::write(&path, bytes).unwrap();
    path
}

#[test]
fn test_mixed_encodings_decode_to_same_text() {
    let body = format!("{HEADER}{}", traffic_line("2024/01/03 12:00", "1001", "10"));
    let (sjis, _, _) = SHIFT_JIS.encode(&body);
    let utf8_bom = [b"\xEF\xBB\xBF".as_slice(), body.as_bytes()].concat();

    let outer = zip_bytes(&[
        ("typeB_tokyo.zip", zip_bytes(&[("tokyo.csv", sjis.into_owned())])),
        ("typeB_osaka.zip", zip_bytes(&[("osaka.csv", body.clone().into_bytes())])),
        ("typeB_kyoto.zip", zip_bytes(&[("kyoto.csv", utf8_bom)])),
    ]);
    let dir = TempDir::new().unwrap();
    let path = write_archive(&dir, outer);

    let (records, stats) = NestedArchiveStreamParser::default()
        .collect(&path, &query(None))
        .unwrap();
    assert_eq!(records.len(), 3);
    assert!(records
        .iter()
        .all(|r| r.metadata()["point_name"] == "地点1001"));
    assert_eq!(stats.files_parsed, 3);
    assert_eq!(stats.decode_fallbacks, 0);
    assert_eq!(stats.malformed_lines, 0);
}

#[test]
fn test_malformed_lines_are_counted_not_fatal() {
    // W well-formed in window, X out of window, M malformed
    let mut body = HEADER.to_string();
    for day in 1..=5 {
        body.push_str(&traffic_line(&format!("2024/01/{day:02} 09:00"), "7", "3"));
    }
    for day in 1..=3 {
        body.push_str(&traffic_line(&format!("2024/02/{day:02} 09:00"), "7", "3"));
    }
    body.push_str("truncated,line\n");
    body.push_str(&traffic_line("yesterday", "7", "3"));
    body.push_str(&traffic_line("2024/01/09 09:00", "7", "-"));
    body.push_str(&traffic_line("2024/01/09 10:00", "7", "lots"));
    body.push('\n');

    let outer = zip_bytes(&[("typeB_x.zip", zip_bytes(&[("x.csv", body.into_bytes())]))]);
    let dir = TempDir::new().unwrap();
    let path = write_archive(&dir, outer);

    let (records, stats) = NestedArchiveStreamParser::default()
        .collect(&path, &query(None))
        .unwrap();
    assert_eq!(records.len(), 5);
    assert_eq!(stats.records, 5);
    assert_eq!(stats.out_of_window, 3);
    assert_eq!(stats.malformed_lines, 4);
    assert!(records.iter().all(|r| r.value() == Decimal::from(3)));
}

#[test]
fn test_crlf_and_top_level_leaves() {
    let body = format!(
        "{}{}",
        HEADER.replace('\n', "\r\n"),
        traffic_line("2024/01/20 18:00", "55", "9").replace('\n', "\r\n")
    );
    let outer = zip_bytes(&[
        ("readme.txt", b"not data".to_vec()),
        ("loose.csv", body.into_bytes()),
    ]);
    let dir = TempDir::new().unwrap();
    let path = write_archive(&dir, outer);

    let (records, stats) = NestedArchiveStreamParser::default()
        .collect(&path, &query(None))
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].entity_id(), "55");
    assert_eq!(records[0].value(), Decimal::from(9));
    assert_eq!(stats.containers_scanned, 0);
    assert_eq!(stats.files_parsed, 1);
}

#[test]
fn test_unreadable_inner_archive_is_skipped() {
    let good = format!("{HEADER}{}", traffic_line("2024/01/11 07:00", "1", "1"));
    let outer = zip_bytes(&[
        ("typeB_broken.zip", b"PK not really".to_vec()),
        ("typeB_good.zip", zip_bytes(&[("good.csv", good.into_bytes())])),
    ]);
    let dir = TempDir::new().unwrap();
    let path = write_archive(&dir, outer);

    let (records, stats) = NestedArchiveStreamParser::default()
        .collect(&path, &query(None))
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(stats.containers_scanned, 1);
    assert_eq!(stats.containers_skipped, 1);
}

#[test]
fn test_lazy_iteration_matches_collect() {
    let mut body = HEADER.to_string();
    for hour in 0..24 {
        body.push_str(&traffic_line(&format!("2024/01/15 {hour:02}:00"), "42", &hour.to_string()));
    }
    let outer = zip_bytes(&[
        ("typeB_a.zip", zip_bytes(&[("a.csv", body.clone().into_bytes())])),
        ("typeB_b.zip", zip_bytes(&[("b.csv", body.into_bytes())])),
    ]);
    let dir = TempDir::new().unwrap();
    let path = write_archive(&dir, outer);
    let parser = NestedArchiveStreamParser::default();

    let mut iter = parser.records(&path, &query(Some("typeB_a"))).unwrap();
    let first = iter.next().unwrap().unwrap();
    assert_eq!(first.value(), Decimal::from(0));
    assert_eq!(iter.stats().records, 1);

    let lazy: Vec<_> = parser
        .records(&path, &query(Some("typeB_a")))
        .unwrap()
        .map(Result::unwrap)
        .collect();
    let (collected, _) = parser.collect(&path, &query(Some("typeB_a"))).unwrap();
    assert_eq!(lazy.len(), 24);
    assert_eq!(lazy, collected);
}

#[test]
fn test_missing_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    let result = NestedArchiveStreamParser::default().records(&dir.path().join("absent.zip"), &query(None));
    assert!(result.is_err());
}
