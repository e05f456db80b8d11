//! API key discovery

use sensor_data_downloader::fetcher::credentials::discover_credentials;
use sensor_data_downloader::fetcher::Credential;

fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[test]
fn test_numbered_series_wins_over_single_key() {
    let keys = discover_credentials(
        "firms",
        vars(&[
            ("FIRMS_API_KEY", "single"),
            ("FIRMS_API_KEY_03", "third"),
            ("FIRMS_API_KEY_01", "first"),
            ("PATH", "/usr/bin"),
        ]),
    );
    let labels: Vec<&str> = keys.iter().map(Credential::label).collect();
    assert_eq!(labels, vec!["key01", "key03"]);
    assert_eq!(keys[0].secret(), "first");
}

#[test]
fn test_malformed_suffixes_and_blank_values_are_ignored() {
    let keys = discover_credentials(
        "OPENAQ",
        vars(&[
            ("OPENAQ_API_KEY_1", "one digit"),
            ("OPENAQ_API_KEY_001", "three digits"),
            ("OPENAQ_API_KEY_00", "zero"),
            ("OPENAQ_API_KEY_02", "   "),
            ("OPENAQ_API_KEY", " trimmed "),
        ]),
    );
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].label(), "key");
    assert_eq!(keys[0].secret(), "trimmed");
}

#[test]
fn test_no_keys() {
    assert!(discover_credentials("OPENAQ", vars(&[("OTHER_API_KEY", "x")])).is_empty());
}

#[test]
fn test_debug_redacts_secret() {
    let credential = Credential::new("key01", "super-secret-value");
    let rendered = format!("{credential:?}");
    assert!(rendered.contains("key01"));
    assert!(!rendered.contains("super-secret-value"));
}
