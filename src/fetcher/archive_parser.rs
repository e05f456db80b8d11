//! Streaming parser for nested monthly archives
//!
//! An outer ZIP holds one inner ZIP per region, and each inner ZIP holds
//! delimited text files. Leaf files come in several legacy encodings. The
//! parser walks the containers lazily, one leaf file in memory at a time,
//! and yields a [`Record`] per well-formed line inside the query window.

use chrono::{DateTime, FixedOffset, NaiveDateTime, Offset, TimeZone, Utc};
use encoding_rs::{Encoding, EUC_JP, SHIFT_JIS, UTF_8};
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{Cursor, Read, Seek};
use std::ops::Range;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};
use zip::ZipArchive;

use super::{FetcherError, FetcherResult};
use crate::{DateWindow, Record, RecordError};

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

// upper bound on buffer preallocation from a declared entry size
const MAX_PREALLOC: usize = 16 * 1024 * 1024;

/// Line layout and decoding settings
#[derive(Debug, Clone)]
pub struct ParserConfig {
    /// Field delimiter
    pub delimiter: char,
    /// Lines with fewer fields are malformed
    pub min_fields: usize,
    /// Column holding the local timestamp
    pub timestamp_column: usize,
    /// Column holding the measurement point id
    pub entity_column: usize,
    /// Column holding the measurement point name
    pub name_column: usize,
    /// Column holding the value
    pub value_column: usize,
    /// Accepted `strftime` layouts for naive local timestamps
    pub timestamp_formats: Vec<String>,
    /// Accepted layouts that are already in UTC
    pub utc_timestamp_formats: Vec<String>,
    /// Offset of naive timestamps from UTC, in seconds
    pub utc_offset_secs: i32,
    /// Unit label stamped on every record
    pub unit: String,
    /// Candidate encodings, tried in order
    pub encodings: Vec<&'static Encoding>,
    /// Extension of leaf data files
    pub leaf_extension: String,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            delimiter: ',',
            min_fields: 10,
            timestamp_column: 0,
            entity_column: 2,
            name_column: 3,
            value_column: 7,
            timestamp_formats: [
                "%Y/%m/%d %H:%M",
                "%Y/%m/%d %H:%M:%S",
                "%Y-%m-%d %H:%M:%S",
                "%Y-%m-%dT%H:%M:%S",
                "%Y-%m-%d %H:%M",
                "%Y年%m月%d日 %H時%M分",
                "%Y年%m月%d日 %H:%M",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            utc_timestamp_formats: vec!["%Y-%m-%dT%H:%M:%SZ".to_string(), "%Y-%m-%dT%H:%MZ".to_string()],
            utc_offset_secs: 9 * 3600,
            unit: "vehicles".to_string(),
            encodings: vec![UTF_8, SHIFT_JIS, EUC_JP],
            leaf_extension: ".csv".to_string(),
        }
    }
}

impl ParserConfig {
    fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_secs).unwrap_or_else(|| Utc.fix())
    }

    /// Parse a timestamp in any accepted layout, returning UTC
    pub fn parse_timestamp(&self, raw: &str) -> Option<DateTime<Utc>> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Some(ts.with_timezone(&Utc));
        }
        if let Some(ts) = self
            .utc_timestamp_formats
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        {
            return Some(ts.and_utc());
        }
        let offset = self.offset();
        self.timestamp_formats.iter().find_map(|fmt| {
            let naive = NaiveDateTime::parse_from_str(raw, fmt).ok()?;
            offset
                .from_local_datetime(&naive)
                .single()
                .map(|ts| ts.with_timezone(&Utc))
        })
    }

    fn is_leaf(&self, name: &str) -> bool {
        name.to_ascii_lowercase().ends_with(&self.leaf_extension)
    }
}

/// What to extract from an archive
#[derive(Debug, Clone)]
pub struct ArchiveQuery {
    /// Grouping key matched against inner container names; `None` reads all
    pub group: Option<String>,
    /// Parameter name for emitted records
    pub parameter: String,
    /// Inclusive timestamp window
    pub window: DateWindow,
}

/// Why a line was skipped
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MalformedRecordError {
    /// Not enough fields
    #[error("expected at least {expected} fields, found {found}")]
    TooFewFields {
        /// Fields on the line
        found: usize,
        /// Configured minimum
        expected: usize,
    },

    /// Timestamp matched no accepted layout
    #[error("unparseable timestamp '{0}'")]
    BadTimestamp(String),

    /// Empty or `-` value
    #[error("missing value")]
    MissingValue,

    /// Value is not a number
    #[error("non-numeric value '{0}'")]
    BadValue(String),

    /// Fields parsed but the record is invalid
    #[error(transparent)]
    InvalidRecord(#[from] RecordError),
}

/// Counters gathered while parsing one archive
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseStats {
    /// Inner containers opened
    pub containers_scanned: usize,
    /// Inner entries that could not be read or did not open as archives
    pub containers_skipped: usize,
    /// Leaf files skipped because their entry could not be read
    pub unreadable_files: usize,
    /// Leaf files decoded
    pub files_parsed: usize,
    /// Leaf files that needed lossy decoding
    pub decode_fallbacks: usize,
    /// Records emitted
    pub records: usize,
    /// Lines skipped as malformed
    pub malformed_lines: usize,
    /// Well-formed lines outside the window
    pub out_of_window: usize,
    /// No container matched the grouping key, so all were read
    pub group_fallback: bool,
}

/// Text produced by [`decode_text`]
#[derive(Debug)]
pub struct DecodedText {
    /// Decoded content
    pub text: String,
    /// Encoding that produced it
    pub encoding: &'static Encoding,
    /// Whether invalid bytes were substituted
    pub lossy: bool,
}

/// Decode with the first candidate that accepts every byte.
///
/// When none does, the last candidate decodes with replacement characters.
pub fn decode_text(candidates: &[&'static Encoding], bytes: &[u8]) -> DecodedText {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    for &encoding in candidates {
        if let Some(text) = encoding.decode_without_bom_handling_and_without_replacement(bytes) {
            return DecodedText {
                text: text.into_owned(),
                encoding,
                lossy: false,
            };
        }
    }
    let encoding = candidates.last().copied().unwrap_or(UTF_8);
    let (text, _) = encoding.decode_without_bom_handling(bytes);
    DecodedText {
        text: text.into_owned(),
        encoding,
        lossy: true,
    }
}

enum LineOutcome {
    Record(Record),
    OutOfWindow,
}

fn parse_line(
    config: &ParserConfig,
    query: &ArchiveQuery,
    source_file: &str,
    line: &str,
) -> Result<LineOutcome, MalformedRecordError> {
    let fields: Vec<&str> = line
        .split(config.delimiter)
        .map(|f| f.trim().trim_matches('"'))
        .collect();
    let needed = config
        .min_fields
        .max(config.timestamp_column + 1)
        .max(config.entity_column + 1)
        .max(config.name_column + 1)
        .max(config.value_column + 1);
    if fields.len() < needed {
        return Err(MalformedRecordError::TooFewFields {
            found: fields.len(),
            expected: needed,
        });
    }

    let raw_ts = fields[config.timestamp_column];
    let timestamp = config
        .parse_timestamp(raw_ts)
        .ok_or_else(|| MalformedRecordError::BadTimestamp(raw_ts.to_string()))?;

    let raw_value = fields[config.value_column];
    if raw_value.is_empty() || raw_value == "-" {
        return Err(MalformedRecordError::MissingValue);
    }
    let value = Decimal::from_str(raw_value)
        .or_else(|_| Decimal::from_scientific(raw_value))
        .map_err(|_| MalformedRecordError::BadValue(raw_value.to_string()))?;

    if !query.window.contains(timestamp) {
        return Ok(LineOutcome::OutOfWindow);
    }

    let record = Record::new(
        timestamp,
        fields[config.entity_column],
        query.parameter.clone(),
        value,
        config.unit.clone(),
    )?
    .with_metadata("point_name", fields[config.name_column])
    .with_metadata("source_file", source_file);
    Ok(LineOutcome::Record(record))
}

/// Parses nested archives into records.
///
/// Holds no state between calls; clones are cheap and independent.
#[derive(Debug, Clone, Default)]
pub struct NestedArchiveStreamParser {
    config: Arc<ParserConfig>,
}

impl NestedArchiveStreamParser {
    /// Create a parser
    pub fn new(config: ParserConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Settings in use
    pub fn config(&self) -> &ParserConfig {
        &self.config
    }

    /// Lazy record iterator over the archive at `path`.
    ///
    /// The iterator re-derives everything from the file, so calling this
    /// again restarts from the beginning.
    pub fn records(&self, path: &Path, query: &ArchiveQuery) -> FetcherResult<ArchiveRecords<File>> {
        let file = File::open(path)?;
        self.records_from_reader(file, query)
            .map_err(|e| match e {
                FetcherError::ArchiveIntegrityError(msg) => {
                    FetcherError::ArchiveIntegrityError(format!("{}: {msg}", path.display()))
                }
                other => other,
            })
    }

    /// Lazy record iterator over an in-memory or already opened archive
    pub fn records_from_reader<R: Read + Seek>(
        &self,
        reader: R,
        query: &ArchiveQuery,
    ) -> FetcherResult<ArchiveRecords<R>> {
        let outer = ZipArchive::new(reader).map_err(integrity)?;
        let mut stats = ParseStats::default();

        let mut containers = Vec::new();
        let mut top_leaves = Vec::new();
        for index in 0..outer.len() {
            let Some(name) = outer.name_for_index(index) else {
                continue;
            };
            if name.ends_with('/') {
                continue;
            }
            if name.to_ascii_lowercase().ends_with(".zip") {
                containers.push((index, name.to_string()));
            } else if self.config.is_leaf(name) {
                top_leaves.push(index);
            }
        }

        let selected: Vec<usize> = match &query.group {
            Some(group) => {
                let group = group.to_lowercase();
                let matching: Vec<usize> = containers
                    .iter()
                    .filter(|(_, name)| file_name(name).to_lowercase().contains(&group))
                    .map(|(index, _)| *index)
                    .collect();
                if matching.is_empty() && !containers.is_empty() {
                    warn!(
                        group = %group,
                        containers = containers.len(),
                        "No inner archive matches group, reading all of them"
                    );
                    stats.group_fallback = true;
                    containers.iter().map(|(index, _)| *index).collect()
                } else {
                    matching
                }
            }
            None => containers.iter().map(|(index, _)| *index).collect(),
        };

        let mut pending: VecDeque<Pending> = top_leaves.into_iter().map(Pending::Leaf).collect();
        pending.extend(selected.into_iter().map(Pending::Container));

        Ok(ArchiveRecords {
            config: self.config.clone(),
            query: query.clone(),
            outer,
            pending,
            inner: None,
            current: None,
            stats,
            done: false,
        })
    }

    /// Parse everything at once, returning records and counters
    pub fn collect(&self, path: &Path, query: &ArchiveQuery) -> FetcherResult<(Vec<Record>, ParseStats)> {
        let mut iter = self.records(path, query)?;
        let mut records = Vec::new();
        for item in iter.by_ref() {
            records.push(item?);
        }
        let stats = iter.into_stats();
        crate::metrics::record_malformed_lines(stats.malformed_lines as u64);
        Ok((records, stats))
    }
}

fn integrity(err: zip::result::ZipError) -> FetcherError {
    FetcherError::ArchiveIntegrityError(err.to_string())
}

fn file_name(entry: &str) -> &str {
    entry.rsplit('/').next().unwrap_or(entry)
}

enum Pending {
    Leaf(usize),
    Container(usize),
}

struct InnerContainer {
    name: String,
    archive: ZipArchive<Cursor<Vec<u8>>>,
    leaves: VecDeque<usize>,
}

struct LeafText {
    name: String,
    text: String,
    offset: usize,
    line_no: usize,
}

impl LeafText {
    /// Line number and byte range of the next line, without its terminator
    fn next_line(&mut self) -> Option<(usize, Range<usize>)> {
        if self.offset >= self.text.len() {
            return None;
        }
        let start = self.offset;
        let rest = &self.text[start..];
        let (mut end, advance) = match rest.find('\n') {
            Some(i) => (start + i, i + 1),
            None => (self.text.len(), rest.len()),
        };
        if self.text[start..end].ends_with('\r') {
            end -= 1;
        }
        self.offset += advance;
        self.line_no += 1;
        Some((self.line_no, start..end))
    }
}

fn read_entry<R: Read + Seek>(archive: &mut ZipArchive<R>, index: usize) -> FetcherResult<(String, Vec<u8>)> {
    let mut entry = archive.by_index(index).map_err(integrity)?;
    let name = entry.name().to_string();
    let declared = usize::try_from(entry.size()).unwrap_or(usize::MAX);
    let mut bytes = Vec::with_capacity(declared.min(MAX_PREALLOC));
    entry
        .read_to_end(&mut bytes)
        .map_err(|e| FetcherError::ArchiveIntegrityError(format!("{name}: {e}")))?;
    Ok((name, bytes))
}

fn decode_leaf(config: &ParserConfig, stats: &mut ParseStats, name: String, bytes: &[u8]) -> LeafText {
    let decoded = decode_text(&config.encodings, bytes);
    if decoded.lossy {
        warn!(
            file = %name,
            encoding = decoded.encoding.name(),
            "No candidate encoding decoded cleanly, substituting invalid bytes"
        );
        stats.decode_fallbacks += 1;
    } else {
        debug!(file = %name, encoding = decoded.encoding.name(), "Decoded leaf file");
    }
    stats.files_parsed += 1;
    LeafText {
        name,
        text: decoded.text,
        offset: 0,
        line_no: 0,
    }
}

/// Lazy iterator returned by [`NestedArchiveStreamParser::records`].
///
/// Malformed lines and unreadable entries are counted in [`ParseStats`] and
/// skipped. Only opening the outer archive can fail.
pub struct ArchiveRecords<R> {
    config: Arc<ParserConfig>,
    query: ArchiveQuery,
    outer: ZipArchive<R>,
    pending: VecDeque<Pending>,
    inner: Option<InnerContainer>,
    current: Option<LeafText>,
    stats: ParseStats,
    done: bool,
}

impl<R: Read + Seek> ArchiveRecords<R> {
    /// Counters so far
    pub fn stats(&self) -> &ParseStats {
        &self.stats
    }

    /// Consume the iterator, keeping its counters
    pub fn into_stats(self) -> ParseStats {
        self.stats
    }

    fn skip_leaf(&mut self, err: &FetcherError) {
        warn!(error = %err, "Skipping unreadable leaf file");
        self.stats.unreadable_files += 1;
    }

    fn next_leaf(&mut self) -> Option<LeafText> {
        loop {
            if let Some(inner) = &mut self.inner {
                let Some(index) = inner.leaves.pop_front() else {
                    self.inner = None;
                    continue;
                };
                match read_entry(&mut inner.archive, index) {
                    Ok((name, bytes)) => {
                        let name = format!("{}/{}", inner.name, name);
                        return Some(decode_leaf(&self.config, &mut self.stats, name, &bytes));
                    }
                    Err(e) => {
                        let e = match e {
                            FetcherError::ArchiveIntegrityError(msg) => {
                                FetcherError::ArchiveIntegrityError(format!("{}: {msg}", inner.name))
                            }
                            other => other,
                        };
                        self.skip_leaf(&e);
                    }
                }
                continue;
            }

            match self.pending.pop_front()? {
                Pending::Leaf(index) => match read_entry(&mut self.outer, index) {
                    Ok((name, bytes)) => {
                        return Some(decode_leaf(&self.config, &mut self.stats, name, &bytes));
                    }
                    Err(e) => self.skip_leaf(&e),
                },
                Pending::Container(index) => {
                    let (name, bytes) = match read_entry(&mut self.outer, index) {
                        Ok(entry) => entry,
                        Err(e) => {
                            warn!(error = %e, "Skipping unreadable inner archive");
                            self.stats.containers_skipped += 1;
                            continue;
                        }
                    };
                    match ZipArchive::new(Cursor::new(bytes)) {
                        Ok(archive) => {
                            let leaves: VecDeque<usize> = (0..archive.len())
                                .filter(|i| {
                                    archive
                                        .name_for_index(*i)
                                        .is_some_and(|n| self.config.is_leaf(n))
                                })
                                .collect();
                            debug!(container = %name, leaves = leaves.len(), "Opened inner archive");
                            self.stats.containers_scanned += 1;
                            self.inner = Some(InnerContainer {
                                name,
                                archive,
                                leaves,
                            });
                        }
                        Err(e) => {
                            warn!(container = %name, error = %e, "Skipping unreadable inner archive");
                            self.stats.containers_skipped += 1;
                        }
                    }
                }
            }
        }
    }
}

impl<R: Read + Seek> Iterator for ArchiveRecords<R> {
    type Item = FetcherResult<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }

            if let Some(leaf) = &mut self.current {
                let Some((line_no, range)) = leaf.next_line() else {
                    self.current = None;
                    continue;
                };
                let line = &leaf.text[range];
                if line_no == 1 || line.trim().is_empty() {
                    continue;
                }
                match parse_line(&self.config, &self.query, &leaf.name, line) {
                    Ok(LineOutcome::Record(record)) => {
                        self.stats.records += 1;
                        return Some(Ok(record));
                    }
                    Ok(LineOutcome::OutOfWindow) => self.stats.out_of_window += 1,
                    Err(reason) => {
                        debug!(file = %leaf.name, line = line_no, %reason, "Skipping malformed line");
                        self.stats.malformed_lines += 1;
                    }
                }
                continue;
            }

            match self.next_leaf() {
                Some(leaf) => self.current = Some(leaf),
                None => {
                    self.done = true;
                    return None;
                }
            }
        }
    }
}
