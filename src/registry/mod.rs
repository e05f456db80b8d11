//! Source registry
//!
//! The registry lists the data sources the binary knows how to build, with
//! the endpoints, credential prefixes and rate budgets each needs. It is
//! embedded at compile time and resolved by name; unknown names are an error,
//! never a silent fallback.

use crate::downloader::config::DEFAULT_REQUESTS_PER_MINUTE;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Embedded registry data
const REGISTRY_JSON: &str = include_str!("sources.json");

/// Global registry instance (loaded once)
static REGISTRY: Lazy<Result<SourceRegistry, RegistryError>> =
    Lazy::new(|| SourceRegistry::from_json(REGISTRY_JSON));

/// How a source delivers data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Paged HTTP API behind API keys
    Http,
    /// Monthly ZIP archives
    Archive,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => f.write_str("http"),
            Self::Archive => f.write_str("archive"),
        }
    }
}

fn default_rpm() -> u32 {
    DEFAULT_REQUESTS_PER_MINUTE
}

/// Everything needed to build one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    /// Registry key
    pub name: String,
    /// Delivery mechanism
    pub kind: SourceKind,
    /// One-line description
    #[serde(default)]
    pub description: String,
    /// API or archive root
    pub base_url: String,
    /// Environment prefix of the API keys (`{PREFIX}_API_KEY`, `{PREFIX}_API_KEY_01`, ...)
    #[serde(default)]
    pub credential_prefix: Option<String>,
    /// Header carrying the API key
    #[serde(default)]
    pub auth_header: Option<String>,
    /// Requests per minute allowed per key
    #[serde(default = "default_rpm")]
    pub requests_per_minute: u32,
    /// Cache file prefix of archive buckets
    #[serde(default)]
    pub archive_prefix: Option<String>,
    /// Archive URL template (`{base}`, `{year}`, `{month}`)
    #[serde(default)]
    pub archive_url_template: Option<String>,
    /// Archive index page (`{base}` allowed)
    #[serde(default)]
    pub archive_index_url: Option<String>,
    /// Parameter name stamped on archive records
    #[serde(default)]
    pub parameter: Option<String>,
}

impl SourceDescriptor {
    /// Archive index URL with `{base}` expanded
    pub fn index_url(&self) -> Option<String> {
        self.archive_index_url
            .as_ref()
            .map(|url| url.replace("{base}", self.base_url.trim_end_matches('/')))
    }
}

/// Registry of known sources
#[derive(Debug, Clone)]
pub struct SourceRegistry {
    schema_version: String,
    sources: BTreeMap<String, SourceDescriptor>,
}

impl SourceRegistry {
    /// Load the embedded registry
    ///
    /// This is a singleton operation - the registry is loaded once and cached.
    pub fn load() -> Result<&'static Self, RegistryError> {
        REGISTRY.as_ref().map_err(Clone::clone)
    }

    /// Parse registry from JSON string
    pub fn from_json(json: &str) -> Result<Self, RegistryError> {
        let raw: RawRegistry = serde_json::from_str(json)
            .map_err(|e| RegistryError::ParseError(format!("Failed to parse registry: {e}")))?;

        let mut sources = BTreeMap::new();
        for source in raw.sources {
            let key = source.name.to_ascii_lowercase();
            if sources.insert(key, source).is_some() {
                return Err(RegistryError::ParseError(
                    "duplicate source name in registry".to_string(),
                ));
            }
        }

        Ok(Self {
            schema_version: raw.schema_version,
            sources,
        })
    }

    /// Registry schema version
    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }

    /// All sources, sorted by name
    pub fn entries(&self) -> impl Iterator<Item = &SourceDescriptor> {
        self.sources.values()
    }

    /// Look up a source by name (case-insensitive)
    pub fn get(&self, name: &str) -> Result<&SourceDescriptor, RegistryError> {
        self.sources
            .get(&name.to_ascii_lowercase())
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }
}

/// Resolve `name` against the embedded registry
pub fn lookup(name: &str) -> Result<SourceDescriptor, RegistryError> {
    SourceRegistry::load()?.get(name).cloned()
}

/// Raw registry structure for deserialization
#[derive(Debug, Deserialize)]
struct RawRegistry {
    schema_version: String,
    #[allow(dead_code)]
    last_updated: String,
    sources: Vec<SourceDescriptor>,
}

/// Errors that can occur when working with the registry
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    /// Failed to parse registry JSON
    #[error("registry parse error: {0}")]
    ParseError(String),

    /// Source not found in registry
    #[error("unknown source '{0}' (run `sources` to list them)")]
    NotFound(String),
}
