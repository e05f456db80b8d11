//! API key discovery
//!
//! A source's keys are read from the environment either as one variable
//! (`OPENAQ_API_KEY`) or as a numbered series (`OPENAQ_API_KEY_01` ..
//! `OPENAQ_API_KEY_99`). The numbered series wins when present and is ordered
//! by suffix, which fixes the key rotation order.

use std::fmt;

/// Credential discovery errors
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// No usable key was found for the prefix
    #[error("no API keys found: set {prefix}_API_KEY or {prefix}_API_KEY_01..{prefix}_API_KEY_99")]
    NoCredentials {
        /// Variable prefix that was searched
        prefix: String,
    },
}

/// One API key with a stable, loggable label
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    label: String,
    secret: String,
}

impl Credential {
    /// Create a credential
    pub fn new(label: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            secret: secret.into(),
        }
    }

    /// Label safe to log (`key01`, `key`)
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The secret value
    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("label", &self.label)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Discover credentials for `prefix` among `vars`.
///
/// Numbered suffixes must be exactly two digits in `01..=99`; anything else
/// (`_1`, `_001`, `_00`) is ignored. Empty values are skipped.
pub fn discover_credentials<I>(prefix: &str, vars: I) -> Vec<Credential>
where
    I: IntoIterator<Item = (String, String)>,
{
    let base = format!("{}_API_KEY", prefix.to_uppercase());
    let numbered_prefix = format!("{base}_");

    let mut single = None;
    let mut numbered: Vec<(u8, String)> = Vec::new();

    for (name, value) in vars {
        let value = value.trim().to_string();
        if value.is_empty() {
            continue;
        }
        if name == base {
            single = Some(value);
        } else if let Some(suffix) = name.strip_prefix(&numbered_prefix) {
            if let Some(n) = parse_key_suffix(suffix) {
                numbered.push((n, value));
            }
        }
    }

    if !numbered.is_empty() {
        numbered.sort_by_key(|(n, _)| *n);
        return numbered
            .into_iter()
            .map(|(n, secret)| Credential::new(format!("key{n:02}"), secret))
            .collect();
    }

    single
        .map(|secret| vec![Credential::new("key", secret)])
        .unwrap_or_default()
}

fn parse_key_suffix(suffix: &str) -> Option<u8> {
    if suffix.len() != 2 || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let n: u8 = suffix.parse().ok()?;
    (1..=99).contains(&n).then_some(n)
}

/// Discover credentials from the process environment
pub fn credentials_from_env(prefix: &str) -> Result<Vec<Credential>, CredentialError> {
    let keys = discover_credentials(prefix, std::env::vars());
    if keys.is_empty() {
        return Err(CredentialError::NoCredentials {
            prefix: prefix.to_uppercase(),
        });
    }
    Ok(keys)
}
