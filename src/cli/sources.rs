//! CLI command for listing registered data sources

use super::download::OutputFormat;
use crate::registry::{SourceDescriptor, SourceRegistry};
use anyhow::{Context, Result};
use clap::Args;
use serde_json::json;

/// Sources subcommand
#[derive(Debug, Args)]
pub struct SourcesCommand {
    /// Show a single source
    name: Option<String>,
}

impl SourcesCommand {
    /// Print the registry
    pub fn execute(&self, format: OutputFormat) -> Result<()> {
        let registry = SourceRegistry::load().context("Failed to load source registry")?;

        let sources: Vec<&SourceDescriptor> = match &self.name {
            Some(name) => vec![registry.get(name)?],
            None => registry.entries().collect(),
        };

        match format {
            OutputFormat::Json => {
                let rows: Vec<_> = sources
                    .iter()
                    .map(|s| {
                        json!({
                            "name": s.name,
                            "kind": s.kind.to_string(),
                            "description": s.description,
                            "base_url": s.base_url,
                            "credential_env": s.credential_prefix.as_ref().map(|p| format!("{p}_API_KEY")),
                            "requests_per_minute": s.requests_per_minute,
                        })
                    })
                    .collect();
                println!(
                    "{}",
                    serde_json::to_string_pretty(&rows).context("Failed to serialize sources to JSON")?
                );
            }
            OutputFormat::Human => {
                println!("Found {} source(s):\n", sources.len());
                for s in sources {
                    let credentials = s
                        .credential_prefix
                        .as_ref()
                        .map(|p| format!("{p}_API_KEY[_NN] @ {} rpm/key", s.requests_per_minute))
                        .unwrap_or_else(|| "no credentials".to_string());
                    println!("{} | {} | {} | {}", s.name, s.kind, s.base_url, credentials);
                    if !s.description.is_empty() {
                        println!("    {}", s.description);
                    }
                }
            }
        }

        Ok(())
    }
}
