//! CLI command implementations

pub mod checkpoints;
pub mod download;
pub mod error;
pub mod sources;

pub use checkpoints::CheckpointsCommand;
pub use download::{Cli, Commands, DownloadArgs, OutputFormat};
pub use error::CliError;
pub use sources::SourcesCommand;
