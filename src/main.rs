//! Main entry point for the sensor-data-downloader CLI

use clap::Parser;
use sensor_data_downloader::cli::{Cli, Commands};
use sensor_data_downloader::shutdown::{self, ShutdownCoordinator};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber with optional JSON formatting.
///
/// Logs go to stderr; stdout carries command output.
fn init_tracing() {
    let json_format = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("sensor_data_downloader=info"));

    if json_format {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() {
    // API keys may live in a local .env file
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();

    // Install global shutdown coordinator and Ctrl+C handler
    let shutdown = ShutdownCoordinator::shared();
    shutdown::set_global_shutdown(shutdown.clone());
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Ctrl+C received - finishing in-flight writes...");
                shutdown.request_shutdown();
            }
        }
    });

    let result = match cli.command {
        Commands::Download(ref args) => args
            .execute(&cli, shutdown.clone())
            .await
            .map(|_| ())
            .map_err(|e| anyhow::anyhow!(e)),
        Commands::Checkpoints(ref cmd) => cmd
            .execute(&cli.checkpoint_dir, cli.output_format)
            .map_err(|e| anyhow::anyhow!(e)),
        Commands::Sources(ref cmd) => cmd.execute(cli.output_format),
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }
}
