//! CLI entry point for bookfetch.

use anyhow::{Context, Result};
use bookfetch_core::{Database, Settings};
use clap::Parser;
use tracing::debug;

mod cli;
mod commands;

use cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let cli = Cli::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?cli, "CLI arguments parsed");

    let mut settings = Settings::load(&cli.config)?;
    if let Some(path) = &cli.database {
        settings.database.path.clone_from(path);
    }

    let db = Database::new_with_options(&settings.database.path, settings.database.options())
        .await
        .with_context(|| format!("cannot open database {}", settings.database.path.display()))?;
    debug!(database = %settings.database.path.display(), "database ready");

    let lifecycle = commands::build_lifecycle(db.clone(), &settings);
    let result = commands::dispatch(&cli.command, &lifecycle, &settings).await;
    db.close().await;
    result
}
