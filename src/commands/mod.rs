//! CLI command handlers.

mod client;
mod request;
mod run;

use std::sync::Arc;

use anyhow::{Context, Result};
use bookfetch_core::{
    AcceptInPlace, Database, EventBus, HttpBackendProvider, ProwlarrIndexer, ReleaseIndexer,
    RequestLifecycle, Settings, Store,
};

use crate::cli::{AttentionCommand, Command};

pub use client::run_client_command;
pub use request::{run_cancel_command, run_request_command, run_retry_command, run_select_command};
pub use run::run_workers;

/// Builds the lifecycle with the production backend provider and post-processor.
pub fn build_lifecycle(db: Database, settings: &Settings) -> RequestLifecycle {
    RequestLifecycle::new(
        Store::new(db),
        Arc::new(HttpBackendProvider::new(settings.backends)),
        Arc::new(AcceptInPlace),
        settings,
        EventBus::default(),
    )
}

/// Builds the configured indexer client.
pub fn build_indexer(settings: &Settings) -> Result<Arc<dyn ReleaseIndexer>> {
    let indexer = settings.indexer.as_ref().context(
        "no [indexer] section in the config file\n  Suggestion: Add `[indexer]` with `base_url` and `api_key`",
    )?;
    let client = ProwlarrIndexer::new(&indexer.base_url, indexer.api_key.clone(), settings.backends)?;
    Ok(Arc::new(client))
}

/// Runs the parsed command.
pub async fn dispatch(command: &Command, lifecycle: &RequestLifecycle, settings: &Settings) -> Result<()> {
    match command {
        Command::Run => run_workers(lifecycle, settings).await,
        Command::Request { command } => run_request_command(command, lifecycle, settings).await,
        Command::Select {
            request_id,
            result_id,
        } => run_select_command(lifecycle, *request_id, *result_id).await,
        Command::Retry { request_id } => run_retry_command(lifecycle, *request_id).await,
        Command::Cancel { request_id, purge } => {
            run_cancel_command(lifecycle, *request_id, *purge).await
        }
        Command::Attention { command } => match command {
            AttentionCommand::Set {
                request_id,
                description,
            } => {
                lifecycle.mark_for_attention(*request_id, description).await?;
                println!("Request {request_id} flagged for attention.");
                Ok(())
            }
            AttentionCommand::Clear { request_id } => {
                lifecycle.clear_attention(*request_id).await?;
                println!("Request {request_id} attention cleared.");
                Ok(())
            }
        },
        Command::Client { command } => run_client_command(command, lifecycle).await,
    }
}
