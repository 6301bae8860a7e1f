//! Run command handler: start the workers and stop them on Ctrl-C.

use std::sync::Arc;

use anyhow::Result;
use bookfetch_core::{LifecycleEvent, RequestLifecycle, Settings, Workers};
use tracing::{debug, info, warn};

use super::build_indexer;

pub async fn run_workers(lifecycle: &RequestLifecycle, settings: &Settings) -> Result<()> {
    let indexer = build_indexer(settings)?;
    let lifecycle = Arc::new(lifecycle.clone());

    let mut events = lifecycle.events().subscribe();
    let event_log = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event log fell behind");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let workers = Workers::spawn(Arc::clone(&lifecycle), indexer, settings.workers);
    info!("Bookfetch running. Press Ctrl-C to stop.");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    workers.shutdown().await;
    event_log.abort();
    Ok(())
}

fn log_event(event: &LifecycleEvent) {
    match event {
        LifecycleEvent::AttentionRaised {
            request_id,
            description,
        } => warn!(request_id, description = %description, "request needs attention"),
        LifecycleEvent::RetriesExhausted {
            request_id,
            retry_count,
        } => warn!(request_id, retry_count, "retries exhausted"),
        LifecycleEvent::StatusChanged {
            request_id,
            from,
            to,
        } => info!(request_id, from = %from, to = %to, "request status changed"),
        other => debug!(request_id = other.request_id(), ?other, "lifecycle event"),
    }
}
