//! Request command handlers: intake, listing, inspection, and operator mutators.

use anyhow::Result;
use bookfetch_core::{
    NewBook, Request, RequestIntake, RequestLifecycle, RetryNowOutcome, SearchOutcome, Settings,
};
use chrono::Utc;

use super::build_indexer;
use crate::cli::{RequestAddArgs, RequestCommand, RequestListArgs};

pub async fn run_request_command(
    command: &RequestCommand,
    lifecycle: &RequestLifecycle,
    settings: &Settings,
) -> Result<()> {
    match command {
        RequestCommand::Add(args) => add(lifecycle, args).await,
        RequestCommand::List(args) => list(lifecycle, args).await,
        RequestCommand::Show { request_id } => show(lifecycle, *request_id).await,
        RequestCommand::Search { request_id } => {
            let indexer = build_indexer(settings)?;
            let outcome = lifecycle.run_search(*request_id, indexer.as_ref()).await?;
            println!("{}", describe_search(*request_id, &outcome));
            Ok(())
        }
    }
}

async fn add(lifecycle: &RequestLifecycle, args: &RequestAddArgs) -> Result<()> {
    let intake = RequestIntake {
        username: args.user.clone(),
        book: NewBook {
            source: args.source.clone(),
            source_id: args.source_id.clone().unwrap_or_else(|| args.title.clone()),
            title: args.title.clone(),
            author: args.author.clone(),
            cover_url: args.cover_url.clone(),
        },
        format: args.format,
        language: args.language.clone(),
    };
    let created = lifecycle.create_request(intake).await?;
    if let Some(warning) = &created.warning {
        println!("Warning: {warning}");
    }
    println!(
        "Created request {} for \"{}\" ({}).",
        created.request.id, args.title, created.request.format
    );
    Ok(())
}

async fn list(lifecycle: &RequestLifecycle, args: &RequestListArgs) -> Result<()> {
    let (label, requests) = if args.attention {
        ("needing attention", lifecycle.requests_needing_attention().await?)
    } else if args.awaiting_selection {
        ("awaiting selection", lifecycle.requests_awaiting_selection().await?)
    } else if args.retry_due {
        ("due for retry", lifecycle.requests_retry_due(Utc::now()).await?)
    } else {
        ("in total", lifecycle.store().list_all_requests().await?)
    };

    if requests.is_empty() {
        println!("No requests {label}.");
        return Ok(());
    }
    for request in &requests {
        println!("{}", render_request_row(request));
    }
    println!("{} request(s) {label}.", requests.len());
    Ok(())
}

async fn show(lifecycle: &RequestLifecycle, request_id: i64) -> Result<()> {
    let request = lifecycle.request(request_id).await?;
    println!("{}", render_request_row(&request));
    if let Some(issue) = &request.issue_description {
        println!("  issue: {issue}");
    }
    if let Some(at) = request.next_retry_at {
        println!("  next retry: {}", at.to_rfc3339());
    }

    let results = lifecycle.ranked_results(request_id).await?;
    if !results.is_empty() {
        println!("Results (best first):");
        for result in &results {
            let seeders = result
                .seeders
                .map_or_else(|| "-".to_string(), |s| s.to_string());
            let size = result
                .size_bytes
                .map_or_else(|| "-".to_string(), format_size);
            let kind = result.kind().map_or("none", |k| k.as_str());
            println!(
                "  [{:>5}] {:<8} {:<7} seeders={seeders:<5} size={size:<9} {}",
                result.id, result.status, kind, result.title
            );
        }
    }

    let downloads = lifecycle.downloads(request_id).await?;
    if !downloads.is_empty() {
        println!("Downloads (newest first):");
        for download in &downloads {
            let error = download
                .error_message
                .as_deref()
                .map(|e| format!(" error: {e}"))
                .unwrap_or_default();
            println!(
                "  [{:>5}] {:<11} {:>3}% {} {}{error}",
                download.id,
                download.status,
                download.progress,
                download.kind,
                download.external_id.as_deref().unwrap_or("(not dispatched)")
            );
        }
    }
    Ok(())
}

pub async fn run_select_command(
    lifecycle: &RequestLifecycle,
    request_id: i64,
    result_id: i64,
) -> Result<()> {
    let download = lifecycle.select_result(request_id, result_id).await?;
    println!(
        "Download {} dispatched ({}).",
        download.id,
        download.external_id.as_deref().unwrap_or("pending")
    );
    Ok(())
}

pub async fn run_retry_command(lifecycle: &RequestLifecycle, request_id: i64) -> Result<()> {
    match lifecycle.retry_now(request_id).await? {
        RetryNowOutcome::Redispatched(download) => {
            println!("Request {request_id}: download {} dispatched again.", download.id);
        }
        RetryNowOutcome::Restarted => {
            println!("Request {request_id} will be searched again.");
        }
    }
    Ok(())
}

pub async fn run_cancel_command(
    lifecycle: &RequestLifecycle,
    request_id: i64,
    purge: bool,
) -> Result<()> {
    let request = lifecycle.cancel(request_id).await?;
    println!("Request {request_id} is {}.", request.status);
    if purge {
        lifecycle.purge(request_id).await?;
        println!("Request {request_id} deleted.");
    }
    Ok(())
}

fn describe_search(request_id: i64, outcome: &SearchOutcome) -> String {
    match outcome {
        SearchOutcome::NotStarted => format!("Request {request_id} is not pending; nothing searched."),
        SearchOutcome::Requeued => {
            format!("Indexer unreachable; request {request_id} stays pending.")
        }
        SearchOutcome::NoResults(retry) => {
            format!("Nothing downloadable for request {request_id}: {retry:?}.")
        }
        SearchOutcome::AwaitingSelection { downloadable } => format!(
            "{downloadable} downloadable result(s); choose one with `bookfetch select {request_id} <result-id>`."
        ),
        SearchOutcome::Selected(download) => {
            format!("Best result selected; download {} created.", download.id)
        }
        SearchOutcome::Abandoned => {
            format!("Request {request_id} changed during the search; results discarded.")
        }
    }
}

fn render_request_row(request: &Request) -> String {
    let attention = if request.attention_needed { " !" } else { "" };
    format!(
        "#{:<5} {:<11} {:<9} retries={:<2} lang={}{attention}",
        request.id,
        request.status,
        request.format,
        request.retry_count,
        request.language.as_deref().unwrap_or("-"),
    )
}

#[allow(clippy::cast_precision_loss)]
fn format_size(bytes: i64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
