//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use bookfetch_core::{BookFormat, DownloadKind};

/// Default settings file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "bookfetch.toml";

/// Drive book acquisition requests from intake to delivery.
///
/// Bookfetch searches an indexer for each request, hands the best release to
/// a torrent or usenet client, watches it finish, and retries with backoff
/// when nothing usable turns up.
#[derive(Parser, Debug)]
#[command(name = "bookfetch")]
#[command(author, version, about)]
pub struct Cli {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Settings file (TOML); a missing file means defaults
    #[arg(long, default_value = DEFAULT_CONFIG_PATH, global = true)]
    pub config: PathBuf,

    /// Database file, overriding `[database].path`
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the search, dispatch, monitor, and retry workers until Ctrl-C
    Run,

    /// Create, inspect, and search requests
    Request {
        #[command(subcommand)]
        command: RequestCommand,
    },

    /// Select a search result and dispatch its download
    Select {
        request_id: i64,
        result_id: i64,
    },

    /// Retry a request now (redownload a failed selection or search again)
    Retry { request_id: i64 },

    /// Cancel a request and remove its active downloads
    Cancel {
        request_id: i64,

        /// Also delete the request when it never acquired anything
        #[arg(long)]
        purge: bool,
    },

    /// Set or clear the human-attention flag
    Attention {
        #[command(subcommand)]
        command: AttentionCommand,
    },

    /// Manage download clients
    Client {
        #[command(subcommand)]
        command: ClientCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum RequestCommand {
    /// Create a request (refused when it duplicates an existing one)
    Add(RequestAddArgs),

    /// List requests
    List(RequestListArgs),

    /// Show a request with its ranked results and downloads
    Show { request_id: i64 },

    /// Run one search pass for a pending request now
    Search { request_id: i64 },
}

#[derive(Args, Debug)]
pub struct RequestAddArgs {
    /// Book title
    #[arg(long)]
    pub title: String,

    /// Book author
    #[arg(long)]
    pub author: Option<String>,

    /// Metadata provider of the book identity
    #[arg(long, default_value = "manual")]
    pub source: String,

    /// Provider-scoped book identifier (defaults to the title)
    #[arg(long)]
    pub source_id: Option<String>,

    /// Cover image URL
    #[arg(long)]
    pub cover_url: Option<String>,

    /// ebook or audiobook
    #[arg(long, default_value = "ebook")]
    pub format: BookFormat,

    /// Language code (e.g. en)
    #[arg(long)]
    pub language: Option<String>,

    /// Requesting user
    #[arg(long, default_value = "admin")]
    pub user: String,
}

#[derive(Args, Debug)]
#[group(multiple = false)]
pub struct RequestListArgs {
    /// Only requests flagged for attention
    #[arg(long)]
    pub attention: bool,

    /// Only requests waiting for a manual result choice
    #[arg(long)]
    pub awaiting_selection: bool,

    /// Only requests whose retry time has passed
    #[arg(long)]
    pub retry_due: bool,
}

#[derive(Subcommand, Debug)]
pub enum AttentionCommand {
    /// Flag a request for attention
    Set {
        request_id: i64,
        description: String,
    },

    /// Clear a request's attention flag
    Clear { request_id: i64 },
}

#[derive(Subcommand, Debug)]
pub enum ClientCommand {
    /// Register a download client
    Add(ClientAddArgs),

    /// List download clients
    List,

    /// Test a client's connection and credentials
    Test { client_id: i64 },

    /// Enable a client
    Enable { client_id: i64 },

    /// Disable a client
    Disable { client_id: i64 },
}

#[derive(Args, Debug)]
pub struct ClientAddArgs {
    /// Unique client name
    #[arg(long)]
    pub name: String,

    /// torrent (qBittorrent) or usenet (SABnzbd)
    #[arg(long = "type")]
    pub client_type: DownloadKind,

    /// Base URL of the client's web API
    #[arg(long)]
    pub url: String,

    #[arg(long)]
    pub username: Option<String>,

    #[arg(long)]
    pub password: Option<String>,

    #[arg(long)]
    pub api_key: Option<String>,

    /// Category or label applied to added jobs
    #[arg(long)]
    pub category: Option<String>,

    /// Lower values are tried first
    #[arg(long, default_value_t = 0)]
    pub priority: i64,

    /// Register the client disabled
    #[arg(long)]
    pub disabled: bool,
}
