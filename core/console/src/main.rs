//! callwatch: operator console for live AI-handled calls.
//!
//! ## Subcommands
//!
//! - `watch`: live session; renders calls, escalations and availability and
//!   reads operator commands from stdin
//! - `status`: print the authoritative operator availability
//! - `set-status`: change availability with one round trip
//! - `config`: print the effective configuration

mod api;
mod commands;
mod logging;
mod render;
mod runtime;
mod socket;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use callwatch_core::{is_token_shaped, load_config, AvailabilityTracker, MonitorConfig};
use callwatch_protocol::OperatorStatus;

use crate::api::ApiClient;

const TOKEN_ENV: &str = "CALLWATCH_TOKEN";

#[derive(Parser)]
#[command(name = "callwatch")]
#[command(about = "Operator console for live call monitoring")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ~/.callwatch/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Bearer token (falls back to CALLWATCH_TOKEN)
    #[arg(long, global = true, value_name = "TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow active calls and answer escalations
    Watch,

    /// Print the current operator availability
    Status,

    /// Change operator availability
    SetStatus {
        /// available, away, busy or offline
        #[arg(value_name = "STATUS", value_parser = str::parse::<OperatorStatus>)]
        status: OperatorStatus,

        /// Away message (keeps the stored one when omitted)
        #[arg(long)]
        message: Option<String>,
    },

    /// Print the effective configuration
    Config,
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        tracing::error!(error = %format!("{:#}", e), "callwatch failed");
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = effective_config(cli.config)?;

    match cli.command {
        Commands::Config => {
            let rendered =
                toml::to_string_pretty(&config).context("failed to render configuration")?;
            print!("{}", rendered);
            Ok(())
        }
        Commands::Watch => {
            let token = resolve_token(cli.token)?;
            build_runtime()?.block_on(runtime::watch(config, token))
        }
        Commands::Status => {
            let token = resolve_token(cli.token)?;
            let api = ApiClient::new(&config, &token)?;
            let response = build_runtime()?.block_on(api.fetch_status())?;
            let mut tracker = AvailabilityTracker::new();
            let round_trip = tracker.begin_fetch();
            tracker.confirm_fetch(round_trip, response);
            println!("{}", render::render_availability(tracker.state()));
            Ok(())
        }
        Commands::SetStatus { status, message } => {
            let token = resolve_token(cli.token)?;
            let api = ApiClient::new(&config, &token)?;
            let rt = build_runtime()?;

            // The stored away message is carried forward when none is given.
            let mut tracker = AvailabilityTracker::new();
            let round_trip = tracker.begin_fetch();
            tracker.confirm_fetch(round_trip, rt.block_on(api.fetch_status())?);
            let update = tracker.request_change(status, message)?;
            match rt.block_on(api.update_status(&update)) {
                Ok(response) => tracker.confirm_update(response),
                Err(e) => return Err(tracker.reject(format!("{:#}", e)).into()),
            }
            println!("{}", render::render_availability(tracker.state()));
            Ok(())
        }
    }
}

fn effective_config(path: Option<PathBuf>) -> Result<MonitorConfig> {
    let mut config = load_config(path)?;
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

fn resolve_token(flag: Option<String>) -> Result<String> {
    let token = flag
        .or_else(|| std::env::var(TOKEN_ENV).ok())
        .map(|token| token.trim().to_string())
        .unwrap_or_default();
    if token.is_empty() {
        bail!("no token given; pass --token or set {}", TOKEN_ENV);
    }
    if !is_token_shaped(&token) {
        bail!("token is not a three-segment bearer token");
    }
    Ok(token)
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}
