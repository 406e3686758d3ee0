//! lodge-worker - per-account request server.
//!
//! Spawned by `lodge serve` as the account it serves, with an explicit
//! environment. Listens on a Unix socket inside the account's home and
//! answers one request per connection.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use tokio::signal::unix::{SignalKind, signal};

use lodge::config::WORKER_LOG_ENV;
use lodge::worker::{WorkerOptions, WorkerServer};

#[derive(Parser, Debug)]
#[command(name = "lodge-worker", version, about = "Per-account worker for lodge")]
struct Args {
    /// Socket path to listen on.
    #[arg(long)]
    socket: PathBuf,

    /// Home directory of the account; relative paths in requests start here.
    #[arg(long)]
    home: PathBuf,

    /// Kill terminals idle for this many seconds (0 keeps them forever).
    #[arg(long, default_value_t = 1800)]
    terminal_idle_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::new().filter_or(WORKER_LOG_ENV, "info")).init();

    std::env::set_current_dir(&args.home)
        .with_context(|| format!("changing directory to {}", args.home.display()))?;

    info!(
        "Starting lodge-worker (user={}, pid={}, socket={})",
        std::env::var("USER").unwrap_or_else(|_| "unknown".to_string()),
        std::process::id(),
        args.socket.display()
    );

    let server = WorkerServer::new(WorkerOptions {
        socket: args.socket,
        home: args.home,
        terminal_idle: Duration::from_secs(args.terminal_idle_secs),
    });

    let token = server.shutdown_token();
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        token.cancel();
    });

    if let Err(e) = server.run().await {
        warn!("Worker failed: {:#}", e);
        return Err(e);
    }
    Ok(())
}
