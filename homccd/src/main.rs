//! homccd - the homcc compile server.
//!
//! Accepts framed compile requests over TCP, keeps a content-addressed
//! dependency cache, and runs compilers directly, in schroot environments,
//! or in docker containers.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use homcc_common::config::{ServerConfig, load_config};
use homcc_common::host::DEFAULT_PORT;
use homcc_common::logging::init_logging;
use homccd::cache::{Cache, DEFAULT_CACHE_BUDGET, DEFAULT_CACHE_DIR};
use homccd::server::{self, Daemon};
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser)]
#[command(name = "homccd")]
#[command(author, version, about = "homcc server for distributed C/C++ compilation")]
struct Cli {
    /// Maximum number of concurrent compilation jobs
    #[arg(long)]
    limit: Option<usize>,

    /// TCP port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Address to listen on
    #[arg(long)]
    address: Option<String>,

    /// Dependency cache directory
    #[arg(long, default_value = DEFAULT_CACHE_DIR)]
    cache_dir: PathBuf,

    /// Dependency cache size budget in MiB
    #[arg(long)]
    cache_size_mib: Option<u64>,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config: ServerConfig = match load_config() {
        Ok(config) => config.server,
        Err(e) => {
            eprintln!("homccd: configuration error: {e}");
            std::process::exit(1);
        }
    };

    init_logging(cli.verbose || config.verbose, config.log_level.as_deref());

    let address = cli
        .address
        .or(config.address)
        .unwrap_or_else(|| server::DEFAULT_ADDRESS.to_string());
    let port = cli.port.or(config.port).unwrap_or(DEFAULT_PORT);
    let limit = cli
        .limit
        .or(config.limit)
        .unwrap_or_else(server::default_limit);
    let budget = cli
        .cache_size_mib
        .map(|mib| mib * 1024 * 1024)
        .unwrap_or(DEFAULT_CACHE_BUDGET);

    let cache = Cache::open(&cli.cache_dir, budget)
        .with_context(|| format!("opening cache at {}", cli.cache_dir.display()))?;
    let daemon = Daemon::new(cache, limit, "/tmp");

    let listener = TcpListener::bind((address.as_str(), port))
        .await
        .with_context(|| format!("binding {address}:{port}"))?;

    tokio::select! {
        result = server::serve(listener, daemon) => result.context("accept loop failed")?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted; shutting down");
        }
    }

    Ok(())
}
