//! homcc - distributed C/C++ compilation client.
//!
//! Mirrors the compiler's surface: `homcc g++ -c x.cpp -o x.o` (or via
//! `CCACHE_PREFIX=homcc`). The invocation is scanned for its dependency
//! set, shipped to a compile host with a free slot, and the resulting
//! object file lands exactly where the compiler would have put it.

#![forbid(unsafe_code)]

use clap::Parser;
use homcc::deps::scan_dependencies;
use homcc::error::{ClientError, EXIT_CONFIG};
use homcc::selection::select_host;
use homcc::session::{SandboxRequest, compile_remote};
use homcc::slots::SlotPool;
use homcc_common::Compression;
use homcc_common::arguments::{CompilerArgs, DEFAULT_COMPILER};
use homcc_common::config::{ClientConfig, load_config};
use homcc_common::host::{Host, load_hosts};
use homcc_common::logging::init_logging;
use std::io::Write;
use std::time::Duration;
use tracing::{debug, info};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);

#[derive(Parser)]
#[command(name = "homcc")]
#[command(author, version, about = "homcc client for distributed C/C++ compilation")]
struct Cli {
    /// Compile host (HOST[:PORT][/LIMIT][,COMPRESSION]); overrides the hosts file
    #[arg(long)]
    host: Option<String>,

    /// Per-message timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Optional deadline for the whole job in seconds
    #[arg(long)]
    job_timeout: Option<u64>,

    /// Payload compression: lzo or lzma
    #[arg(long)]
    compression: Option<String>,

    /// schroot profile to compile under on the server
    #[arg(long)]
    profile: Option<String>,

    /// Docker container to compile in on the server
    #[arg(long)]
    docker_container: Option<String>,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,

    /// Compiler invocation, e.g. `g++ -c main.cpp -o main.o`
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    compiler_args: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load_config() {
        Ok(config) => config.client,
        Err(e) => {
            eprintln!("homcc: configuration error: {e}");
            std::process::exit(EXIT_CONFIG);
        }
    };

    init_logging(cli.verbose || config.verbose, config.log_level.as_deref());

    match run(cli, config).await {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(e) => {
            eprintln!("homcc: {e}");
            std::process::exit(e.exit_code());
        }
    }
}

async fn run(cli: Cli, config: ClientConfig) -> Result<i32, ClientError> {
    // `homcc gcc -c x.c` names the compiler; `homcc -c x.c` falls back to
    // the configured default.
    let args = if CompilerArgs::looks_like_compiler(&cli.compiler_args[0]) {
        CompilerArgs::from_argv(&cli.compiler_args)?
    } else {
        let compiler = config
            .compiler
            .clone()
            .unwrap_or_else(|| DEFAULT_COMPILER.to_string());
        CompilerArgs::new(compiler, cli.compiler_args.clone())
    };
    args.validate_remote()?;

    let compression = match cli.compression.as_deref() {
        Some(name) => Some(
            Compression::from_name(name)
                .ok_or_else(|| ClientError::Config(format!("unknown compression '{name}'")))?,
        ),
        None => config.compression,
    };

    let mut hosts = match &cli.host {
        Some(spec) => {
            vec![Host::parse(spec).map_err(|e| ClientError::Config(e.to_string()))?]
        }
        None => load_hosts()
            .map_err(|e| ClientError::Config(e.to_string()))?
            .ok_or(ClientError::NoHosts)?,
    };
    if let Some(compression) = compression {
        for host in &mut hosts {
            host.compression = compression;
        }
    }

    let timeout = cli
        .timeout
        .map(Duration::from_secs)
        .or(config.timeout)
        .unwrap_or(DEFAULT_TIMEOUT);

    let sandbox = SandboxRequest {
        profile: cli.profile.or(config.profile),
        docker_container: cli.docker_container.or(config.docker_container),
    };

    let cwd = std::env::current_dir()?;

    // Clean up reservations of crashed siblings before competing for slots.
    let pool = SlotPool::system();
    let swept = pool.janitor();
    if swept > 0 {
        debug!(swept, "janitor removed stale slot files");
    }

    let dependencies = scan_dependencies(&args, &cwd).await?;
    info!(
        dependencies = dependencies.len(),
        "dependency set hashed"
    );

    let (host, slot) = select_host(&hosts, &pool, timeout).await?;
    info!(host = %host, slot = slot.index, "compiling remotely");

    let session = compile_remote(&host, &args, &cwd, &dependencies, &sandbox, timeout);
    let outcome = match cli.job_timeout {
        Some(secs) => tokio::time::timeout(Duration::from_secs(secs), session)
            .await
            .unwrap_or(Err(ClientError::Timeout("job"))),
        None => session.await,
    };
    drop(slot);

    let outcome = outcome?;

    // Mirror the compiler's streams verbatim, then its exit code.
    if !outcome.stdout.is_empty() {
        print!("{}", outcome.stdout);
        let _ = std::io::stdout().flush();
    }
    if !outcome.stderr.is_empty() {
        eprint!("{}", outcome.stderr);
        let _ = std::io::stderr().flush();
    }
    Ok(outcome.exit_code)
}
