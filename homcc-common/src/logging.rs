//! Logging initialization shared by both binaries.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the global tracing subscriber.
///
/// Precedence: `--verbose` forces debug, then an explicit `log_level` from
/// the configuration, then `RUST_LOG`, then `info`.
pub fn init_logging(verbose: bool, log_level: Option<&str>) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else if let Some(level) = log_level {
        EnvFilter::new(level)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}
