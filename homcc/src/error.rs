//! Client error kinds and their exit codes.
//!
//! The client's exit code is the compiler's whenever a `CompilationResult`
//! made it back; every failure before that point maps to a defined nonzero
//! code so build drivers can tell a broken compile from a broken farm. Any
//! code at or above [`EXIT_NO_HOSTS`] marks a failure where a local
//! fallback would have been possible.

use homcc_common::error::{ArgvError, ProtocolError};
use thiserror::Error;

/// Configuration problems (bad config file, bad flag values).
pub const EXIT_CONFIG: i32 = 1;
/// The invocation cannot be compiled remotely at all.
pub const EXIT_UNSUPPORTED: i32 = 64;
/// No hosts configured anywhere.
pub const EXIT_NO_HOSTS: i32 = 65;
/// No host slot became free before the deadline.
pub const EXIT_NO_SLOT: i32 = 66;
/// TCP connection could not be established.
pub const EXIT_CONNECT: i32 = 67;
/// Server refused the connection (saturated).
pub const EXIT_REFUSED: i32 = 68;
/// Protocol violation or connection lost mid-session.
pub const EXIT_PROTOCOL: i32 = 69;
/// A per-message or whole-job deadline expired.
pub const EXIT_TIMEOUT: i32 = 70;
/// The local dependency scan failed.
pub const EXIT_DEP_SCAN: i32 = 71;
/// Local I/O failure (reading sources, writing objects).
pub const EXIT_IO: i32 = 74;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("configuration: {0}")]
    Config(String),

    #[error("unsupported compiler invocation: {0}")]
    Argv(#[from] ArgvError),

    #[error("no compile hosts configured (hosts file or $HOMCC_HOSTS)")]
    NoHosts,

    #[error("no slot on any host became available in time")]
    NoSlot,

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    #[error("server refused the job: {0}")]
    Refused(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("dependency scan failed:\n{0}")]
    DependencyScan(String),

    #[error("server requested digest {0} that was never offered")]
    UnknownDigest(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Exit code surfaced to the build driver for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            ClientError::Config(_) => EXIT_CONFIG,
            ClientError::Argv(_) => EXIT_UNSUPPORTED,
            ClientError::NoHosts => EXIT_NO_HOSTS,
            ClientError::NoSlot => EXIT_NO_SLOT,
            ClientError::Connect { .. } => EXIT_CONNECT,
            ClientError::Refused(_) => EXIT_REFUSED,
            ClientError::Protocol(_) | ClientError::UnknownDigest(_) => EXIT_PROTOCOL,
            ClientError::Timeout(_) => EXIT_TIMEOUT,
            ClientError::DependencyScan(_) => EXIT_DEP_SCAN,
            ClientError::Io(_) => EXIT_IO,
        }
    }
}
