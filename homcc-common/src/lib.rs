//! Shared building blocks for the homcc client and server.
//!
//! This crate holds everything both binaries agree on: the framed wire
//! protocol, the per-message compression codecs, content hashing, the host
//! grammar, the configuration file loader, and the small compiler-argument
//! surface the core consumes.

#![forbid(unsafe_code)]

pub mod arguments;
pub mod compression;
pub mod config;
pub mod error;
pub mod hashing;
pub mod host;
pub mod logging;
pub mod protocol;

pub use arguments::CompilerArgs;
pub use compression::Compression;
pub use error::{ArgvError, CompressionError, ConfigError, HostParseError, ProtocolError};
pub use hashing::{digest_bytes, digest_file};
pub use host::{ConnectionKind, DEFAULT_PORT, Host};
pub use protocol::{
    ArgumentRequest, CompilationResult, ConnectionRefused, DependencyRequest, FileTransfer,
    Message, MessageKind, ObjectFile, read_message, write_message,
};
