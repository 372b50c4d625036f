//! Error types shared between the homcc client and server.
//!
//! Each protocol layer gets its own `thiserror` enum; the binaries compose
//! them with `#[from]` conversions and decide how each kind maps to an exit
//! code or a wire-level reaction (close the connection, send an error
//! result, fall back locally).

use thiserror::Error;

/// Errors raised while encoding or decoding framed protocol messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Declared payload length exceeds the configured frame cap.
    #[error("payload of {got} bytes exceeds the frame cap of {cap} bytes")]
    Overflow { got: u64, cap: u64 },

    /// Frame did not start with the expected magic, or the peer speaks a
    /// different protocol version.
    #[error("bad frame header: magic {magic:02x?}, version {version}")]
    Version { magic: [u8; 4], version: u8 },

    /// A frame arrived but its body could not be decoded.
    #[error("malformed {kind} body: {detail}")]
    Malformed { kind: &'static str, detail: String },

    /// The connection ended in the middle of a frame.
    #[error("peer closed the connection mid-message")]
    PeerClosed,

    /// A structurally valid message arrived in a state that does not accept
    /// its type.
    #[error("unexpected {got} while waiting for {expected}")]
    UnexpectedMessage { expected: &'static str, got: &'static str },

    #[error("compression: {0}")]
    Compression(#[from] CompressionError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from the per-message compression codecs.
#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("lzo codec failed: {0}")]
    Lzo(String),

    #[error("lzma codec failed: {0}")]
    Lzma(String),

    /// Compressed payload is too short to carry its own framing.
    #[error("compressed payload truncated")]
    Truncated,

    /// Decompressed size would exceed the frame cap.
    #[error("decompressed size {size} exceeds cap of {cap} bytes")]
    TooLarge { size: u64, cap: u64 },
}

/// Errors from parsing a host specification or hosts file.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HostParseError {
    #[error("empty host specification")]
    Empty,

    #[error("invalid port in host '{0}'")]
    InvalidPort(String),

    #[error("invalid slot limit in host '{0}'")]
    InvalidLimit(String),

    #[error("unknown compression '{name}' in host '{host}'")]
    UnknownCompression { host: String, name: String },

    #[error("unbracketed IPv6 address in host '{0}'")]
    UnbracketedIpv6(String),

    #[error("host '{0}' could not be parsed")]
    Invalid(String),
}

/// Errors from loading or parsing the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("line {line}: expected 'key=value', got '{text}'")]
    Syntax { line: usize, text: String },

    #[error("line {line}: invalid value for '{key}': {detail}")]
    InvalidValue { line: usize, key: String, detail: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Reasons a compiler invocation cannot be executed remotely.
///
/// These map to the `UnsupportedArgv` kind: the client refuses to ship such
/// an invocation, and the server refuses to rewrite it.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArgvError {
    #[error("no compiler argument given")]
    MissingCompiler,

    #[error("cannot compile from stdin")]
    StdinInput,

    #[error("invocation requests linking; only -c compilations are supported")]
    Linking,

    #[error("no source files in argv")]
    NoSources,

    #[error("flag '{0}' is missing its value")]
    MissingValue(String),
}
