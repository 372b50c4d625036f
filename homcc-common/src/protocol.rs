//! Wire protocol and framed message codec.
//!
//! Every message travels as one frame: a fixed 16-byte header followed by a
//! payload that is compressed per the header's compression kind. Structured
//! bodies are JSON to stay language-neutral; `FileTransfer` uses a small
//! fixed binary subheader so large blobs are never double-encoded.
//!
//! Frame header layout (all integers big-endian):
//!
//! | Offset | Size | Field            |
//! |--------|------|------------------|
//! | 0      | 4    | magic `HOMC`     |
//! | 4      | 1    | version (= 1)    |
//! | 5      | 1    | message type     |
//! | 6      | 1    | compression kind |
//! | 7      | 1    | reserved (= 0)   |
//! | 8      | 8    | payload length   |
//!
//! The decoder reads the whole payload before decompressing; partial reads
//! block until the frame is complete or the connection closes.

use crate::compression::Compression;
use crate::error::{CompressionError, ProtocolError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Leading frame magic.
pub const FRAME_MAGIC: [u8; 4] = *b"HOMC";

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of the fixed frame header.
pub const FRAME_HEADER_LEN: usize = 16;

/// Default upper bound on a single payload: 2 GiB.
pub const DEFAULT_PAYLOAD_CAP: u64 = 2 * 1024 * 1024 * 1024;

// =========================================================================
// Message types
// =========================================================================

/// Wire tag of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    ArgumentRequest,
    DependencyRequest,
    FileTransfer,
    FilesSent,
    CompilationResult,
    ConnectionRefused,
}

impl MessageKind {
    pub fn as_byte(self) -> u8 {
        match self {
            MessageKind::ArgumentRequest => 1,
            MessageKind::DependencyRequest => 2,
            MessageKind::FileTransfer => 3,
            MessageKind::FilesSent => 4,
            MessageKind::CompilationResult => 5,
            MessageKind::ConnectionRefused => 6,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(MessageKind::ArgumentRequest),
            2 => Some(MessageKind::DependencyRequest),
            3 => Some(MessageKind::FileTransfer),
            4 => Some(MessageKind::FilesSent),
            5 => Some(MessageKind::CompilationResult),
            6 => Some(MessageKind::ConnectionRefused),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageKind::ArgumentRequest => "ArgumentRequest",
            MessageKind::DependencyRequest => "DependencyRequest",
            MessageKind::FileTransfer => "FileTransfer",
            MessageKind::FilesSent => "FilesSent",
            MessageKind::CompilationResult => "CompilationResult",
            MessageKind::ConnectionRefused => "ConnectionRefused",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// =========================================================================
// Message bodies
// =========================================================================

/// Initial message of a session: the compiler invocation plus the digests of
/// every dependency the translation unit reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgumentRequest {
    /// Full argv including the compiler as the first element.
    pub args: Vec<String>,
    /// Client working directory (absolute).
    pub cwd: String,
    /// schroot profile to compile under, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_profile: Option<String>,
    /// Docker container to compile in, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_container: Option<String>,
    /// Client path of each dependency mapped to its content digest.
    pub dependency_hashes: BTreeMap<String, String>,
}

/// Server reply listing the digests it does not have cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyRequest {
    pub needed: Vec<String>,
}

/// One dependency file streamed to the server.
///
/// Not JSON: the body is `{ path_len: u32, digest_len: u32, content_len:
/// u64 }` big-endian, followed by the three byte strings.
#[derive(Debug, Clone, PartialEq)]
pub struct FileTransfer {
    pub path: String,
    pub digest: String,
    pub content: Vec<u8>,
}

/// One produced object file inside a [`CompilationResult`].
///
/// `path` is the path valid on the *client*; content is hex-encoded in the
/// JSON body so the message stays self-describing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectFile {
    pub path: String,
    #[serde(with = "hex_bytes")]
    pub content: Vec<u8>,
}

/// Final message of a session: compiler outcome plus produced artifacts.
///
/// The exit code travels unsigned; clients sign-extend to recover negative
/// platform codes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompilationResult {
    pub exit_code: u32,
    pub stdout: String,
    pub stderr: String,
    pub object_files: Vec<ObjectFile>,
}

/// Sent instead of a dependency listing when the server is saturated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRefused {
    pub reason: String,
}

/// Tagged union over everything that can travel on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    ArgumentRequest(ArgumentRequest),
    DependencyRequest(DependencyRequest),
    FileTransfer(FileTransfer),
    /// Marker closing a run of `FileTransfer` messages. Empty body.
    FilesSent,
    CompilationResult(CompilationResult),
    ConnectionRefused(ConnectionRefused),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::ArgumentRequest(_) => MessageKind::ArgumentRequest,
            Message::DependencyRequest(_) => MessageKind::DependencyRequest,
            Message::FileTransfer(_) => MessageKind::FileTransfer,
            Message::FilesSent => MessageKind::FilesSent,
            Message::CompilationResult(_) => MessageKind::CompilationResult,
            Message::ConnectionRefused(_) => MessageKind::ConnectionRefused,
        }
    }

    fn encode_body(&self) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Message::ArgumentRequest(m) => encode_json(self.kind(), m),
            Message::DependencyRequest(m) => encode_json(self.kind(), m),
            Message::CompilationResult(m) => encode_json(self.kind(), m),
            Message::ConnectionRefused(m) => encode_json(self.kind(), m),
            Message::FilesSent => Ok(Vec::new()),
            Message::FileTransfer(t) => {
                let mut out =
                    Vec::with_capacity(16 + t.path.len() + t.digest.len() + t.content.len());
                out.extend_from_slice(&(t.path.len() as u32).to_be_bytes());
                out.extend_from_slice(&(t.digest.len() as u32).to_be_bytes());
                out.extend_from_slice(&(t.content.len() as u64).to_be_bytes());
                out.extend_from_slice(t.path.as_bytes());
                out.extend_from_slice(t.digest.as_bytes());
                out.extend_from_slice(&t.content);
                Ok(out)
            }
        }
    }

    fn decode_body(kind: MessageKind, body: &[u8]) -> Result<Message, ProtocolError> {
        match kind {
            MessageKind::ArgumentRequest => Ok(Message::ArgumentRequest(decode_json(kind, body)?)),
            MessageKind::DependencyRequest => {
                Ok(Message::DependencyRequest(decode_json(kind, body)?))
            }
            MessageKind::CompilationResult => {
                Ok(Message::CompilationResult(decode_json(kind, body)?))
            }
            MessageKind::ConnectionRefused => {
                Ok(Message::ConnectionRefused(decode_json(kind, body)?))
            }
            MessageKind::FilesSent => Ok(Message::FilesSent),
            MessageKind::FileTransfer => decode_file_transfer(body),
        }
    }
}

fn encode_json<T: Serialize>(kind: MessageKind, body: &T) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(body).map_err(|e| ProtocolError::Malformed {
        kind: kind.name(),
        detail: e.to_string(),
    })
}

fn decode_json<'de, T: Deserialize<'de>>(
    kind: MessageKind,
    body: &'de [u8],
) -> Result<T, ProtocolError> {
    serde_json::from_slice(body).map_err(|e| ProtocolError::Malformed {
        kind: kind.name(),
        detail: e.to_string(),
    })
}

fn decode_file_transfer(body: &[u8]) -> Result<Message, ProtocolError> {
    let malformed = |detail: &str| ProtocolError::Malformed {
        kind: MessageKind::FileTransfer.name(),
        detail: detail.to_string(),
    };

    if body.len() < 16 {
        return Err(malformed("body shorter than its subheader"));
    }
    let path_len = u32::from_be_bytes(body[0..4].try_into().unwrap()) as usize;
    let digest_len = u32::from_be_bytes(body[4..8].try_into().unwrap()) as usize;
    let content_len = u64::from_be_bytes(body[8..16].try_into().unwrap()) as usize;

    let expected = 16usize
        .checked_add(path_len)
        .and_then(|n| n.checked_add(digest_len))
        .and_then(|n| n.checked_add(content_len))
        .ok_or_else(|| malformed("subheader lengths overflow"))?;
    if body.len() != expected {
        return Err(malformed("subheader lengths disagree with body size"));
    }

    let path = std::str::from_utf8(&body[16..16 + path_len])
        .map_err(|_| malformed("path is not valid UTF-8"))?
        .to_string();
    let digest_start = 16 + path_len;
    let digest = std::str::from_utf8(&body[digest_start..digest_start + digest_len])
        .map_err(|_| malformed("digest is not valid UTF-8"))?
        .to_string();
    let content = body[digest_start + digest_len..].to_vec();

    Ok(Message::FileTransfer(FileTransfer {
        path,
        digest,
        content,
    }))
}

/// Hex transport for binary content embedded in JSON bodies.
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        hex::decode(&text).map_err(serde::de::Error::custom)
    }
}

// =========================================================================
// Framing
// =========================================================================

/// Encode and send one message, compressing its payload with `compression`.
pub async fn write_message<W>(
    writer: &mut W,
    message: &Message,
    compression: Compression,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let body = message.encode_body()?;
    let payload = compression.compress(&body)?;

    let mut header = [0u8; FRAME_HEADER_LEN];
    header[0..4].copy_from_slice(&FRAME_MAGIC);
    header[4] = PROTOCOL_VERSION;
    header[5] = message.kind().as_byte();
    header[6] = compression.kind_byte();
    header[8..16].copy_from_slice(&(payload.len() as u64).to_be_bytes());

    writer.write_all(&header).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Receive one message, honoring the default 2 GiB payload cap.
///
/// Returns the message together with the compression the peer framed it
/// with, so replies can mirror the peer's choice.
pub async fn read_message<R>(reader: &mut R) -> Result<(Message, Compression), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    read_message_with_cap(reader, DEFAULT_PAYLOAD_CAP).await
}

/// Receive one message with an explicit payload cap.
pub async fn read_message_with_cap<R>(
    reader: &mut R,
    cap: u64,
) -> Result<(Message, Compression), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    read_exact_or_closed(reader, &mut header).await?;

    let magic: [u8; 4] = header[0..4].try_into().unwrap();
    let version = header[4];
    if magic != FRAME_MAGIC || version != PROTOCOL_VERSION {
        return Err(ProtocolError::Version { magic, version });
    }

    let kind = MessageKind::from_byte(header[5]).ok_or_else(|| ProtocolError::Malformed {
        kind: "frame",
        detail: format!("unknown message type {}", header[5]),
    })?;
    let compression =
        Compression::from_kind_byte(header[6]).ok_or_else(|| ProtocolError::Malformed {
            kind: "frame",
            detail: format!("unknown compression kind {}", header[6]),
        })?;

    let payload_len = u64::from_be_bytes(header[8..16].try_into().unwrap());
    if payload_len > cap {
        return Err(ProtocolError::Overflow {
            got: payload_len,
            cap,
        });
    }

    let mut payload = vec![0u8; payload_len as usize];
    read_exact_or_closed(reader, &mut payload).await?;

    let body = match compression.decompress(&payload, cap) {
        Ok(body) => body,
        Err(CompressionError::TooLarge { size, cap }) => {
            return Err(ProtocolError::Overflow { got: size, cap });
        }
        Err(e) => return Err(e.into()),
    };

    Ok((Message::decode_body(kind, &body)?, compression))
}

async fn read_exact_or_closed<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    reader.read_exact(buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::PeerClosed
        } else {
            ProtocolError::Io(e)
        }
    })?;
    Ok(())
}

// =========================================================================
// Tests
// =========================================================================
