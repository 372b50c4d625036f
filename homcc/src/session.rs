//! Client session: one connection, one translation unit.
//!
//! Drives the protocol state machine over a single TCP connection:
//!
//! ```text
//! Init ──ArgumentRequest──▶ AwaitDepList ──DependencyRequest──▶ SendingFiles
//!                               │    │                               │
//!                               │    └──CompilationResult──▶ Complete│
//!                               └──ConnectionRefused──▶ Failed       │
//!                                   AwaitResult ◀──FilesSent─────────┘
//! ```
//!
//! Each transition consumes exactly one message; every read and write sits
//! behind the per-message timeout. On `Complete` the returned object files
//! are written to their client paths and the compiler's streams and exit
//! code are surfaced unchanged.

use crate::error::ClientError;
use homcc_common::Compression;
use homcc_common::arguments::CompilerArgs;
use homcc_common::host::Host;
use homcc_common::protocol::{
    ArgumentRequest, CompilationResult, FileTransfer, Message, read_message, write_message,
};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Result of a completed remote compilation, already written to disk.
#[derive(Debug)]
pub struct RemoteOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Client paths of the object files written.
    pub object_files: Vec<PathBuf>,
}

/// Sandbox selection forwarded to the server.
#[derive(Debug, Clone, Default)]
pub struct SandboxRequest {
    pub profile: Option<String>,
    pub docker_container: Option<String>,
}

/// Compile one translation unit on `host`.
pub async fn compile_remote(
    host: &Host,
    args: &CompilerArgs,
    cwd: &Path,
    dependencies: &BTreeMap<String, String>,
    sandbox: &SandboxRequest,
    timeout: Duration,
) -> Result<RemoteOutcome, ClientError> {
    let addr = host.addr();
    let mut stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| ClientError::Timeout("connect"))?
        .map_err(|source| ClientError::Connect {
            addr: addr.clone(),
            source,
        })?;
    debug!(%addr, "connected");

    let request = ArgumentRequest {
        args: args.to_argv(),
        cwd: cwd.to_string_lossy().into_owned(),
        target_profile: sandbox.profile.clone(),
        docker_container: sandbox.docker_container.clone(),
        dependency_hashes: dependencies.clone(),
    };

    // Init -> AwaitDepList
    send(
        &mut stream,
        Message::ArgumentRequest(request),
        host.compression,
        timeout,
    )
    .await?;

    // AwaitDepList
    let result = match recv(&mut stream, timeout, "dependency listing").await? {
        Message::CompilationResult(result) => result,
        Message::ConnectionRefused(refused) => {
            info!(%addr, reason = refused.reason.as_str(), "server refused");
            return Err(ClientError::Refused(refused.reason));
        }
        Message::DependencyRequest(needed) => {
            // SendingFiles
            send_missing_files(&mut stream, host, dependencies, &needed.needed, timeout).await?;

            // AwaitResult
            match recv(&mut stream, timeout, "compilation result").await? {
                Message::CompilationResult(result) => result,
                other => return Err(unexpected("CompilationResult", &other)),
            }
        }
        other => return Err(unexpected("DependencyRequest", &other)),
    };

    // Complete
    finish(result, cwd)
}

async fn send_missing_files(
    stream: &mut TcpStream,
    host: &Host,
    dependencies: &BTreeMap<String, String>,
    needed: &[String],
    timeout: Duration,
) -> Result<(), ClientError> {
    let by_digest: HashMap<&str, &str> = dependencies
        .iter()
        .map(|(path, digest)| (digest.as_str(), path.as_str()))
        .collect();

    info!(count = needed.len(), "uploading missing dependencies");
    for digest in needed {
        let path = *by_digest
            .get(digest.as_str())
            .ok_or_else(|| ClientError::UnknownDigest(digest.clone()))?;
        let content = tokio::fs::read(path).await?;
        debug!(path, bytes = content.len(), "sending dependency");
        send(
            stream,
            Message::FileTransfer(FileTransfer {
                path: path.to_string(),
                digest: digest.clone(),
                content,
            }),
            host.compression,
            timeout,
        )
        .await?;
    }
    send(stream, Message::FilesSent, host.compression, timeout).await
}

/// Write artifacts and surface the compiler outcome. The wire exit code is
/// unsigned; sign-extend so signal deaths come back negative as they would
/// locally.
fn finish(result: CompilationResult, cwd: &Path) -> Result<RemoteOutcome, ClientError> {
    let mut written = Vec::new();
    for object in &result.object_files {
        let path = if Path::new(&object.path).is_absolute() {
            PathBuf::from(&object.path)
        } else {
            cwd.join(&object.path)
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, &object.content)?;
        debug!(path = %path.display(), bytes = object.content.len(), "object file written");
        written.push(path);
    }

    Ok(RemoteOutcome {
        exit_code: result.exit_code as i32,
        stdout: result.stdout,
        stderr: result.stderr,
        object_files: written,
    })
}

async fn send(
    stream: &mut TcpStream,
    message: Message,
    compression: Compression,
    timeout: Duration,
) -> Result<(), ClientError> {
    tokio::time::timeout(timeout, write_message(stream, &message, compression))
        .await
        .map_err(|_| ClientError::Timeout("send"))?
        .map_err(ClientError::from)
}

async fn recv(
    stream: &mut TcpStream,
    timeout: Duration,
    waiting_for: &'static str,
) -> Result<Message, ClientError> {
    let (message, _) = tokio::time::timeout(timeout, read_message(stream))
        .await
        .map_err(|_| ClientError::Timeout(waiting_for))?
        .map_err(ClientError::from)?;
    Ok(message)
}

fn unexpected(expected: &'static str, got: &Message) -> ClientError {
    ClientError::Protocol(homcc_common::error::ProtocolError::UnexpectedMessage {
        expected,
        got: got.kind().name(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use homcc_common::protocol::ObjectFile;

    #[test]
    fn finish_writes_objects_and_sign_extends() {
        let dir = tempfile::tempdir().unwrap();
        let result = CompilationResult {
            exit_code: u32::MAX, // -1 on the wire
            stdout: "out".into(),
            stderr: "err".into(),
            object_files: vec![ObjectFile {
                path: "sub/x.o".into(),
                content: vec![1, 2, 3],
            }],
        };
        let outcome = finish(result, dir.path()).unwrap();
        assert_eq!(outcome.exit_code, -1);
        assert_eq!(outcome.stdout, "out");
        assert_eq!(outcome.stderr, "err");
        assert_eq!(outcome.object_files, [dir.path().join("sub/x.o")]);
        assert_eq!(std::fs::read(dir.path().join("sub/x.o")).unwrap(), [1, 2, 3]);
    }

    #[test]
    fn finish_honors_absolute_object_paths() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("abs.o");
        let result = CompilationResult {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            object_files: vec![ObjectFile {
                path: target.to_string_lossy().into_owned(),
                content: b"obj".to_vec(),
            }],
        };
        let outcome = finish(result, Path::new("/elsewhere")).unwrap();
        assert_eq!(outcome.object_files, [target.clone()]);
        assert_eq!(std::fs::read(target).unwrap(), b"obj");
    }
}
