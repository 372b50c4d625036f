//! Per-connection job lifecycle.
//!
//! One accepted connection is one compilation: read the argument request,
//! negotiate the dependency gap against the cache, materialize a private
//! working tree by linking cache blobs, run the sandboxed compiler, ship
//! the artifacts back, tear everything down.
//!
//! Every in-job failure is folded into a `CompilationResult` with a
//! non-zero exit code so the client fails cleanly instead of hanging; the
//! exceptions are integrity violations, which close the connection without
//! a result, and protocol errors, where the peer is already gone or
//! talking garbage.

use crate::cache::CacheError;
use crate::rewrite::{self, RewrittenJob};
use crate::sandbox::{Sandbox, SandboxUnavailable};
use crate::server::Daemon;
use homcc_common::arguments::CompilerArgs;
use homcc_common::error::{ArgvError, ProtocolError};
use homcc_common::hashing::digest_bytes;
use homcc_common::protocol::{
    ArgumentRequest, CompilationResult, DependencyRequest, Message, ObjectFile, read_message,
    write_message,
};
use homcc_common::Compression;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Prefix of per-job scratch directories. Kept directly on /tmp so the
/// tree can be bind-mounted into containers and referenced inside chroots.
pub const JOB_DIR_PREFIX: &str = "homcc-";

#[derive(Debug, Error)]
pub enum JobError {
    /// Transferred content does not hash to its declared digest.
    #[error("integrity violation for '{path}': declared {declared}, got {actual}")]
    Integrity {
        path: String,
        declared: String,
        actual: String,
    },

    #[error("sandbox unavailable: {0}")]
    Sandbox(#[from] SandboxUnavailable),

    #[error("compiler '{0}' is not available on the server")]
    CompilerMissing(String),

    #[error("unsupported argv: {0}")]
    Argv(#[from] ArgvError),

    #[error("file transfer for digest {0} that was never requested")]
    UnexpectedTransfer(String),

    #[error("client finished sending but {0} dependencies are still missing")]
    MissingDependencies(usize),

    #[error("compiler reported success but produced no '{0}'")]
    MissingArtifact(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Entry point for one accepted connection.
pub async fn handle_connection(mut stream: TcpStream, daemon: Arc<Daemon>) {
    let (message, compression) = match read_message(&mut stream).await {
        Ok(received) => received,
        Err(e) => {
            warn!(error = %e, "could not read initial message; dropping connection");
            return;
        }
    };
    let Message::ArgumentRequest(request) = message else {
        warn!(kind = %message.kind(), "connection opened with unexpected message; dropping");
        return;
    };

    let mut job = Job::new(&daemon, request, compression);
    debug!(job = %job.id, argv = ?job.request.args, "job accepted");

    match job.run(&mut stream).await {
        Ok(result) => {
            debug!(job = %job.id, exit_code = result.exit_code, "job finished");
            if let Err(e) =
                write_message(&mut stream, &Message::CompilationResult(result), compression).await
            {
                warn!(job = %job.id, error = %e, "failed to deliver result");
            }
        }
        Err(e @ JobError::Integrity { .. }) => {
            // Tampered transfer: no result, just close.
            warn!(job = %job.id, error = %e, "closing connection");
        }
        Err(e) => {
            info!(job = %job.id, error = %e, "job failed; reporting to client");
            let result = CompilationResult {
                exit_code: 1,
                stdout: String::new(),
                stderr: format!("homccd: {e}"),
                object_files: Vec::new(),
            };
            let _ =
                write_message(&mut stream, &Message::CompilationResult(result), compression).await;
        }
    }

    job.teardown();
}

/// One in-flight compilation.
struct Job<'a> {
    daemon: &'a Daemon,
    id: Uuid,
    root: PathBuf,
    request: ArgumentRequest,
    compression: Compression,
    pinned: Vec<String>,
}

impl<'a> Job<'a> {
    fn new(daemon: &'a Daemon, request: ArgumentRequest, compression: Compression) -> Self {
        let id = Uuid::new_v4();
        let root = daemon.scratch_root.join(format!("{JOB_DIR_PREFIX}{id}"));
        Self {
            daemon,
            id,
            root,
            request,
            compression,
            pinned: Vec::new(),
        }
    }

    async fn run(&mut self, stream: &mut TcpStream) -> Result<CompilationResult, JobError> {
        let args = CompilerArgs::from_argv(&self.request.args)?;

        let sandbox = Sandbox::from_request(
            self.request.target_profile.as_deref(),
            self.request.docker_container.as_deref(),
        )?;
        sandbox.ensure_available().await?;
        if sandbox == Sandbox::None && which::which(args.compiler()).is_err() {
            return Err(JobError::CompilerMissing(args.compiler().to_string()));
        }

        let rewritten = rewrite::rewrite(&args, &self.root, &self.request.cwd)?;

        self.negotiate_dependencies(stream).await?;
        self.materialize()?;

        let result = self.compile(&sandbox, &rewritten).await?;
        Ok(result)
    }

    /// Ask the client for exactly the digests the cache lacks, then ingest
    /// the transfers. A warm cache skips the exchange entirely.
    async fn negotiate_dependencies(&mut self, stream: &mut TcpStream) -> Result<(), JobError> {
        let needed: BTreeSet<String> = self
            .request
            .dependency_hashes
            .values()
            .filter(|digest| !self.daemon.cache.contains(digest))
            .cloned()
            .collect();

        info!(
            job = %self.id,
            cached = self.request.dependency_hashes.len() - needed.len(),
            missing = needed.len(),
            "dependency negotiation"
        );

        if needed.is_empty() {
            return Ok(());
        }

        let request = DependencyRequest {
            needed: needed.iter().cloned().collect(),
        };
        write_message(stream, &Message::DependencyRequest(request), self.compression).await?;

        let mut outstanding = needed;
        loop {
            let (message, _) = read_message(stream).await?;
            match message {
                Message::FileTransfer(transfer) => {
                    if !outstanding.contains(&transfer.digest) {
                        return Err(JobError::UnexpectedTransfer(transfer.digest));
                    }
                    let actual = digest_bytes(&transfer.content);
                    if actual != transfer.digest {
                        return Err(JobError::Integrity {
                            path: transfer.path,
                            declared: transfer.digest,
                            actual,
                        });
                    }
                    self.daemon.cache.insert(&transfer.digest, &transfer.content)?;
                    outstanding.remove(&transfer.digest);
                    debug!(job = %self.id, path = transfer.path.as_str(), "dependency cached");
                }
                Message::FilesSent => break,
                other => {
                    return Err(ProtocolError::UnexpectedMessage {
                        expected: "FileTransfer",
                        got: other.kind().name(),
                    }
                    .into());
                }
            }
        }

        if outstanding.is_empty() {
            Ok(())
        } else {
            Err(JobError::MissingDependencies(outstanding.len()))
        }
    }

    /// Pin every dependency and link it into the job tree at its
    /// re-parented client path. Hard links keep this free; a copy covers
    /// caches on another filesystem. Symlinks are never used since a
    /// chroot would resolve them outside the tree.
    fn materialize(&mut self) -> Result<(), JobError> {
        let mapped_cwd = rewrite::map_cwd(&self.root, &self.request.cwd);
        std::fs::create_dir_all(&mapped_cwd)?;

        let dependencies = self.request.dependency_hashes.clone();
        for (path, digest) in &dependencies {
            let blob = self.daemon.cache.pin(digest)?;
            self.pinned.push(digest.clone());

            let dest = rewrite::map_client_path(&self.root, &mapped_cwd, path);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            link_or_copy(&blob, &dest)?;
        }
        Ok(())
    }

    async fn compile(
        &self,
        sandbox: &Sandbox,
        rewritten: &RewrittenJob,
    ) -> Result<CompilationResult, JobError> {
        let mapped_cwd = rewrite::map_cwd(&self.root, &self.request.cwd);
        let output = sandbox.run(&rewritten.remote_argv, &mapped_cwd, &[]).await?;

        let mut object_files = Vec::new();
        if output.exit_code == 0 {
            for mapping in &rewritten.outputs {
                let content = std::fs::read(&mapping.server_path)
                    .map_err(|_| JobError::MissingArtifact(mapping.client_path.clone()))?;
                object_files.push(ObjectFile {
                    path: mapping.client_path.clone(),
                    content,
                });
            }
        }

        Ok(CompilationResult {
            exit_code: output.exit_code as u32,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            object_files,
        })
    }

    /// Unpin everything and delete the scratch tree. Runs on every exit
    /// path, including after errors and client disconnects.
    fn teardown(&mut self) {
        for digest in self.pinned.drain(..) {
            self.daemon.cache.unpin(&digest);
        }
        if self.root.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.root) {
                warn!(job = %self.id, error = %e, "failed to remove scratch dir");
            } else {
                debug!(job = %self.id, root = %self.root.display(), "scratch dir removed");
            }
        }
    }
}

fn link_or_copy(blob: &Path, dest: &Path) -> std::io::Result<()> {
    if dest.exists() {
        return Ok(());
    }
    match std::fs::hard_link(blob, dest) {
        Ok(()) => Ok(()),
        // Cross-device (or exotic filesystem): fall back to a real copy.
        Err(_) => std::fs::copy(blob, dest).map(|_| ()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_or_copy_produces_identical_content() {
        let dir = tempfile::tempdir().unwrap();
        let blob = dir.path().join("blob");
        std::fs::write(&blob, b"content").unwrap();

        let dest = dir.path().join("sub/dir/dep.h");
        std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
        link_or_copy(&blob, &dest).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"content");

        // Idempotent when the destination already exists.
        link_or_copy(&blob, &dest).unwrap();
    }
}
