//! TCP listener and connection dispatcher.
//!
//! The listener is single-accept; concurrency comes from one spawned task
//! per admitted connection, bounded by the global job limit. Admission is
//! decided before the task spawns: a saturated server answers with a framed
//! `ConnectionRefused` and closes, so the client can fall back locally
//! instead of queueing.

use crate::cache::Cache;
use crate::job;
use homcc_common::Compression;
use homcc_common::protocol::{ConnectionRefused, Message, write_message};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Default listen address.
pub const DEFAULT_ADDRESS: &str = "0.0.0.0";

/// Default job limit: one per CPU, plus two to cover disk and network
/// stalls.
pub fn default_limit() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        + 2
}

/// State shared by every connection task.
#[derive(Debug)]
pub struct Daemon {
    pub cache: Cache,
    pub limit: usize,
    /// Parent of per-job scratch directories (normally /tmp).
    pub scratch_root: PathBuf,
    active: Mutex<usize>,
}

impl Daemon {
    pub fn new(cache: Cache, limit: usize, scratch_root: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            cache,
            limit,
            scratch_root: scratch_root.into(),
            active: Mutex::new(0),
        })
    }

    /// Number of jobs currently in flight.
    pub fn active_jobs(&self) -> usize {
        *self.active.lock().unwrap()
    }

    /// Claim an admission slot, or `None` when the server is saturated.
    fn try_admit(self: &Arc<Self>) -> Option<AdmissionGuard> {
        let mut active = self.active.lock().unwrap();
        if *active >= self.limit {
            return None;
        }
        *active += 1;
        Some(AdmissionGuard {
            daemon: Arc::clone(self),
        })
    }
}

/// Releases its admission slot when the connection task ends, however it
/// ends.
struct AdmissionGuard {
    daemon: Arc<Daemon>,
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        *self.daemon.active.lock().unwrap() -= 1;
    }
}

/// Accept loop. Runs until the listener fails or the task is cancelled.
pub async fn serve(listener: TcpListener, daemon: Arc<Daemon>) -> std::io::Result<()> {
    info!(
        addr = %listener.local_addr()?,
        limit = daemon.limit,
        "homccd listening"
    );

    loop {
        let (mut stream, peer) = listener.accept().await?;

        match daemon.try_admit() {
            Some(guard) => {
                let daemon = Arc::clone(&daemon);
                tokio::spawn(async move {
                    job::handle_connection(stream, daemon).await;
                    drop(guard);
                });
            }
            None => {
                let reason = format!("limit {} reached", daemon.limit);
                info!(%peer, "refusing connection: {reason}");
                tokio::spawn(async move {
                    let refused = Message::ConnectionRefused(ConnectionRefused { reason });
                    if let Err(e) = write_message(&mut stream, &refused, Compression::None).await {
                        warn!(%peer, error = %e, "failed to send refusal");
                    }
                    let _ = stream.shutdown().await;
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DEFAULT_CACHE_BUDGET;

    fn daemon(limit: usize) -> (tempfile::TempDir, Arc<Daemon>) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path().join("cache"), DEFAULT_CACHE_BUDGET).unwrap();
        let daemon = Daemon::new(cache, limit, dir.path().join("scratch"));
        (dir, daemon)
    }

    #[test]
    fn admission_is_bounded_by_limit() {
        let (_dir, daemon) = daemon(2);
        let first = daemon.try_admit().unwrap();
        let second = daemon.try_admit().unwrap();
        assert!(daemon.try_admit().is_none());
        assert_eq!(daemon.active_jobs(), 2);

        drop(first);
        assert_eq!(daemon.active_jobs(), 1);
        let _third = daemon.try_admit().unwrap();
        assert!(daemon.try_admit().is_none());
        drop(second);
    }

    #[test]
    fn default_limit_leaves_io_headroom() {
        assert!(default_limit() >= 3);
    }
}
