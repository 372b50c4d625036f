//! Machine-wide compile-slot reservation.
//!
//! Every `(host, port)` pair owns a named counting semaphore shared by all
//! client processes on the machine, realized as a directory of lock files:
//! `<slot dir>/<host key>/<n>.slot`, one file per slot, each claimed with a
//! non-blocking exclusive advisory lock. The kernel drops advisory locks
//! when their owner dies - even under SIGKILL - so the count can never
//! leak; the janitor merely sweeps the stale files dead owners leave
//! behind, using the pid recorded in each file as the liveness probe.

use crate::error::ClientError;
use fs2::FileExt;
use homcc_common::host::Host;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Environment variable overriding the slot directory (used by tests).
pub const SLOT_DIR_ENV: &str = "HOMCC_SLOT_DIR";

/// The machine-wide slot directory.
pub fn default_slot_dir() -> PathBuf {
    std::env::temp_dir().join("homcc-slots")
}

/// Handle on the machine-wide slot directory.
#[derive(Debug, Clone)]
pub struct SlotPool {
    root: PathBuf,
}

/// One held compile slot. The advisory lock is tied to the open file and
/// releases on drop or process death.
#[derive(Debug)]
pub struct SlotGuard {
    _file: File,
    pub host_key: String,
    pub index: u32,
}

impl SlotPool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Pool at `$HOMCC_SLOT_DIR` or the system default.
    pub fn system() -> Self {
        match std::env::var(SLOT_DIR_ENV) {
            Ok(dir) => Self::new(dir),
            Err(_) => Self::new(default_slot_dir()),
        }
    }

    /// Non-blocking acquire of one slot on `host`. Returns `None` when all
    /// `host.limit` slots are held, by this process or any other.
    pub fn try_acquire(&self, host: &Host) -> Result<Option<SlotGuard>, ClientError> {
        let host_key = host.slot_key();
        let dir = self.root.join(&host_key);
        std::fs::create_dir_all(&dir)?;

        for index in 0..host.limit {
            let path = dir.join(format!("{index}.slot"));
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;

            if file.try_lock_exclusive().is_err() {
                continue;
            }

            file.set_len(0)?;
            write!(file, "{}", std::process::id())?;
            debug!(host = %host, slot = index, "slot acquired");
            return Ok(Some(SlotGuard {
                _file: file,
                host_key,
                index,
            }));
        }
        Ok(None)
    }

    /// Sweep slot files whose recorded owner is dead.
    ///
    /// Locks release with their owner automatically, so this only tidies
    /// the directory; it never frees a slot a live process holds, because
    /// a held slot's lock attempt fails. Returns the number of files
    /// removed.
    pub fn janitor(&self) -> usize {
        let mut removed = 0;
        let Ok(hosts) = std::fs::read_dir(&self.root) else {
            return 0;
        };

        for host_dir in hosts.flatten() {
            let Ok(entries) = std::fs::read_dir(host_dir.path()) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("slot") {
                    continue;
                }
                if remove_if_stale(&path) {
                    debug!(path = %path.display(), "removed stale slot file");
                    removed += 1;
                }
            }
        }
        removed
    }

    /// How many of `host`'s slots are currently held machine-wide.
    pub fn acquired(&self, host: &Host) -> u32 {
        let dir = self.root.join(host.slot_key());
        let mut held = 0;
        for index in 0..host.limit {
            let path = dir.join(format!("{index}.slot"));
            let Ok(file) = OpenOptions::new().read(true).write(true).open(&path) else {
                continue;
            };
            if file.try_lock_exclusive().is_err() {
                held += 1;
            }
            // Dropping `file` releases the probe lock immediately.
        }
        held
    }
}

/// Remove a slot file if its owner pid is gone and nobody holds its lock.
fn remove_if_stale(path: &Path) -> bool {
    let Ok(mut file) = OpenOptions::new().read(true).write(true).open(path) else {
        return false;
    };

    let mut content = String::new();
    if file.read_to_string(&mut content).is_err() {
        return false;
    }
    if let Ok(pid) = content.trim().parse::<i32>()
        && pid_alive(pid)
    {
        return false;
    }

    // Owner is dead (or never wrote a pid). Take the lock to exclude a
    // concurrent live holder, then unlink.
    if file.try_lock_exclusive().is_err() {
        return false;
    }
    match std::fs::remove_file(path) {
        Ok(()) => true,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "could not remove stale slot file");
            false
        }
    }
}

fn pid_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

// =========================================================================
// Tests
// =========================================================================
