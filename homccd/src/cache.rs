//! Content-addressed dependency cache with bounded size and LRU eviction.
//!
//! Entries are keyed by the hex digest of their exact byte content and live
//! at `cache_dir/<first-2-hex>/<digest>` for filesystem-friendly fan-out.
//! One mutex serializes all metadata; blob I/O happens outside it. Pinned
//! entries (refcount > 0) are never evicted; eviction walks unpinned entries
//! in ascending last-use order until the byte budget holds again.
//!
//! Recency is a logical clock rather than raw wall time: strictly
//! monotonic within a process, seeded from blob mtimes during startup
//! recovery so pre-crash ordering carries over.

use homcc_common::hashing::digest_bytes;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default on-disk location of the server cache.
pub const DEFAULT_CACHE_DIR: &str = "/tmp/homcc-cache";

/// Default cache byte budget: 10 GiB.
pub const DEFAULT_CACHE_BUDGET: u64 = 10 * 1024 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("digest {0} is not in the cache")]
    NotFound(String),

    #[error("blob of {size} bytes exceeds the cache budget of {budget} bytes")]
    TooLarge { size: u64, budget: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
struct Entry {
    size: u64,
    last_used: u64,
    refcount: u32,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    total_size: u64,
    /// Logical recency clock; see module docs.
    clock: u64,
}

impl Inner {
    fn tick(&mut self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        self.clock = now.max(self.clock + 1);
        self.clock
    }
}

/// The server-wide dependency cache.
#[derive(Debug)]
pub struct Cache {
    dir: PathBuf,
    budget: u64,
    inner: Mutex<Inner>,
}

impl Cache {
    /// Open (and if necessary create) a cache directory, recovering any
    /// entries a previous server instance left behind.
    pub fn open(dir: impl Into<PathBuf>, budget: u64) -> Result<Self, CacheError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let cache = Self {
            dir,
            budget,
            inner: Mutex::new(Inner::default()),
        };
        cache.recover()?;
        Ok(cache)
    }

    /// Whether a digest is cached. Does not touch recency.
    pub fn contains(&self, digest: &str) -> bool {
        self.inner.lock().unwrap().entries.contains_key(digest)
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes currently accounted for.
    pub fn total_size(&self) -> u64 {
        self.inner.lock().unwrap().total_size
    }

    /// Protect an entry from eviction and return its blob path.
    pub fn pin(&self, digest: &str) -> Result<PathBuf, CacheError> {
        let mut inner = self.inner.lock().unwrap();
        let tick = inner.tick();
        let entry = inner
            .entries
            .get_mut(digest)
            .ok_or_else(|| CacheError::NotFound(digest.to_string()))?;
        entry.refcount += 1;
        entry.last_used = tick;
        Ok(self.blob_path(digest))
    }

    /// Release a pin taken with [`pin`](Self::pin).
    pub fn unpin(&self, digest: &str) {
        let mut inner = self.inner.lock().unwrap();
        match inner.entries.get_mut(digest) {
            Some(entry) if entry.refcount > 0 => entry.refcount -= 1,
            Some(_) => warn!(digest, "unpin without matching pin"),
            None => warn!(digest, "unpin of unknown digest"),
        }
    }

    /// Store a blob under its digest, evicting unpinned entries as needed.
    ///
    /// The write is atomic (temp file + rename), so a crash never leaves a
    /// half-written blob under a valid digest name. The byte budget may be
    /// exceeded transiently while pins hold more than it allows; the next
    /// insert shrinks the cache back once pins drop.
    pub fn insert(&self, digest: &str, content: &[u8]) -> Result<PathBuf, CacheError> {
        let size = content.len() as u64;
        if size > self.budget {
            return Err(CacheError::TooLarge {
                size,
                budget: self.budget,
            });
        }

        let path = self.blob_path(digest);

        {
            let mut inner = self.inner.lock().unwrap();
            if inner.entries.contains_key(digest) {
                let tick = inner.tick();
                if let Some(entry) = inner.entries.get_mut(digest) {
                    entry.last_used = tick;
                }
                return Ok(path);
            }
        }

        // Blob I/O outside the lock.
        let tmp = self.dir.join(format!("tmp-{}", Uuid::new_v4()));
        std::fs::write(&tmp, content)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(&tmp, &path)?;

        let victims: Vec<String> = {
            let mut inner = self.inner.lock().unwrap();
            let tick = inner.tick();
            inner.entries.insert(
                digest.to_string(),
                Entry {
                    size,
                    last_used: tick,
                    refcount: 0,
                },
            );
            inner.total_size += size;
            self.evict_locked(&mut inner, digest)
        };

        for victim in &victims {
            let _ = std::fs::remove_file(self.blob_path(victim));
            debug!(digest = victim.as_str(), "evicted cache entry");
        }

        Ok(path)
    }

    /// Select and detach eviction victims; actual file removal happens
    /// outside the lock. The just-inserted digest is exempt.
    fn evict_locked(&self, inner: &mut Inner, protect: &str) -> Vec<String> {
        if inner.total_size <= self.budget {
            return Vec::new();
        }

        let mut candidates: Vec<(u64, String, u64)> = inner
            .entries
            .iter()
            .filter(|(digest, entry)| entry.refcount == 0 && digest.as_str() != protect)
            .map(|(digest, entry)| (entry.last_used, digest.clone(), entry.size))
            .collect();
        candidates.sort();

        let mut victims = Vec::new();
        for (_, digest, size) in candidates {
            if inner.total_size <= self.budget {
                break;
            }
            inner.entries.remove(&digest);
            inner.total_size -= size;
            victims.push(digest);
        }
        victims
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        let fanout = digest.get(0..2).unwrap_or("xx");
        self.dir.join(fanout).join(digest)
    }

    /// Startup scan: account every blob that still hashes to its name,
    /// delete everything else (tampered blobs, leftover temp files).
    fn recover(&self) -> Result<(), CacheError> {
        let mut inner = self.inner.lock().unwrap();
        let mut recovered = 0usize;

        for top in std::fs::read_dir(&self.dir)? {
            let top = top?;
            let name = top.file_name().to_string_lossy().into_owned();

            if !top.file_type()?.is_dir() {
                // Temp files from an interrupted insert.
                let _ = std::fs::remove_file(top.path());
                continue;
            }
            if name.len() != 2 || !name.chars().all(|c| c.is_ascii_hexdigit()) {
                warn!(dir = name.as_str(), "ignoring foreign directory in cache");
                continue;
            }

            for blob in std::fs::read_dir(top.path())? {
                let blob = blob?;
                let digest = blob.file_name().to_string_lossy().into_owned();
                let content = match std::fs::read(blob.path()) {
                    Ok(content) => content,
                    Err(e) => {
                        warn!(digest = digest.as_str(), error = %e, "unreadable blob, removing");
                        let _ = std::fs::remove_file(blob.path());
                        continue;
                    }
                };
                if digest_bytes(&content) != digest {
                    warn!(digest = digest.as_str(), "blob content disagrees with its name, removing");
                    let _ = std::fs::remove_file(blob.path());
                    continue;
                }

                let size = content.len() as u64;
                let last_used = blob
                    .metadata()
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_nanos() as u64)
                    .unwrap_or(0);

                inner.clock = inner.clock.max(last_used);
                inner.total_size += size;
                inner.entries.insert(
                    digest,
                    Entry {
                        size,
                        last_used,
                        refcount: 0,
                    },
                );
                recovered += 1;
            }
        }

        if recovered > 0 {
            info!(
                entries = recovered,
                bytes = inner.total_size,
                dir = %self.dir.display(),
                "recovered cache"
            );
        }
        Ok(())
    }

    #[cfg(test)]
    fn last_used_of(&self, digest: &str) -> Option<u64> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .get(digest)
            .map(|e| e.last_used)
    }
}

/// Blob path helper for callers that only hold a digest and the cache dir.
pub fn blob_path_in(dir: &Path, digest: &str) -> PathBuf {
    let fanout = digest.get(0..2).unwrap_or("xx");
    dir.join(fanout).join(digest)
}

// =========================================================================
// Tests
// =========================================================================
