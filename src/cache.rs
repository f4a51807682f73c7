//! Deterministic on-disk cache shared across processes.
//!
//! Logical keys map to hash-partitioned file paths, so two unrelated
//! invocations on the same machine share cached registry data. The
//! key-to-path derivation is a durable format: changing it orphans every
//! existing cache on disk.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::http::FetchError;

/// TTL for live registry metadata (24 hours)
pub const TTL_METADATA: Duration = Duration::from_secs(24 * 3600);

/// TTL for version lists, dependents counts and source-host facts (7 days)
pub const TTL_FACTS: Duration = Duration::from_secs(7 * 24 * 3600);

/// TTL for last-seen ownership records (30 days)
pub const TTL_OWNERSHIP: Duration = Duration::from_secs(30 * 24 * 3600);

/// Bound on the in-memory hot tier
const HOT_TIER_CAPACITY: usize = 1000;

/// Attempts to read behind a contended lock before computing anyway
const CONTENTION_RETRIES: u32 = 5;

/// Pause between contended-lock read attempts
const CONTENTION_PAUSE: Duration = Duration::from_millis(50);

/// Lock files older than this are considered abandoned and reclaimed
const LOCK_STALE_AFTER: Duration = Duration::from_secs(30);

/// On-disk entry body: `{"val": ..., "ts": ..., "ttl": ...}`
#[derive(Debug, Serialize, Deserialize)]
struct CacheEnvelope {
    val: serde_json::Value,
    ts: i64,
    ttl: u64,
}

#[derive(Debug, Clone)]
struct HotEntry {
    val: serde_json::Value,
    ts: i64,
}

/// Durable key→value store with per-entry TTL and stampede suppression
pub struct DiskCache {
    root: PathBuf,
    hot: DashMap<String, HotEntry>,
}

impl DiskCache {
    /// Open the cache at the default home-scoped location
    pub fn new() -> anyhow::Result<Self> {
        let root = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("could not determine cache directory"))?
            .join("slopguard");
        Self::with_root(root)
    }

    /// Open the cache at a custom root
    pub fn with_root(root: PathBuf) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&root)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&root, std::fs::Permissions::from_mode(0o700))?;
        }

        Ok(Self {
            root,
            hot: DashMap::new(),
        })
    }

    /// Return the stored value iff it is younger than `ttl`.
    ///
    /// Expired and unreadable entries are removed opportunistically.
    pub fn get(&self, key: &str, ttl: Duration) -> Option<serde_json::Value> {
        let now = current_timestamp();
        let ttl_secs = ttl.as_secs() as i64;

        if let Some(entry) = self.hot.get(key) {
            if now - entry.ts < ttl_secs {
                return Some(entry.val.clone());
            }
        }

        let path = self.storage_path(key);
        let raw = std::fs::read_to_string(&path).ok()?;

        let envelope: CacheEnvelope = match serde_json::from_str(&raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::debug!(key, %err, "removing corrupt cache entry");
                let _ = std::fs::remove_file(&path);
                return None;
            }
        };

        if now - envelope.ts >= ttl_secs {
            let _ = std::fs::remove_file(&path);
            self.hot.remove(key);
            return None;
        }

        self.insert_hot(key, envelope.val.clone(), envelope.ts);
        Some(envelope.val)
    }

    /// Store a value with the given TTL, atomically
    pub fn set(&self, key: &str, value: &serde_json::Value, ttl: Duration) {
        let _guard = self.acquire_lock(key);
        self.install(key, value, ttl);
    }

    /// Cache-or-compute.
    ///
    /// On a miss, one caller produces the value while contenders yield and
    /// retry-read; only non-absent results are stored. Producer errors
    /// pass through untouched.
    pub async fn fetch<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        producer: F,
    ) -> Result<Option<serde_json::Value>, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<serde_json::Value>, FetchError>>,
    {
        if let Some(value) = self.get(key, ttl) {
            return Ok(Some(value));
        }

        match self.try_lock(key) {
            Some(_guard) => {
                // Double-check: a contender may have installed while we
                // were acquiring the lock.
                if let Some(value) = self.get(key, ttl) {
                    return Ok(Some(value));
                }
                let produced = producer().await?;
                if let Some(value) = &produced {
                    self.install(key, value, ttl);
                }
                Ok(produced)
            }
            None => {
                for _ in 0..CONTENTION_RETRIES {
                    tokio::time::sleep(CONTENTION_PAUSE).await;
                    if let Some(value) = self.get(key, ttl) {
                        return Ok(Some(value));
                    }
                }
                // The lock holder is taking too long; compute without it.
                let produced = producer().await?;
                if let Some(value) = &produced {
                    self.install(key, value, ttl);
                }
                Ok(produced)
            }
        }
    }

    /// Write the envelope to a temp sibling and rename it into place
    fn install(&self, key: &str, value: &serde_json::Value, ttl: Duration) {
        let now = current_timestamp();
        let envelope = CacheEnvelope {
            val: value.clone(),
            ts: now,
            ttl: ttl.as_secs(),
        };

        let path = self.storage_path(key);
        if let Some(parent) = path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                return;
            }
        }

        let serialized = match serde_json::to_string(&envelope) {
            Ok(serialized) => serialized,
            Err(_) => return,
        };

        let staging = path.with_extension("cache.tmp");
        if std::fs::write(&staging, serialized).is_ok() {
            let _ = std::fs::rename(&staging, &path);
        }

        self.insert_hot(key, value.clone(), now);
    }

    fn insert_hot(&self, key: &str, val: serde_json::Value, ts: i64) {
        // Bounded: wholesale eviction once the tier fills
        if self.hot.len() >= HOT_TIER_CAPACITY && !self.hot.contains_key(key) {
            self.hot.clear();
        }
        self.hot.insert(key.to_string(), HotEntry { val, ts });
    }

    /// Two-level hashed layout: `<root>/ab/cd/<digest>.cache`
    fn storage_path(&self, key: &str) -> PathBuf {
        let digest = key_digest(key);
        self.root
            .join(&digest[0..2])
            .join(&digest[2..4])
            .join(format!("{}.cache", digest))
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        self.storage_path(key).with_extension("lock")
    }

    /// Exclusive-create the per-key lock file; `None` means contention
    fn try_lock(&self, key: &str) -> Option<LockGuard> {
        let path = self.lock_path(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok()?;
        }

        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(_) => Some(LockGuard { path }),
            Err(_) => {
                reclaim_if_stale(&path);
                None
            }
        }
    }

    /// Acquire the lock, waiting briefly; gives up after a bounded spin
    /// (the atomic rename keeps last-writer-wins safe regardless)
    fn acquire_lock(&self, key: &str) -> Option<LockGuard> {
        for _ in 0..CONTENTION_RETRIES {
            if let Some(guard) = self.try_lock(key) {
                return Some(guard);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        None
    }
}

/// Removes the lock file when the holder finishes
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn reclaim_if_stale(path: &Path) {
    let stale = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .map(|age| age > LOCK_STALE_AFTER)
        .unwrap_or(false);

    if stale {
        let _ = std::fs::remove_file(path);
    }
}

/// SHA-256 hex digest of the logical key
fn key_digest(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Current Unix timestamp in seconds
fn current_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
