//! Metadata caching with TTL expiry and a per-identifier fetch guard.
//!
//! The cache never fetches anything itself: it stores what a successful
//! playable fetch produced and answers point lookups. Expiry policy
//! (revalidate, refetch, or serve stale) lives in the downloader; the
//! store only says whether an entry exists and when it was fetched.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::ident::TrackId;
use crate::provider::TrackMetadata;

/// Fixed time-to-live for cached metadata: 2 hours.
pub const CACHE_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// Errors from the cache store. Callers treat these as non-fatal: a read
/// failure degrades to a miss, a write failure is logged and ignored.
#[derive(Debug, Error)]
pub enum CacheError {
    /// File system failure underneath the store.
    #[error("cache I/O error at {path}: {source}")]
    Io {
        /// The path where the error occurred.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A stored entry could not be serialized or deserialized.
    #[error("cache entry at {path} is corrupt: {source}")]
    Corrupt {
        /// The path of the bad entry.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// One cached metadata record, keyed uniquely by identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry {
    /// The track identifier this entry belongs to.
    pub id: String,
    /// Unix seconds when the metadata was fetched.
    pub fetched_at: u64,
    /// Time-to-live in seconds.
    pub ttl_seconds: u64,
    /// The cached metadata record.
    pub metadata: TrackMetadata,
    /// Provider-reported availability at fetch time. Entries are only
    /// ever created from playable fetches.
    pub playable: bool,
}

impl CacheEntry {
    /// Creates an entry from a freshly fetched metadata record.
    #[must_use]
    pub fn new(metadata: TrackMetadata, now: SystemTime) -> Self {
        Self {
            id: metadata.id.clone(),
            fetched_at: unix_seconds(now),
            ttl_seconds: CACHE_TTL.as_secs(),
            playable: metadata.playable,
            metadata,
        }
    }

    /// Pure expiry check: `now - fetched_at > ttl_seconds`.
    #[must_use]
    pub fn has_expired(&self, now: SystemTime) -> bool {
        unix_seconds(now).saturating_sub(self.fetched_at) > self.ttl_seconds
    }
}

fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Injectable metadata store. Default-constructed once per process and
/// passed explicitly to the downloader, never accessed as a singleton.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Returns the stored entry for an identifier, without fetching.
    async fn get(&self, id: &TrackId) -> Result<Option<CacheEntry>, CacheError>;

    /// Stores or overwrites the entry for `entry.id`.
    async fn put(&self, entry: &CacheEntry) -> Result<(), CacheError>;

    /// Removes a stored entry; returns whether one existed.
    async fn delete(&self, id: &TrackId) -> Result<bool, CacheError>;
}

/// Durable store: one JSON file per identifier under a user-scoped cache
/// directory, so entries survive process restarts within their TTL.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Creates a store rooted at the given directory.
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Default cache directory: `$XDG_CACHE_HOME/tunedl`, falling back to
    /// `$HOME/.cache/tunedl`.
    #[must_use]
    pub fn default_dir() -> Option<PathBuf> {
        if let Some(xdg) = non_empty_env("XDG_CACHE_HOME") {
            return Some(PathBuf::from(xdg).join("tunedl"));
        }
        let home = non_empty_env("HOME")?;
        Some(PathBuf::from(home).join(".cache").join("tunedl"))
    }

    fn entry_path(&self, id: &TrackId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

fn non_empty_env(name: &str) -> Option<std::ffi::OsString> {
    let value = std::env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

#[async_trait]
impl MetadataStore for FileStore {
    async fn get(&self, id: &TrackId) -> Result<Option<CacheEntry>, CacheError> {
        let path = self.entry_path(id);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::Io { path, source: e }),
        };
        let entry: CacheEntry =
            serde_json::from_str(&raw).map_err(|source| CacheError::Corrupt {
                path: path.clone(),
                source,
            })?;
        Ok(Some(entry))
    }

    async fn put(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| CacheError::Io {
                path: self.dir.clone(),
                source,
            })?;
        let path = self.dir.join(format!("{}.json", entry.id));
        let raw = serde_json::to_string_pretty(entry).map_err(|source| CacheError::Corrupt {
            path: path.clone(),
            source,
        })?;
        // Write-then-rename keeps a crash from leaving a truncated entry.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw)
            .await
            .map_err(|source| CacheError::Io {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|source| CacheError::Io { path, source })?;
        Ok(())
    }

    async fn delete(&self, id: &TrackId) -> Result<bool, CacheError> {
        let path = self.entry_path(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CacheError::Io { path, source: e }),
        }
    }
}

/// In-memory store for tests and cache-less embedding.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn get(&self, id: &TrackId) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.entries.lock().await.get(id.as_str()).cloned())
    }

    async fn put(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        self.entries
            .lock()
            .await
            .insert(entry.id.clone(), entry.clone());
        Ok(())
    }

    async fn delete(&self, id: &TrackId) -> Result<bool, CacheError> {
        Ok(self.entries.lock().await.remove(id.as_str()).is_some())
    }
}

/// Per-identifier fetch guard: at most one in-flight metadata fetch per
/// id per process. A pass holds the guard across its check-cache-or-fetch
/// sequence; concurrent passes for the same id wait and then see the
/// first pass's cached result instead of issuing a duplicate fetch.
#[derive(Debug, Default)]
pub struct SingleFlight {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SingleFlight {
    /// Creates an empty guard table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the fetch slot for an identifier, waiting if another pass
    /// holds it.
    pub async fn acquire(&self, id: &TrackId) -> OwnedMutexGuard<()> {
        let slot = {
            let mut locks = self.locks.lock().await;
            // A slot only the map still references has no holder and no
            // waiter left, so it can be dropped before the table grows.
            locks.retain(|_, slot| Arc::strong_count(slot) > 1);
            Arc::clone(
                locks
                    .entry(id.as_str().to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        debug!(id = %id, "waiting for fetch slot");
        slot.lock_owned().await
    }
}
