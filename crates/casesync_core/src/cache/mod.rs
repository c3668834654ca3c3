//! Durable snapshot cache for offline fallback.
//!
//! Every successful online fetch (the session form state, reference lists)
//! is written through to the cache. When a fetch fails or the device is known
//! to be offline, the last snapshot is served instead and the caller switches
//! to degraded mode.
//!
//! Snapshots carry a logical [`FetchStamp`] issued when the fetch *started*.
//! A snapshot is only replaced by one with a higher stamp, so a slow response
//! that arrives after a newer one cannot roll the cache back.
//!
//! ```text
//!   fetch ──ok──► put_stamped(key, payload, stamp) ──► CacheBackend
//!     │                                                   ▲
//!     └──err────► get(key) ───────────────────────────────┘
//! ```

mod file;
mod memory;
mod reference;

use std::fmt;
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CacheError, CacheResult};
use crate::types::SessionId;

pub use file::FileCacheBackend;
pub use memory::MemoryCacheBackend;
pub use reference::{ReferenceCategory, ReferenceData, ReferenceList};

/// Key a snapshot is stored under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CacheKey {
    /// Form state of one session.
    Session(String),
    /// A reference-data list.
    Reference(ReferenceCategory),
    /// Offline edits of one session that are waiting for replay.
    Pending(String),
}

impl CacheKey {
    /// Key for a session's form state.
    pub fn session(id: impl Into<String>) -> Self {
        CacheKey::Session(id.into())
    }

    /// Key for a session id.
    pub fn for_session(id: &SessionId) -> Self {
        CacheKey::Session(id.as_str().to_string())
    }

    /// Key for a session's queued offline edits.
    pub fn pending(id: &SessionId) -> Self {
        CacheKey::Pending(id.as_str().to_string())
    }

    /// Key for a reference-data category.
    pub fn reference(category: ReferenceCategory) -> Self {
        CacheKey::Reference(category)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Session(id) => write!(f, "session:{}", id),
            CacheKey::Reference(category) => write!(f, "reference:{}", category.as_str()),
            CacheKey::Pending(id) => write!(f, "pending:{}", id),
        }
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for CacheKey {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        if let Some(id) = raw.strip_prefix("session:") {
            return Ok(CacheKey::Session(id.to_string()));
        }
        if let Some(id) = raw.strip_prefix("pending:") {
            return Ok(CacheKey::Pending(id.to_string()));
        }
        if let Some(name) = raw.strip_prefix("reference:") {
            return ReferenceCategory::parse(name)
                .map(CacheKey::Reference)
                .ok_or_else(|| format!("unknown reference category: {}", name));
        }
        Err(format!("invalid cache key: {}", raw))
    }
}

/// Logical time of a fetch, issued by [`CacheStore::stamp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FetchStamp(u64);

/// A cached payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    /// Key the payload belongs to.
    pub key: CacheKey,
    /// Full payload as fetched.
    pub payload: Value,
    /// Wall-clock time the payload was cached.
    pub cached_at: DateTime<Utc>,
    /// Logical time of the fetch that produced the payload.
    pub stamp: FetchStamp,
}

/// Storage behind a [`CacheStore`].
///
/// Implementations only persist and return snapshots; ordering rules live in
/// the store.
pub trait CacheBackend: Send + Sync {
    /// Load the snapshot for a key.
    fn load(&self, key: &CacheKey) -> CacheResult<Option<CacheSnapshot>>;

    /// Persist a snapshot, replacing any previous one for the same key.
    fn store(&self, snapshot: &CacheSnapshot) -> CacheResult<()>;

    /// Delete the snapshot for a key. Missing keys are not an error.
    fn remove(&self, key: &CacheKey) -> CacheResult<()>;

    /// All keys with a stored snapshot.
    fn keys(&self) -> CacheResult<Vec<CacheKey>>;

    /// Delete every snapshot.
    fn clear(&self) -> CacheResult<()> {
        for key in self.keys()? {
            self.remove(&key)?;
        }
        Ok(())
    }
}

/// Result of [`CacheStore::load_through`].
#[derive(Debug, Clone, PartialEq)]
pub struct Loaded {
    /// The payload, live or cached.
    pub payload: Value,
    /// Whether the payload came from the cache.
    pub from_cache: bool,
    /// When the cached payload was stored (only set for cache hits).
    pub cached_at: Option<DateTime<Utc>>,
}

/// Per-key cache statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntryStats {
    /// Key of the entry.
    pub key: CacheKey,
    /// When it was cached.
    pub cached_at: DateTime<Utc>,
    /// Serialized payload size in bytes.
    pub payload_bytes: usize,
}

/// Outcome of a write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The snapshot was stored.
    Stored,
    /// A snapshot from a later fetch is already stored; nothing changed.
    Stale,
}

/// Snapshot store with monotonic replacement.
pub struct CacheStore {
    backend: Box<dyn CacheBackend>,
    clock: AtomicU64,
    write_lock: Mutex<()>,
}

impl CacheStore {
    /// Create a store over a backend.
    ///
    /// The stamp clock resumes after the highest stamp already persisted so
    /// snapshots from a previous run are never considered newer than fresh fetches.
    pub fn new(backend: impl CacheBackend + 'static) -> Self {
        let mut highest = 0;
        match backend.keys() {
            Ok(keys) => {
                for key in keys {
                    if let Ok(Some(snapshot)) = backend.load(&key) {
                        highest = highest.max(snapshot.stamp.0);
                    }
                }
            }
            Err(e) => log::warn!("[CacheStore] Could not scan existing snapshots: {}", e),
        }

        Self {
            backend: Box::new(backend),
            clock: AtomicU64::new(highest),
            write_lock: Mutex::new(()),
        }
    }

    /// In-memory store, mostly for tests and ephemeral sessions.
    pub fn in_memory() -> Self {
        Self::new(MemoryCacheBackend::new())
    }

    /// Issue a stamp for a fetch that is about to start.
    pub fn stamp(&self) -> FetchStamp {
        FetchStamp(self.clock.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Store a payload fetched just now.
    pub fn put(&self, key: &CacheKey, payload: Value) -> CacheResult<PutOutcome> {
        let stamp = self.stamp();
        self.put_stamped(key, payload, stamp)
    }

    /// Store a payload produced by the fetch that was issued `stamp`.
    ///
    /// Returns [`PutOutcome::Stale`] without writing if a later fetch already
    /// stored a snapshot for the key.
    pub fn put_stamped(
        &self,
        key: &CacheKey,
        payload: Value,
        stamp: FetchStamp,
    ) -> CacheResult<PutOutcome> {
        let _guard = self.write_lock.lock().unwrap();

        if let Some(existing) = self.backend.load(key)?
            && existing.stamp > stamp
        {
            log::debug!(
                "[CacheStore] Ignoring stale snapshot for {} ({:?} < {:?})",
                key,
                stamp,
                existing.stamp
            );
            return Ok(PutOutcome::Stale);
        }

        let snapshot = CacheSnapshot {
            key: key.clone(),
            payload,
            cached_at: Utc::now(),
            stamp,
        };
        self.backend.store(&snapshot)?;
        Ok(PutOutcome::Stored)
    }

    /// Last snapshot for a key.
    pub fn get(&self, key: &CacheKey) -> CacheResult<Option<CacheSnapshot>> {
        self.backend.load(key)
    }

    /// Last snapshot for a key, decoded into `T`.
    pub fn get_as<T: serde::de::DeserializeOwned>(&self, key: &CacheKey) -> CacheResult<Option<T>> {
        match self.backend.load(key)? {
            Some(snapshot) => Ok(Some(serde_json::from_value(snapshot.payload)?)),
            None => Ok(None),
        }
    }

    /// Drop the snapshot for a key.
    pub fn remove(&self, key: &CacheKey) -> CacheResult<()> {
        let _guard = self.write_lock.lock().unwrap();
        self.backend.remove(key)
    }

    /// Drop every snapshot.
    pub fn clear(&self) -> CacheResult<()> {
        let _guard = self.write_lock.lock().unwrap();
        self.backend.clear()
    }

    /// Statistics for every cached entry, ordered by key.
    pub fn stats(&self) -> CacheResult<Vec<CacheEntryStats>> {
        let mut keys = self.backend.keys()?;
        keys.sort();

        let mut stats = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(snapshot) = self.backend.load(&key)? {
                stats.push(CacheEntryStats {
                    payload_bytes: serde_json::to_vec(&snapshot.payload)?.len(),
                    cached_at: snapshot.cached_at,
                    key,
                });
            }
        }
        Ok(stats)
    }

    /// Fetch online and write through, or fall back to the cached snapshot.
    ///
    /// Pass `online = false` when the device is known to be offline; the fetch
    /// is then skipped entirely. Fails with [`CacheError::Miss`] only when the
    /// live fetch was not possible and nothing is cached.
    pub async fn load_through<F, Fut, E>(
        &self,
        key: &CacheKey,
        online: bool,
        fetch: F,
    ) -> CacheResult<Loaded>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>>,
        E: fmt::Display,
    {
        if online {
            let stamp = self.stamp();
            match fetch().await {
                Ok(payload) => {
                    if let Err(e) = self.put_stamped(key, payload.clone(), stamp) {
                        log::warn!("[CacheStore] Failed to cache {}: {}", key, e);
                    }
                    return Ok(Loaded {
                        payload,
                        from_cache: false,
                        cached_at: None,
                    });
                }
                Err(e) => {
                    log::warn!("[CacheStore] Live fetch for {} failed, using cache: {}", key, e);
                }
            }
        }

        match self.backend.load(key)? {
            Some(snapshot) => Ok(Loaded {
                payload: snapshot.payload,
                from_cache: true,
                cached_at: Some(snapshot.cached_at),
            }),
            None => Err(CacheError::Miss(key.clone())),
        }
    }
}

impl fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStore")
            .field("clock", &self.clock.load(Ordering::SeqCst))
            .finish()
    }
}
