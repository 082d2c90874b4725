//! Cache Resolver
//!
//! Keyed lookup/store for cacheable artifacts with restore-key fallback:
//! - Exact key match always wins
//! - Otherwise restore keys are scanned in caller-declared order; the
//!   newest entry under the first matching prefix is returned
//! - `store` is idempotent: the first writer wins per exact key
//!
//! Entries outlive a single run. Eviction of entries unused for the
//! configured inactivity window is advisory and never required for the
//! correctness of a run.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use log::{debug, info};

/// Default inactivity window before an entry is eligible for eviction.
const DEFAULT_TTL_DAYS: i64 = 7;

/// One cached artifact.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Exact key the entry was stored under
    pub key: String,
    /// Path the artifact belongs at inside a job workspace
    pub path: String,
    /// Artifact content
    pub content: String,
    /// When the entry was stored
    pub created_at: DateTime<Utc>,
    /// Last lookup or store that touched the entry
    pub last_used: DateTime<Utc>,
}

/// Storage boundary for cache entries: a content-addressable blob store
/// keyed by string. The engine needs get/put/list-prefix plus removal
/// and timestamp upkeep for advisory eviction.
pub trait CacheBackend: Send {
    /// Fetches an entry by exact key.
    fn get(&self, key: &str) -> Option<&CacheEntry>;

    /// Inserts an entry. Returns false (and leaves the existing entry
    /// untouched) when the key is already present.
    fn put(&mut self, entry: CacheEntry) -> bool;

    /// Removes an entry. Returns true if it existed.
    fn remove(&mut self, key: &str) -> bool;

    /// Keys starting with `prefix`, in unspecified order.
    fn list_prefix(&self, prefix: &str) -> Vec<String>;

    /// Updates an entry's last-used timestamp.
    fn touch(&mut self, key: &str, now: DateTime<Utc>);
}

/// In-memory backend used by the engine and its tests.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: HashMap<String, CacheEntry>,
}

impl InMemoryCache {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheBackend for InMemoryCache {
    fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    fn put(&mut self, entry: CacheEntry) -> bool {
        if self.entries.contains_key(&entry.key) {
            return false;
        }
        self.entries.insert(entry.key.clone(), entry);
        true
    }

    fn remove(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    fn list_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    fn touch(&mut self, key: &str, now: DateTime<Utc>) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.last_used = now;
        }
    }
}

/// A successful lookup: the entry plus whether the primary key matched.
#[derive(Debug, Clone)]
pub struct CacheHit {
    /// The resolved entry
    pub entry: CacheEntry,
    /// True only when the primary key matched exactly
    pub exact: bool,
}

/// Cache resolution over a pluggable backend.
pub struct CacheResolver {
    backend: Box<dyn CacheBackend>,
    ttl: Duration,
}

impl CacheResolver {
    /// Creates a resolver over the given backend with the default TTL.
    pub fn new(backend: Box<dyn CacheBackend>) -> Self {
        Self {
            backend,
            ttl: Duration::days(DEFAULT_TTL_DAYS),
        }
    }

    /// Creates a resolver over a fresh in-memory backend.
    pub fn in_memory() -> Self {
        Self::new(Box::new(InMemoryCache::new()))
    }

    /// Overrides the inactivity window.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Resolves a key: exact match first, then each restore key in
    /// declared order as a prefix, picking the newest entry under the
    /// first prefix with any match. Touches the hit's last-used stamp.
    pub fn lookup(&mut self, key: &str, restore_keys: &[String]) -> Option<CacheHit> {
        let now = Utc::now();

        if let Some(entry) = self.backend.get(key) {
            debug!("Cache hit (exact): {}", key);
            let hit = CacheHit {
                entry: entry.clone(),
                exact: true,
            };
            self.backend.touch(key, now);
            return Some(hit);
        }

        for restore_key in restore_keys {
            let mut candidates = self.backend.list_prefix(restore_key);
            if candidates.is_empty() {
                continue;
            }
            // Newest entry wins within one restore key.
            candidates.sort_by_key(|k| {
                self.backend
                    .get(k)
                    .map(|e| e.created_at)
                    .unwrap_or(DateTime::<Utc>::MIN_UTC)
            });
            let best = candidates.pop()?;
            let entry = self.backend.get(&best)?.clone();
            debug!("Cache hit (restore key '{}'): {}", restore_key, best);
            self.backend.touch(&best, now);
            return Some(CacheHit { entry, exact: false });
        }

        debug!("Cache miss: {}", key);
        None
    }

    /// Stores an entry. A no-op when the exact key already exists: the
    /// first writer wins and the original content is preserved. Returns
    /// true when a new entry was written.
    pub fn store(
        &mut self,
        key: impl Into<String>,
        path: impl Into<String>,
        content: impl Into<String>,
    ) -> bool {
        let key = key.into();
        let now = Utc::now();
        let written = self.backend.put(CacheEntry {
            key: key.clone(),
            path: path.into(),
            content: content.into(),
            created_at: now,
            last_used: now,
        });
        if written {
            info!("Cache stored: {}", key);
        } else {
            debug!("Cache store skipped, key exists: {}", key);
        }
        written
    }

    /// Evicts entries unused for longer than the TTL. Returns the number
    /// of entries removed.
    pub fn evict_stale(&mut self) -> usize {
        self.evict_stale_at(Utc::now())
    }

    /// Eviction against an explicit clock, for tests and hosts that
    /// batch maintenance.
    pub fn evict_stale_at(&mut self, now: DateTime<Utc>) -> usize {
        let stale: Vec<String> = self
            .backend
            .list_prefix("")
            .into_iter()
            .filter(|k| {
                self.backend
                    .get(k)
                    .map(|e| now - e.last_used > self.ttl)
                    .unwrap_or(false)
            })
            .collect();

        for key in &stale {
            self.backend.remove(key);
            info!("Cache evicted (stale): {}", key);
        }
        stale.len()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.backend.list_prefix("").len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
