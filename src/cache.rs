//! Typed TTL cache for derived context strings, backed by moka.
//!
//! Each manager owns its own [`TtlCache`] instance keyed by a structured key
//! type, so the RAG, CAG and facade caches can never collide. Entries expire
//! `ttl` after insertion; a zero TTL disables caching for that instance.

use std::fmt;
use std::hash::Hash;
use std::time::Duration;

use moka::sync::Cache;
use tracing::debug;

/// Upper bound on live entries per instance.
pub const DEFAULT_MAX_ENTRIES: u64 = 10_000;

/// Concurrency-safe cache with a fixed time-to-live.
pub struct TtlCache<K, V> {
    name: &'static str,
    ttl: Duration,
    cache: Cache<K, V>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// `name` only labels log events.
    pub fn new(name: &'static str, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(DEFAULT_MAX_ENTRIES)
            .time_to_live(ttl)
            .build();
        Self { name, ttl, cache }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Return the cached value for `key` if present and fresh.
    pub fn get(&self, key: &K) -> Option<V> {
        let hit = self.cache.get(key);
        if hit.is_some() {
            debug!(cache = self.name, "cache hit");
        }
        hit
    }

    /// `true` only if an entry exists for `key` and is still fresh.
    pub fn is_valid(&self, key: &K) -> bool {
        self.cache.contains_key(key)
    }

    /// Insert or replace the entry for `key`. No-op when the TTL is zero.
    pub fn insert(&self, key: K, value: V) {
        if self.ttl.is_zero() {
            return;
        }
        self.cache.insert(key, value);
    }

    /// Drop every entry. Counts reflect the removal once this returns.
    pub fn invalidate(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks();
        debug!(cache = self.name, "cache invalidated");
    }

    /// Number of live entries after pending maintenance has run.
    pub fn len(&self) -> usize {
        self.cache.run_pending_tasks();
        usize::try_from(self.cache.entry_count()).unwrap_or(usize::MAX)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> fmt::Debug for TtlCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TtlCache")
            .field("name", &self.name)
            .field("ttl", &self.ttl)
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}
