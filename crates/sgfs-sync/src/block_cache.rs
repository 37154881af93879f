//! Bounded, TTL-limited cache of byte ranges read from the backend.
//!
//! Entries are keyed by `(path, offset, length)`. Lookups never refresh an
//! entry's position, so capacity eviction drops the oldest insertion first.
//! Concurrent misses on one key share a single load.

use lru::LruCache;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{Result, SyncError};

/// Configuration for the block cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockCacheConfig {
    /// Maximum number of resident entries.
    pub capacity: usize,
    /// Lifetime of an entry in seconds.
    pub ttl_secs: u64,
}

impl Default for BlockCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 300,
            ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BlockKey {
    path: String,
    offset: u64,
    length: u64,
}

struct CacheEntry {
    data: Vec<u8>,
    inserted_at: Instant,
    last_touch: Instant,
}

impl CacheEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.inserted_at.elapsed() >= ttl
    }
}

/// Counters describing cache behaviour.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockCacheStats {
    /// Lookups served from the cache.
    pub hits: u64,
    /// Lookups that invoked the loader.
    pub misses: u64,
    /// Entries dropped to stay within capacity.
    pub evictions: u64,
    /// Entries dropped because their TTL ran out.
    pub expirations: u64,
    /// Entries dropped by explicit invalidation.
    pub invalidations: u64,
    /// Lookups that waited for another caller's load of the same key.
    pub coalesced: u64,
}

/// A load in progress; followers wait on it for the leader's outcome.
#[derive(Default)]
struct Flight {
    outcome: Mutex<Option<std::result::Result<Vec<u8>, String>>>,
    done: Condvar,
}

impl Flight {
    fn finish(&self, outcome: std::result::Result<Vec<u8>, String>) {
        *self.outcome.lock() = Some(outcome);
        self.done.notify_all();
    }

    fn wait(&self) -> std::result::Result<Vec<u8>, String> {
        let mut outcome = self.outcome.lock();
        loop {
            if let Some(outcome) = outcome.as_ref() {
                return outcome.clone();
            }
            self.done.wait(&mut outcome);
        }
    }
}

/// Leader's handle on its flight. Publishes the outcome exactly once, even
/// if the loader panics.
struct Leader<'a> {
    cache: &'a BlockCache,
    key: BlockKey,
    flight: Arc<Flight>,
    finished: bool,
}

impl Leader<'_> {
    fn finish(mut self, result: &Result<Vec<u8>>) {
        {
            let mut inner = self.cache.inner.lock();
            // An invalidation removes the flight, so its bytes may be stale.
            let current = self.cache.take_flight(&mut inner, &self.key, &self.flight);
            match result {
                Ok(data) if current => self.cache.store(&mut inner, self.key.clone(), data.clone()),
                Ok(_) => debug!(path = %self.key.path, offset = self.key.offset, "invalidated during load, not caching"),
                Err(_) => {}
            }
        }
        self.flight
            .finish(result.as_ref().map(|d| d.clone()).map_err(|e| e.to_string()));
        self.finished = true;
    }
}

impl Drop for Leader<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        {
            let mut inner = self.cache.inner.lock();
            self.cache.take_flight(&mut inner, &self.key, &self.flight);
        }
        self.flight.finish(Err("loader panicked".to_string()));
    }
}

enum Slot {
    Lead(Arc<Flight>),
    Follow(Arc<Flight>),
}

struct Inner {
    entries: LruCache<BlockKey, CacheEntry>,
    stats: BlockCacheStats,
    loading: HashMap<BlockKey, Arc<Flight>>,
}

/// Shared byte-range cache. All methods take `&self`.
pub struct BlockCache {
    inner: Mutex<Inner>,
    capacity: usize,
    ttl: Duration,
}

impl BlockCache {
    /// Creates an empty cache. A zero capacity is treated as one.
    pub fn new(config: BlockCacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        debug!(
            capacity = capacity.get(),
            ttl_secs = config.ttl_secs,
            "created block cache"
        );
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                stats: BlockCacheStats::default(),
                loading: HashMap::new(),
            }),
            capacity: capacity.get(),
            ttl: Duration::from_secs(config.ttl_secs),
        }
    }

    /// Returns the cached bytes for the range, or loads and caches them.
    ///
    /// The loader is called without holding the cache lock. Callers that
    /// miss while another caller is loading the same key wait for that load
    /// instead of calling their own loader. Loader errors are returned
    /// unchanged to the loading caller (as `RemoteIo` to waiters) and nothing
    /// is cached for the key. A load that overlaps an invalidation of its
    /// path is returned but not stored.
    pub fn get_or_load<F>(&self, path: &str, offset: u64, length: u64, loader: F) -> Result<Vec<u8>>
    where
        F: FnOnce(&str, u64, u64) -> Result<Vec<u8>>,
    {
        let key = BlockKey {
            path: path.to_string(),
            offset,
            length,
        };

        let slot = {
            let mut inner = self.inner.lock();
            if let Some(data) = self.lookup(&mut inner, &key) {
                inner.stats.hits += 1;
                return Ok(data);
            }
            match inner.loading.get(&key).cloned() {
                Some(flight) => {
                    inner.stats.coalesced += 1;
                    Slot::Follow(flight)
                }
                None => {
                    inner.stats.misses += 1;
                    let flight = Arc::new(Flight::default());
                    inner.loading.insert(key.clone(), flight.clone());
                    Slot::Lead(flight)
                }
            }
        };

        match slot {
            Slot::Follow(flight) => flight.wait().map_err(|reason| SyncError::remote_io(path, reason)),
            Slot::Lead(flight) => {
                let leader = Leader {
                    cache: self,
                    key,
                    flight,
                    finished: false,
                };
                let result = loader(path, offset, length);
                leader.finish(&result);
                result
            }
        }
    }

    /// Removes `flight` from the in-flight table if it is still registered
    /// for `key`. Returns whether it was.
    fn take_flight(&self, inner: &mut Inner, key: &BlockKey, flight: &Arc<Flight>) -> bool {
        let current = matches!(inner.loading.get(key), Some(f) if Arc::ptr_eq(f, flight));
        if current {
            inner.loading.remove(key);
        }
        current
    }

    fn lookup(&self, inner: &mut Inner, key: &BlockKey) -> Option<Vec<u8>> {
        let expired = match inner.entries.peek_mut(key) {
            Some(entry) if !entry.is_expired(self.ttl) => {
                entry.last_touch = Instant::now();
                return Some(entry.data.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            inner.entries.pop(key);
            inner.stats.expirations += 1;
        }
        None
    }

    fn store(&self, inner: &mut Inner, key: BlockKey, data: Vec<u8>) {
        self.purge_expired(inner);
        while inner.entries.len() >= self.capacity && !inner.entries.contains(&key) {
            match inner.entries.pop_lru() {
                Some((evicted, _)) => {
                    debug!(path = %evicted.path, offset = evicted.offset, "evicted block");
                    inner.stats.evictions += 1;
                }
                None => break,
            }
        }
        let now = Instant::now();
        inner.entries.push(
            key,
            CacheEntry {
                data,
                inserted_at: now,
                last_touch: now,
            },
        );
    }

    fn purge_expired(&self, inner: &mut Inner) {
        // Insertion order is age order, so expired entries sit at the tail.
        while let Some((_, entry)) = inner.entries.peek_lru() {
            if !entry.is_expired(self.ttl) {
                break;
            }
            inner.entries.pop_lru();
            inner.stats.expirations += 1;
        }
    }

    /// Drops every cached range of `path` and of anything beneath it.
    pub fn invalidate_prefix(&self, path: &str) -> usize {
        let dir_prefix = format!("{}/", path.trim_end_matches('/'));
        let mut inner = self.inner.lock();
        // Loads in flight for these paths finish without being stored, and
        // later misses start fresh loads.
        inner
            .loading
            .retain(|k, _| !(k.path == path || k.path.starts_with(&dir_prefix)));

        let doomed: Vec<BlockKey> = inner
            .entries
            .iter()
            .filter(|(k, _)| k.path == path || k.path.starts_with(&dir_prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            inner.entries.pop(key);
        }
        inner.stats.invalidations += doomed.len() as u64;

        if !doomed.is_empty() {
            debug!(path, removed = doomed.len(), "invalidated cached blocks");
        }
        doomed.len()
    }

    /// Seconds since the range was last served or stored, if it is resident.
    pub fn idle_secs(&self, path: &str, offset: u64, length: u64) -> Option<u64> {
        let key = BlockKey {
            path: path.to_string(),
            offset,
            length,
        };
        let inner = self.inner.lock();
        inner.entries.peek(&key).map(|e| e.last_touch.elapsed().as_secs())
    }

    /// Whether a range is resident and unexpired. Does not count as a lookup.
    pub fn contains(&self, path: &str, offset: u64, length: u64) -> bool {
        let key = BlockKey {
            path: path.to_string(),
            offset,
            length,
        };
        let inner = self.inner.lock();
        inner
            .entries
            .peek(&key)
            .map(|e| !e.is_expired(self.ttl))
            .unwrap_or(false)
    }

    /// Number of resident entries, expired ones included until touched.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether no entries are resident.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> BlockCacheStats {
        self.inner.lock().stats.clone()
    }

    /// Drops every entry.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.loading.clear();
        inner.entries.clear();
    }
}

impl Default for BlockCache {
    fn default() -> Self {
        Self::new(BlockCacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;

    fn make_cache(capacity: usize, ttl_secs: u64) -> BlockCache {
        BlockCache::new(BlockCacheConfig { capacity, ttl_secs })
    }

    fn bytes_for(path: &str, offset: u64, length: u64) -> Vec<u8> {
        format!("{}:{}:{}", path, offset, length).into_bytes()
    }

    fn load(path: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        Ok(bytes_for(path, offset, length))
    }

    #[test]
    fn test_miss_then_hit_calls_loader_once() {
        let cache = make_cache(10, 60);
        let calls = Cell::new(0);
        let loader = |p: &str, o: u64, l: u64| -> Result<Vec<u8>> {
            calls.set(calls.get() + 1);
            load(p, o, l)
        };

        let first = cache.get_or_load("/a", 0, 4, loader).unwrap();
        let second = cache.get_or_load("/a", 0, 4, loader).unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.get(), 1);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_distinct_ranges_are_distinct_keys() {
        let cache = make_cache(10, 60);
        let a = cache.get_or_load("/a", 0, 4, load).unwrap();
        let b = cache.get_or_load("/a", 4, 4, load).unwrap();
        assert_ne!(a, b);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_loader_error_not_cached() {
        let cache = make_cache(10, 60);
        let result = cache.get_or_load("/x", 0, 5, |p, _, _| Err(SyncError::remote_io(p, "down")));
        assert!(result.is_err());
        assert!(cache.is_empty());
        assert!(!cache.contains("/x", 0, 5));
    }

    #[test]
    fn test_expired_entry_reloaded() {
        let cache = make_cache(10, 0);
        let calls = Cell::new(0);
        let loader = |p: &str, o: u64, l: u64| -> Result<Vec<u8>> {
            calls.set(calls.get() + 1);
            load(p, o, l)
        };

        cache.get_or_load("/a", 0, 1, loader).unwrap();
        cache.get_or_load("/a", 0, 1, loader).unwrap();

        assert_eq!(calls.get(), 2);
        assert!(cache.stats().expirations >= 1);
    }

    #[test]
    fn test_capacity_evicts_oldest_insertion() {
        let cache = make_cache(2, 60);

        cache.get_or_load("/1", 0, 1, load).unwrap();
        cache.get_or_load("/2", 0, 1, load).unwrap();
        // A hit must not protect /1 from eviction.
        cache.get_or_load("/1", 0, 1, load).unwrap();
        cache.get_or_load("/3", 0, 1, load).unwrap();

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains("/1", 0, 1));
        assert!(cache.contains("/2", 0, 1));
        assert!(cache.contains("/3", 0, 1));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_invalidate_prefix_removes_all_ranges_of_path() {
        let cache = make_cache(10, 60);
        cache.get_or_load("/a/b", 0, 4, load).unwrap();
        cache.get_or_load("/a/b", 4, 8, load).unwrap();
        cache.get_or_load("/a/bc", 0, 4, load).unwrap();

        let removed = cache.invalidate_prefix("/a/b");

        assert_eq!(removed, 2);
        assert!(!cache.contains("/a/b", 0, 4));
        assert!(!cache.contains("/a/b", 4, 8));
        assert!(cache.contains("/a/bc", 0, 4));
    }

    #[test]
    fn test_invalidate_directory_removes_children() {
        let cache = make_cache(10, 60);
        cache.get_or_load("/d/x", 0, 1, load).unwrap();
        cache.get_or_load("/d/sub/y", 0, 1, load).unwrap();
        cache.get_or_load("/other", 0, 1, load).unwrap();

        assert_eq!(cache.invalidate_prefix("/d"), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_invalidation_during_load_skips_store() {
        let cache = make_cache(10, 60);
        let data = cache
            .get_or_load("/a", 0, 1, |p, o, l| {
                cache.invalidate_prefix("/a");
                Ok(bytes_for(p, o, l))
            })
            .unwrap();
        assert_eq!(data, bytes_for("/a", 0, 1));
        assert!(!cache.contains("/a", 0, 1));
    }

    #[test]
    fn test_unrelated_invalidation_during_load_still_stores() {
        let cache = make_cache(10, 60);
        cache
            .get_or_load("/a", 0, 1, |p, o, l| {
                cache.invalidate_prefix("/b");
                Ok(bytes_for(p, o, l))
            })
            .unwrap();
        assert!(cache.contains("/a", 0, 1));
    }

    #[test]
    fn test_concurrent_misses_share_one_load() {
        let cache = Arc::new(make_cache(10, 60));
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(4));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                let calls = calls.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    cache.get_or_load("/k", 0, 4, |p, o, l| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(50));
                        load(p, o, l)
                    })
                })
            })
            .collect();

        for reader in readers {
            assert_eq!(reader.join().unwrap().unwrap(), bytes_for("/k", 0, 4));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits + stats.coalesced, 3);
    }

    #[test]
    fn test_waiters_see_leader_failure_and_nothing_cached() {
        let cache = Arc::new(make_cache(10, 60));
        let started = Arc::new(Barrier::new(2));

        let leader = {
            let cache = cache.clone();
            let started = started.clone();
            thread::spawn(move || {
                cache.get_or_load("/k", 0, 4, |p, _, _| {
                    started.wait();
                    thread::sleep(Duration::from_millis(50));
                    Err(SyncError::remote_io(p, "backend down"))
                })
            })
        };

        started.wait();
        let waited = cache.get_or_load("/k", 0, 4, |_, _, _| panic!("loader must not run twice"));

        assert!(leader.join().unwrap().is_err());
        assert_eq!(waited.unwrap_err().kind(), crate::error::ErrorKind::RemoteIo);
        assert!(cache.is_empty());
        assert_eq!(cache.get_or_load("/k", 0, 4, load).unwrap(), bytes_for("/k", 0, 4));
    }

    #[test]
    fn test_panicking_loader_releases_waiters() {
        let cache = make_cache(10, 60);
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = cache.get_or_load("/k", 0, 1, |_, _, _| -> Result<Vec<u8>> { panic!("boom") });
        }));
        assert!(outcome.is_err());
        assert_eq!(cache.get_or_load("/k", 0, 1, load).unwrap(), bytes_for("/k", 0, 1));
    }

    #[test]
    fn test_idle_secs_for_resident_entry() {
        let cache = make_cache(10, 60);
        assert!(cache.idle_secs("/a", 0, 1).is_none());
        cache.get_or_load("/a", 0, 1, load).unwrap();
        assert_eq!(cache.idle_secs("/a", 0, 1), Some(0));
    }

    #[test]
    fn test_default_config_values() {
        let config = BlockCacheConfig::default();
        assert_eq!(config.capacity, 300);
        assert_eq!(config.ttl_secs, 300);
    }
}
