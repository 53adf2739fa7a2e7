//! Content-addressed cache with single-flight computation.
//!
//! Two tiers sit behind one [`CacheKey`]:
//!
//! - **memory**: a bounded LRU of decoded values.
//! - **disk**: one JSON file per key under `<dir>/<key[..2]>/<key>.json`,
//!   written atomically, unbounded, surviving restarts. Eviction from memory
//!   never touches it.
//!
//! [`ContentCache::compute_or_get`] guarantees that concurrent requests for the
//! same absent key run the computation once. The first caller becomes the
//! leader and registers a pending slot; later callers wait on it. The slot is
//! released by a drop guard, so a leader that is cancelled mid-computation
//! leaves the key absent rather than stuck pending, and its waiters retry.
//! Failed computations are handed to the waiters of that flight but never
//! stored.

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{BackendError, CacheError};
use crate::fingerprint::{CacheKey, FINGERPRINT_VERSION, canonical_json, sha256_hex};
use crate::persistence;
use crate::types::Generation;

/// The cache the execution engine threads generations through.
pub type GenerationCache = ContentCache<Generation, BackendError>;

/// Where a returned value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    Memory,
    Disk,
    /// Computed by this caller.
    Computed,
    /// Computed by a concurrent caller this one waited on.
    Shared,
}

impl CacheSource {
    /// Whether the backend was *not* invoked on behalf of this caller.
    pub fn is_hit(self) -> bool {
        !matches!(self, Self::Computed)
    }
}

/// A value together with the tier that served it.
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<V> {
    pub value: V,
    pub source: CacheSource,
}

/// Observable state of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Absent,
    Pending,
    Done,
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub misses: u64,
    pub computations: u64,
    pub shared: u64,
    pub corruptions: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let hits = self.memory_hits + self.disk_hits + self.shared;
        let total = hits + self.computations;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct Counters {
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    misses: AtomicU64,
    computations: AtomicU64,
    shared: AtomicU64,
    corruptions: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// On-disk record of one entry.
#[derive(Debug, Serialize, Deserialize)]
struct DiskEntry<T> {
    key: String,
    fingerprint_version: u32,
    /// SHA-256 of the canonical JSON of `value`.
    checksum: String,
    updated_at: DateTime<Utc>,
    value: T,
}

type Slot<V, E> = Option<Result<V, E>>;

enum Acquired<V, E> {
    Ready(Cached<V>),
    Failed(E),
    Lead(watch::Sender<Slot<V, E>>),
}

/// Removes the pending slot when the leader finishes or is dropped.
struct FlightGuard<'a, V, E> {
    inflight: &'a Mutex<HashMap<CacheKey, watch::Receiver<Slot<V, E>>>>,
    key: &'a CacheKey,
}

impl<V, E> Drop for FlightGuard<'_, V, E> {
    fn drop(&mut self) {
        lock(self.inflight).remove(self.key);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Two-tier content-addressed cache.
pub struct ContentCache<V, E> {
    memory: Mutex<LruCache<CacheKey, V>>,
    dir: Option<PathBuf>,
    inflight: Mutex<HashMap<CacheKey, watch::Receiver<Slot<V, E>>>>,
    counters: Counters,
}

impl<V, E> ContentCache<V, E>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    E: Clone + std::fmt::Display + Send + Sync + 'static,
{
    /// A cache with a persistent tier rooted at `dir`.
    pub fn new(memory_capacity: usize, dir: impl Into<PathBuf>) -> Self {
        Self::build(memory_capacity, Some(dir.into()))
    }

    /// A cache without a persistent tier.
    pub fn in_memory(memory_capacity: usize) -> Self {
        Self::build(memory_capacity, None)
    }

    fn build(memory_capacity: usize, dir: Option<PathBuf>) -> Self {
        let capacity = NonZeroUsize::new(memory_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            memory: Mutex::new(LruCache::new(capacity)),
            dir,
            inflight: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Look a key up in memory, then on disk (promoting a disk hit).
    pub fn get(&self, key: &CacheKey) -> Option<Cached<V>> {
        let hit = self.lookup(key);
        if hit.is_none() {
            Counters::bump(&self.counters.misses);
        }
        hit
    }

    fn lookup(&self, key: &CacheKey) -> Option<Cached<V>> {
        if let Some(value) = lock(&self.memory).get(key).cloned() {
            Counters::bump(&self.counters.memory_hits);
            return Some(Cached {
                value,
                source: CacheSource::Memory,
            });
        }
        if let Some(value) = self.read_disk(key) {
            Counters::bump(&self.counters.disk_hits);
            lock(&self.memory).put(key.clone(), value.clone());
            return Some(Cached {
                value,
                source: CacheSource::Disk,
            });
        }
        None
    }

    /// Store a completed value in both tiers.
    ///
    /// A failed disk write is logged and leaves the memory tier populated.
    pub fn insert(&self, key: &CacheKey, value: V) {
        if let Err(e) = self.write_disk(key, &value) {
            warn!(key = %key, error = %e, "Failed to persist cache entry");
        }
        lock(&self.memory).put(key.clone(), value);
    }

    pub fn status(&self, key: &CacheKey) -> EntryStatus {
        if lock(&self.inflight).contains_key(key) {
            return EntryStatus::Pending;
        }
        if lock(&self.memory).contains(key) {
            return EntryStatus::Done;
        }
        match self.entry_path(key) {
            Some(path) if path.exists() => EntryStatus::Done,
            _ => EntryStatus::Absent,
        }
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            memory_hits: c.memory_hits.load(Ordering::Relaxed),
            disk_hits: c.disk_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            computations: c.computations.load(Ordering::Relaxed),
            shared: c.shared.load(Ordering::Relaxed),
            corruptions: c.corruptions.load(Ordering::Relaxed),
        }
    }

    /// Return the cached value for `key`, computing it at most once across
    /// concurrent callers.
    pub async fn compute_or_get<F, Fut>(&self, key: &CacheKey, compute: F) -> Result<Cached<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let tx = match self.acquire(key).await {
            Acquired::Ready(hit) => return Ok(hit),
            Acquired::Failed(e) => return Err(e),
            Acquired::Lead(tx) => tx,
        };
        let _guard = FlightGuard {
            inflight: &self.inflight,
            key,
        };

        Counters::bump(&self.counters.computations);
        match compute().await {
            Ok(value) => {
                self.insert(key, value.clone());
                tx.send_replace(Some(Ok(value.clone())));
                Ok(Cached {
                    value,
                    source: CacheSource::Computed,
                })
            }
            Err(e) => {
                debug!(key = %key, error = %e, "Computation failed; entry left absent");
                tx.send_replace(Some(Err(e.clone())));
                Err(e)
            }
        }
    }

    /// Resolve `key` to a value, an error shared from a concurrent flight, or
    /// leadership of a new flight.
    async fn acquire(&self, key: &CacheKey) -> Acquired<V, E> {
        loop {
            if let Some(hit) = self.get(key) {
                return Acquired::Ready(hit);
            }

            let mut rx = {
                let mut inflight = lock(&self.inflight);
                match inflight.get(key) {
                    Some(rx) => rx.clone(),
                    None => {
                        // A leader stores its value before releasing the slot,
                        // so an empty slot after a miss may still mean "just
                        // finished". The memory copy may already be evicted,
                        // so re-check both tiers under the lock.
                        if let Some(hit) = self.lookup(key) {
                            return Acquired::Ready(hit);
                        }
                        let (tx, rx) = watch::channel(None);
                        inflight.insert(key.clone(), rx);
                        return Acquired::Lead(tx);
                    }
                }
            };

            loop {
                let resolved = rx.borrow_and_update().clone();
                if let Some(outcome) = resolved {
                    Counters::bump(&self.counters.shared);
                    return match outcome {
                        Ok(value) => Acquired::Ready(Cached {
                            value,
                            source: CacheSource::Shared,
                        }),
                        Err(e) => Acquired::Failed(e),
                    };
                }
                if rx.changed().await.is_err() {
                    // Leader dropped without a result (cancelled). Start over.
                    debug!(key = %key, "In-flight computation abandoned; retrying");
                    break;
                }
            }
        }
    }

    fn entry_path(&self, key: &CacheKey) -> Option<PathBuf> {
        let dir = self.dir.as_ref()?;
        let hex = key.as_str();
        let prefix = hex.get(..2).unwrap_or("__");
        Some(dir.join(prefix).join(format!("{hex}.json")))
    }

    fn write_disk(&self, key: &CacheKey, value: &V) -> Result<(), CacheError> {
        let Some(path) = self.entry_path(key) else {
            return Ok(());
        };
        let json = serde_json::to_value(value)?;
        let entry = DiskEntry {
            key: key.as_str().to_string(),
            fingerprint_version: FINGERPRINT_VERSION,
            checksum: sha256_hex(canonical_json(&json).as_bytes()),
            updated_at: Utc::now(),
            value: json,
        };
        persistence::atomic_write_json(&path, &entry)?;
        Ok(())
    }

    fn read_disk(&self, key: &CacheKey) -> Option<V> {
        let path = self.entry_path(key)?;
        match self.try_read_disk(key, &path) {
            Ok(value) => value,
            Err(e) => {
                Counters::bump(&self.counters.corruptions);
                warn!(key = %key, path = %path.display(), error = %e, "Ignoring unreadable cache entry");
                None
            }
        }
    }

    fn try_read_disk(&self, key: &CacheKey, path: &Path) -> Result<Option<V>, CacheError> {
        let corrupt = |reason: String| CacheError::Corruption {
            key: key.to_string(),
            reason,
        };
        let entry: DiskEntry<serde_json::Value> = match persistence::load_json(path) {
            Ok(Some(entry)) => entry,
            Ok(None) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                return Err(corrupt(format!("unparseable entry: {e}")));
            }
            Err(e) => return Err(e.into()),
        };
        if entry.key != key.as_str() {
            return Err(corrupt(format!("entry is for key {}", entry.key)));
        }
        if entry.fingerprint_version != FINGERPRINT_VERSION {
            return Err(corrupt(format!(
                "fingerprint version {} != {FINGERPRINT_VERSION}",
                entry.fingerprint_version
            )));
        }
        if sha256_hex(canonical_json(&entry.value).as_bytes()) != entry.checksum {
            return Err(corrupt("checksum mismatch".to_string()));
        }
        let value = serde_json::from_value(entry.value)?;
        Ok(Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;
    use tempfile::TempDir;

    type TestCache = ContentCache<String, String>;

    fn key(n: u32) -> CacheKey {
        CacheKey::from_hex(sha256_hex(format!("key-{n}").as_bytes()))
    }

    #[test]
    fn test_get_absent_then_insert() {
        let cache = TestCache::in_memory(8);
        assert!(cache.get(&key(1)).is_none());
        assert_eq!(cache.status(&key(1)), EntryStatus::Absent);

        cache.insert(&key(1), "one".into());
        let hit = cache.get(&key(1)).unwrap();
        assert_eq!(hit.value, "one");
        assert_eq!(hit.source, CacheSource::Memory);
        assert_eq!(cache.status(&key(1)), EntryStatus::Done);
    }

    #[test]
    fn test_disk_tier_survives_restart_and_promotes() {
        let dir = TempDir::new().unwrap();
        TestCache::new(8, dir.path()).insert(&key(1), "persisted".into());

        let reopened = TestCache::new(8, dir.path());
        let first = reopened.get(&key(1)).unwrap();
        assert_eq!(first.source, CacheSource::Disk);
        assert_eq!(first.value, "persisted");
        assert_eq!(reopened.get(&key(1)).unwrap().source, CacheSource::Memory);
    }

    #[test]
    fn test_eviction_keeps_disk_entry() {
        let dir = TempDir::new().unwrap();
        let cache = TestCache::new(1, dir.path());
        cache.insert(&key(1), "a".into());
        cache.insert(&key(2), "b".into());

        let hit = cache.get(&key(1)).unwrap();
        assert_eq!(hit.source, CacheSource::Disk);
        assert_eq!(hit.value, "a");
    }

    #[test]
    fn test_corrupt_entry_treated_as_absent() {
        let dir = TempDir::new().unwrap();
        let cache = TestCache::new(8, dir.path());
        cache.insert(&key(1), "good".into());
        let path = cache.entry_path(&key(1)).unwrap();

        let reopened = TestCache::new(8, dir.path());
        std::fs::write(&path, "{\"key\": tru").unwrap();
        assert!(reopened.get(&key(1)).is_none());
        assert_eq!(reopened.stats().corruptions, 1);
    }

    #[test]
    fn test_tampered_value_fails_checksum() {
        let dir = TempDir::new().unwrap();
        let cache = TestCache::new(8, dir.path());
        cache.insert(&key(1), "good".into());
        let path = cache.entry_path(&key(1)).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, text.replace("\"good\"", "\"evil\"")).unwrap();

        let reopened = TestCache::new(8, dir.path());
        assert!(reopened.get(&key(1)).is_none());
        assert_eq!(reopened.stats().corruptions, 1);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_recomputed() {
        let dir = TempDir::new().unwrap();
        let cache = TestCache::new(8, dir.path());
        cache.insert(&key(1), "stale".into());
        std::fs::write(cache.entry_path(&key(1)).unwrap(), "garbage").unwrap();

        let reopened = TestCache::new(8, dir.path());
        let got = reopened
            .compute_or_get(&key(1), || async { Ok("fresh".to_string()) })
            .await
            .unwrap();
        assert_eq!(got.source, CacheSource::Computed);
        assert_eq!(got.value, "fresh");
        assert_eq!(TestCache::new(8, dir.path()).get(&key(1)).unwrap().value, "fresh");
    }

    #[tokio::test]
    async fn test_single_flight_computes_once() {
        let cache = Arc::new(TestCache::in_memory(8));
        let calls = Arc::new(AtomicU32::new(0));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    cache
                        .compute_or_get(&key(7), || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok("value".to_string())
                        })
                        .await
                })
            })
            .collect();

        let results = futures::future::join_all(tasks).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for r in results {
            assert_eq!(r.unwrap().unwrap().value, "value");
        }
        let stats = cache.stats();
        assert_eq!(stats.computations, 1);
    }

    #[tokio::test]
    async fn test_evicted_entry_served_from_disk_without_recompute() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(TestCache::new(1, dir.path()));
        cache
            .compute_or_get(&key(1), || async { Ok("first".to_string()) })
            .await
            .unwrap();
        // Capacity 1: computing key 2 evicts key 1 from memory.
        cache
            .compute_or_get(&key(2), || async { Ok("second".to_string()) })
            .await
            .unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    cache
                        .compute_or_get(&key(1), || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok("recomputed".to_string())
                        })
                        .await
                })
            })
            .collect();
        for r in futures::future::join_all(tasks).await {
            assert_eq!(r.unwrap().unwrap().value, "first");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(cache.stats().computations, 2);
        assert!(cache.stats().disk_hits >= 1);
    }

    #[tokio::test]
    async fn test_failure_not_cached() {
        let cache = TestCache::in_memory(8);
        let err = cache
            .compute_or_get(&key(1), || async { Err("rate limited".to_string()) })
            .await
            .unwrap_err();
        assert_eq!(err, "rate limited");
        assert_eq!(cache.status(&key(1)), EntryStatus::Absent);

        let ok = cache
            .compute_or_get(&key(1), || async { Ok("second try".to_string()) })
            .await
            .unwrap();
        assert_eq!(ok.value, "second try");
    }

    #[tokio::test]
    async fn test_waiters_share_failure() {
        let cache = Arc::new(TestCache::in_memory(8));
        let calls = Arc::new(AtomicU32::new(0));
        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    cache
                        .compute_or_get(&key(3), || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(30)).await;
                            Err::<String, _>("boom".to_string())
                        })
                        .await
                })
            })
            .collect();
        for r in futures::future::join_all(tasks).await {
            assert_eq!(r.unwrap().unwrap_err(), "boom");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_leader_releases_pending() {
        let cache = Arc::new(TestCache::in_memory(8));
        let leader = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .compute_or_get(&key(9), || async {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok("never".to_string())
                    })
                    .await
            })
        };
        while cache.status(&key(9)) != EntryStatus::Pending {
            tokio::task::yield_now().await;
        }

        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .compute_or_get(&key(9), || async { Ok("recovered".to_string()) })
                    .await
            })
        };
        tokio::task::yield_now().await;

        leader.abort();
        assert!(leader.await.unwrap_err().is_cancelled());

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.value, "recovered");
        assert_eq!(got.source, CacheSource::Computed);
        assert_eq!(cache.status(&key(9)), EntryStatus::Done);
    }

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats {
            memory_hits: 3,
            disk_hits: 1,
            computations: 4,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }
}
