//! Bounded LRU cache of resolved avatar images, with fetch coalescing.
//!
//! Entries are keyed by asset URL, so every `(avatar, key, tier)` triple
//! that resolves to the same URL shares one entry. Recency is tracked with
//! a monotonically increasing tick per access; the smallest tick is the
//! least recently used entry.
//!
//! Fetches that are still outstanding live in a separate in-flight table.
//! Concurrent [`FrameCache::get_or_fetch`] calls for the same URL join the
//! one outstanding fetch instead of starting another.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio_util::sync::CancellationToken;

use crate::error::{DeliveryError, Result};
use crate::types::AssetHandle;

type SharedFetch = Shared<BoxFuture<'static, Result<AssetHandle>>>;

#[derive(Debug, Default)]
struct LruState {
    entries: HashMap<String, (AssetHandle, u64)>,
    recency: BTreeMap<u64, String>,
    tick: u64,
}

impl LruState {
    fn touch(&mut self, key: &str) -> Option<AssetHandle> {
        self.tick += 1;
        let tick = self.tick;
        let (handle, last) = self.entries.get_mut(key)?;
        self.recency.remove(last);
        *last = tick;
        self.recency.insert(tick, key.to_owned());
        Some(handle.clone())
    }

    fn insert(&mut self, key: String, handle: AssetHandle) {
        self.tick += 1;
        let tick = self.tick;
        if let Some((_, old)) = self.entries.insert(key.clone(), (handle, tick)) {
            self.recency.remove(&old);
        }
        self.recency.insert(tick, key);
    }

    fn evict_lru(&mut self) -> Option<String> {
        let (_, key) = self.recency.pop_first()?;
        self.entries.remove(&key);
        Some(key)
    }
}

struct InFlight {
    id: u64,
    fetch: SharedFetch,
    cancel: CancellationToken,
}

/// Hit and miss counters since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

/// Thread-safe LRU frame cache. Cloning shares the same storage.
#[derive(Clone)]
pub struct FrameCache {
    capacity: usize,
    lru: Arc<Mutex<LruState>>,
    in_flight: Arc<Mutex<HashMap<String, InFlight>>>,
    next_fetch_id: Arc<AtomicU64>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
    evictions: Arc<AtomicU64>,
}

impl std::fmt::Debug for FrameCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCache")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FrameCache {
    /// Create a cache holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            lru: Arc::new(Mutex::new(LruState::default())),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_fetch_id: Arc::new(AtomicU64::new(0)),
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            evictions: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        lock(&self.lru).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up `key`. A hit refreshes its recency; a miss allocates nothing.
    pub fn get(&self, key: &str) -> Option<AssetHandle> {
        let hit = lock(&self.lru).touch(key);
        let counter = if hit.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        hit
    }

    /// Whether `key` is cached, without touching its recency.
    pub fn contains(&self, key: &str) -> bool {
        lock(&self.lru).entries.contains_key(key)
    }

    /// Insert or replace `key`, then evict down to capacity.
    pub fn put(&self, key: impl Into<String>, handle: AssetHandle) {
        let mut state = lock(&self.lru);
        state.insert(key.into(), handle);
        self.shrink(&mut state);
    }

    /// Evict least recently used entries until the cache is within
    /// capacity. Returns the evicted keys.
    pub fn evict_if_needed(&self) -> Vec<String> {
        self.shrink(&mut lock(&self.lru))
    }

    fn shrink(&self, state: &mut LruState) -> Vec<String> {
        let mut evicted = Vec::new();
        while state.entries.len() > self.capacity {
            match state.evict_lru() {
                Some(key) => evicted.push(key),
                None => break,
            }
        }
        if !evicted.is_empty() {
            self.evictions
                .fetch_add(evicted.len() as u64, Ordering::Relaxed);
            tracing::trace!(count = evicted.len(), "evicted frames");
        }
        evicted
    }

    /// Drop every cached entry. In-flight fetches are left alone.
    pub fn clear(&self) {
        let mut state = lock(&self.lru);
        state.entries.clear();
        state.recency.clear();
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        lock(&self.in_flight).contains_key(key)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    /// Return the cached handle for `key`, or run `fetch` to produce it.
    ///
    /// Concurrent callers for the same key share one fetch. A successful
    /// result is written to the cache unless `cancel` fired first, so a
    /// cancelled session never leaves stale entries behind. An outstanding
    /// fetch whose own session was cancelled is replaced rather than joined.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &str,
        cancel: &CancellationToken,
        fetch: F,
    ) -> Result<AssetHandle>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<AssetHandle>> + Send + 'static,
    {
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }

        let shared = {
            let mut in_flight = lock(&self.in_flight);
            let joinable = in_flight
                .get(key)
                .filter(|f| !f.cancel.is_cancelled())
                .map(|f| f.fetch.clone());
            match joinable {
                Some(shared) => shared,
                None => {
                    let id = self.next_fetch_id.fetch_add(1, Ordering::Relaxed);
                    let shared = self.shared_fetch(id, key.to_owned(), cancel.clone(), fetch());
                    in_flight.insert(
                        key.to_owned(),
                        InFlight {
                            id,
                            fetch: shared.clone(),
                            cancel: cancel.clone(),
                        },
                    );
                    shared
                }
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(DeliveryError::Cancelled),
            result = shared => result,
        }
    }

    fn shared_fetch<Fut>(
        &self,
        id: u64,
        key: String,
        cancel: CancellationToken,
        fut: Fut,
    ) -> SharedFetch
    where
        Fut: Future<Output = Result<AssetHandle>> + Send + 'static,
    {
        let cache = self.clone();
        async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(DeliveryError::Cancelled),
                result = fut => result,
            };
            {
                let mut in_flight = lock(&cache.in_flight);
                if in_flight.get(&key).is_some_and(|f| f.id == id) {
                    in_flight.remove(&key);
                }
            }
            if let Ok(handle) = &result {
                if !cancel.is_cancelled() && handle.is_loaded() {
                    cache.put(key, handle.clone());
                }
            }
            result
        }
        .boxed()
        .shared()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeliveryTier;
    use bytes::Bytes;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn handle(url: &str) -> AssetHandle {
        AssetHandle::loaded(url, DeliveryTier::Visemes, Bytes::from_static(b"png"))
    }

    #[test]
    fn miss_returns_none_and_allocates_nothing() {
        let cache = FrameCache::new(4);
        assert!(cache.get("a").is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn put_then_get_hits() {
        let cache = FrameCache::new(4);
        cache.put("a", handle("a"));
        assert_eq!(cache.get("a").unwrap().url, "a");
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn overflow_evicts_exactly_the_lru() {
        let cache = FrameCache::new(3);
        for k in ["a", "b", "c"] {
            cache.put(k, handle(k));
        }
        cache.put("d", handle("d"));
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains("a"));
        for k in ["b", "c", "d"] {
            assert!(cache.contains(k));
        }
    }

    #[test]
    fn get_protects_entry_from_eviction() {
        let cache = FrameCache::new(3);
        for k in ["a", "b", "c"] {
            cache.put(k, handle(k));
        }
        assert!(cache.get("a").is_some());
        cache.put("d", handle("d"));
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
    }

    #[test]
    fn replacing_an_entry_does_not_grow_the_cache() {
        let cache = FrameCache::new(2);
        cache.put("a", handle("a"));
        cache.put("a", handle("a"));
        cache.put("b", handle("b"));
        assert_eq!(cache.len(), 2);
        assert!(cache.evict_if_needed().is_empty());
    }

    #[test]
    fn concurrent_readers_never_see_more_than_capacity() {
        let cache = FrameCache::new(4);
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..500 {
                        let key = format!("{w}-{i}");
                        cache.put(key.clone(), handle(&key));
                    }
                })
            })
            .collect();
        let reader = {
            let cache = cache.clone();
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                let mut peak = 0;
                while !done.load(Ordering::Relaxed) {
                    peak = peak.max(cache.len()).max(cache.stats().entries);
                }
                peak
            })
        };
        for w in writers {
            w.join().unwrap();
        }
        done.store(true, Ordering::Relaxed);
        assert!(reader.join().unwrap() <= 4);
        assert_eq!(cache.len(), 4);
        assert_eq!(cache.stats().evictions, 2000 - 4);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let cache = FrameCache::new(0);
        cache.put("a", handle("a"));
        assert_eq!(cache.capacity(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn contains_does_not_refresh_recency() {
        let cache = FrameCache::new(2);
        cache.put("a", handle("a"));
        cache.put("b", handle("b"));
        assert!(cache.contains("a"));
        cache.put("c", handle("c"));
        assert!(!cache.contains("a"));
    }

    #[tokio::test]
    async fn concurrent_fetches_are_coalesced() {
        let cache = FrameCache::new(8);
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let fetch = |calls: Arc<AtomicU32>| {
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok(handle("u"))
            }
        };

        let (a, b, c) = tokio::join!(
            cache.get_or_fetch("u", &cancel, fetch(Arc::clone(&calls))),
            cache.get_or_fetch("u", &cancel, fetch(Arc::clone(&calls))),
            cache.get_or_fetch("u", &cancel, fetch(Arc::clone(&calls))),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.contains("u"));
        assert!(!cache.is_in_flight("u"));
    }

    #[tokio::test]
    async fn failed_fetch_is_not_cached() {
        let cache = FrameCache::new(8);
        let cancel = CancellationToken::new();
        let err = cache
            .get_or_fetch("x", &cancel, || async {
                Err(DeliveryError::NotFound("x".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::NotFound(_)));
        assert!(!cache.contains("x"));
        assert!(!cache.is_in_flight("x"));
    }

    #[tokio::test]
    async fn cancelled_fetch_never_writes_the_cache() {
        let cache = FrameCache::new(8);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let result = cache
            .get_or_fetch("slow", &cancel, || async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(handle("slow"))
            })
            .await;
        assert!(matches!(result, Err(DeliveryError::Cancelled)));
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!cache.contains("slow"));
    }

    #[tokio::test]
    async fn new_session_replaces_a_cancelled_in_flight_fetch() {
        let cache = FrameCache::new(8);
        let old = CancellationToken::new();
        let stale = cache.clone();
        let old_clone = old.clone();
        let pending = tokio::spawn(async move {
            stale
                .get_or_fetch("k", &old_clone, || async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(handle("old"))
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        old.cancel();

        let fresh = CancellationToken::new();
        let got = cache
            .get_or_fetch("k", &fresh, || async { Ok(handle("new")) })
            .await
            .unwrap();
        assert_eq!(got.url, "new");
        assert!(pending.await.unwrap().is_err());
    }
}
