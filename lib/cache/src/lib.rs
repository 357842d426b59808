//! In-memory LRU cache with optional TTL expiry and single-flight loading.
//!
//! The cache keeps a bounded number of entries, evicting the least recently
//! used one on overflow. Entries may carry an expiration time; expired
//! entries are dropped on access or by [`LruCache::run_periodic_cleanup`].
//!
//! [`LruCache::get_or_load`] coalesces concurrent loads for the same missing
//! key: one caller executes the loader, everyone else waits for its outcome.
//! A panicking loader is reported to all waiters as [`LoadError::Panicked`];
//! a loader whose task is dropped mid-flight yields [`LoadError::Abandoned`].
//!
//! Cache usage statistics can be exported through the [`MetricsCollector`]
//! trait; a Prometheus-backed implementation is provided.

mod metrics;
mod single_flight;

pub use metrics::{MetricsCollector, PrometheusMetrics};
pub use single_flight::LoadError;

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::metrics::DisabledMetrics;
use crate::single_flight::Group;

const NIL: usize = usize::MAX;

/// Error returned by the cache constructors on invalid parameters.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("max entries must be greater than 0")]
    InvalidMaxEntries,
}

/// Optional cache behaviour knobs.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Default TTL applied by [`LruCache::add`] and [`LruCache::get_or_add`].
    /// Zero means entries never expire.
    ///
    /// Expired entries are not removed eagerly, only when they are accessed
    /// or during periodic cleanup.
    pub default_ttl: Duration,
}

struct Slot<K, V> {
    key: K,
    value: V,
    expires_at: Option<Instant>,
    prev: usize,
    next: usize,
}

/// Slab-backed intrusive recency list plus a map for O(1) lookup.
struct Inner<K, V> {
    max_entries: usize,
    map: HashMap<K, usize>,
    slots: Vec<Option<Slot<K, V>>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
}

impl<K: Eq + Hash + Clone, V> Inner<K, V> {
    fn new(max_entries: usize) -> Self {
        Self {
            max_entries,
            map: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
        }
    }

    fn slot(&self, idx: usize) -> &Slot<K, V> {
        self.slots[idx].as_ref().expect("mapped index points at a live slot")
    }

    fn slot_mut(&mut self, idx: usize) -> &mut Slot<K, V> {
        self.slots[idx].as_mut().expect("mapped index points at a live slot")
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = {
            let s = self.slot(idx);
            (s.prev, s.next)
        };
        if prev == NIL {
            self.head = next;
        } else {
            self.slot_mut(prev).next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.slot_mut(next).prev = prev;
        }
    }

    fn attach_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let s = self.slot_mut(idx);
            s.prev = NIL;
            s.next = old_head;
        }
        if old_head != NIL {
            self.slot_mut(old_head).prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    fn promote(&mut self, idx: usize) {
        if self.head != idx {
            self.detach(idx);
            self.attach_front(idx);
        }
    }

    fn insert_front(&mut self, slot: Slot<K, V>) -> usize {
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(slot);
                idx
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.attach_front(idx);
        idx
    }

    fn remove_idx(&mut self, idx: usize) -> Slot<K, V> {
        self.detach(idx);
        let slot = self.slots[idx].take().expect("removed index points at a live slot");
        self.free.push(idx);
        self.map.remove(&slot.key);
        slot
    }

    fn pop_back(&mut self) -> Option<Slot<K, V>> {
        if self.tail == NIL {
            return None;
        }
        let tail = self.tail;
        Some(self.remove_idx(tail))
    }
}

/// Bounded LRU cache with TTL expiry and coalesced loads.
pub struct LruCache<K, V> {
    inner: Mutex<Inner<K, V>>,
    default_ttl: Duration,
    metrics: Arc<dyn MetricsCollector>,
    loads: Group<K, (V, bool)>,
}

impl<K, V> std::fmt::Debug for LruCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LruCache")
            .field("default_ttl", &self.default_ttl)
            .finish_non_exhaustive()
    }
}

impl<K, V> LruCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Creates a cache bounded to `max_entries` entries.
    ///
    /// `metrics` may be `None`, in which case statistics are not collected.
    pub fn new(max_entries: usize, metrics: Option<Arc<dyn MetricsCollector>>) -> Result<Self, BuildError> {
        Self::with_opts(max_entries, metrics, Options::default())
    }

    /// Creates a cache with explicit [`Options`].
    pub fn with_opts(
        max_entries: usize,
        metrics: Option<Arc<dyn MetricsCollector>>,
        opts: Options,
    ) -> Result<Self, BuildError> {
        if max_entries == 0 {
            return Err(BuildError::InvalidMaxEntries);
        }
        Ok(Self {
            inner: Mutex::new(Inner::new(max_entries)),
            default_ttl: opts.default_ttl,
            metrics: metrics.unwrap_or_else(|| Arc::new(DisabledMetrics)),
            loads: Group::new(),
        })
    }

    /// Returns the value stored under `key`, promoting it to most recent.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        self.lookup(&mut inner, key, true)
    }

    /// Adds a value under `key` with the default TTL, evicting the least
    /// recently used entry if the cache is full.
    pub fn add(&self, key: K, value: V) {
        self.add_with_ttl(key, value, self.default_ttl);
    }

    /// Adds a value under `key` with an explicit TTL. A zero `ttl` means the
    /// value never expires.
    pub fn add_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let expires_at = expiry(ttl);
        let mut inner = self.inner.lock();
        if let Some(&idx) = inner.map.get(&key) {
            inner.promote(idx);
            let slot = inner.slot_mut(idx);
            slot.value = value;
            slot.expires_at = expires_at;
            return;
        }
        self.insert_new(&mut inner, key, value, expires_at);
    }

    /// Returns the value under `key`, inserting `provider()` with the default
    /// TTL when missing. The second element reports whether the key existed.
    ///
    /// The provider runs under the cache lock and must not block; use
    /// [`LruCache::get_or_load`] for blocking work.
    pub fn get_or_add(&self, key: K, provider: impl FnOnce() -> V) -> (V, bool) {
        self.get_or_add_with_ttl(key, provider, self.default_ttl)
    }

    /// Same as [`LruCache::get_or_add`] with an explicit TTL.
    pub fn get_or_add_with_ttl(&self, key: K, provider: impl FnOnce() -> V, ttl: Duration) -> (V, bool) {
        let mut inner = self.inner.lock();
        if let Some(value) = self.lookup(&mut inner, &key, true) {
            return (value, true);
        }
        let expires_at = expiry(ttl);
        let value = provider();
        self.insert_new(&mut inner, key, value.clone(), expires_at);
        (value, false)
    }

    /// Returns the value under `key`, running `load` to produce it when
    /// missing. Concurrent callers for the same missing key share a single
    /// load; see [`LoadError`] for how loader failures are reported.
    ///
    /// A successfully loaded value is stored with the default TTL.
    pub async fn get_or_load<F, Fut>(&self, key: K, load: F) -> Result<(V, bool), LoadError>
    where
        F: FnOnce(&K) -> Fut,
        Fut: Future<Output = anyhow::Result<V>>,
    {
        let default_ttl = self.default_ttl;
        self.get_or_load_with_ttl(key, |k| {
            let fut = load(k);
            async move { fut.await.map(|v| (v, default_ttl)) }
        })
        .await
    }

    /// Same as [`LruCache::get_or_load`], with the loader choosing the TTL.
    /// A zero TTL falls back to the default.
    pub async fn get_or_load_with_ttl<F, Fut>(&self, key: K, load: F) -> Result<(V, bool), LoadError>
    where
        F: FnOnce(&K) -> Fut,
        Fut: Future<Output = anyhow::Result<(V, Duration)>>,
    {
        // Hits and misses are counted once per caller after the fact; the
        // double-checked lookups below run with counting disabled.
        if let Some(value) = self.peek(&key) {
            self.metrics.inc_hits();
            return Ok((value, true));
        }

        let loaded = self
            .loads
            .work(key.clone(), || {
                let key = key.clone();
                async move {
                    if let Some(value) = self.peek(&key) {
                        return Ok((value, true));
                    }
                    let (value, ttl) = load(&key).await.map_err(|e| LoadError::Failed(Arc::new(e)))?;
                    let ttl = if ttl.is_zero() { self.default_ttl } else { ttl };
                    self.add_with_ttl(key, value.clone(), ttl);
                    Ok((value, false))
                }
            })
            .await;

        match &loaded {
            Ok((_, true)) => self.metrics.inc_hits(),
            _ => self.metrics.inc_misses(),
        }
        loaded
    }

    /// Removes the value under `key`, reporting whether it was present.
    pub fn remove(&self, key: &K) -> bool {
        let mut inner = self.inner.lock();
        let Some(&idx) = inner.map.get(key) else {
            return false;
        };
        inner.remove_idx(idx);
        self.metrics.set_amount(inner.map.len());
        true
    }

    /// Clears the cache. Removed entries are not counted as evictions and the
    /// configured capacity is kept.
    pub fn purge(&self) {
        let mut inner = self.inner.lock();
        let max_entries = inner.max_entries;
        *inner = Inner::new(max_entries);
        self.metrics.set_amount(0);
    }

    /// Changes the capacity, evicting least-recent entries when shrinking
    /// below the current size. Returns the number of evicted entries.
    /// A zero `size` is ignored.
    pub fn resize(&self, size: usize) -> usize {
        if size == 0 {
            return 0;
        }
        let mut inner = self.inner.lock();
        inner.max_entries = size;
        let evicted = inner.map.len().saturating_sub(size);
        if evicted == 0 {
            return 0;
        }
        for _ in 0..evicted {
            inner.pop_back();
        }
        self.metrics.set_amount(inner.map.len());
        self.metrics.add_evictions(evicted);
        evicted
    }

    /// Number of entries currently stored, including not-yet-swept expired ones.
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Periodically drops expired entries until `cancel` fires. Entries
    /// without an expiration time are untouched. Run this on its own task.
    pub async fn run_periodic_cleanup(&self, cleanup_interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(cleanup_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // the first tick completes immediately
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => self.drop_expired(),
            }
        }
    }

    fn drop_expired(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let expired: Vec<usize> = inner
            .map
            .values()
            .copied()
            .filter(|&idx| inner.slot(idx).expires_at.is_some_and(|t| t <= now))
            .collect();
        for idx in expired {
            inner.remove_idx(idx);
        }
        self.metrics.set_amount(inner.map.len());
    }

    /// Lookup without promoting metrics counting; used by the load path.
    fn peek(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        self.lookup(&mut inner, key, false)
    }

    fn lookup(&self, inner: &mut Inner<K, V>, key: &K, count: bool) -> Option<V> {
        let Some(&idx) = inner.map.get(key) else {
            if count {
                self.metrics.inc_misses();
            }
            return None;
        };
        let expired = inner.slot(idx).expires_at.is_some_and(|t| t <= Instant::now());
        if expired {
            inner.remove_idx(idx);
            self.metrics.set_amount(inner.map.len());
            if count {
                self.metrics.inc_misses();
            }
            return None;
        }
        inner.promote(idx);
        if count {
            self.metrics.inc_hits();
        }
        Some(inner.slot(idx).value.clone())
    }

    fn insert_new(&self, inner: &mut Inner<K, V>, key: K, value: V, expires_at: Option<Instant>) {
        let idx = inner.insert_front(Slot {
            key: key.clone(),
            value,
            expires_at,
            prev: NIL,
            next: NIL,
        });
        inner.map.insert(key, idx);
        if inner.map.len() <= inner.max_entries {
            self.metrics.set_amount(inner.map.len());
            return;
        }
        if inner.pop_back().is_some() {
            self.metrics.add_evictions(1);
        }
    }
}

fn expiry(ttl: Duration) -> Option<Instant> {
    (ttl > Duration::ZERO).then(|| Instant::now() + ttl)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache(max: usize) -> LruCache<String, i32> {
        LruCache::new(max, None).unwrap()
    }

    #[test]
    fn rejects_zero_capacity() {
        assert_eq!(
            LruCache::<String, i32>::new(0, None).unwrap_err(),
            BuildError::InvalidMaxEntries
        );
    }

    #[test]
    fn add_get_remove_roundtrip() {
        let c = cache(10);
        c.add("a".into(), 1);
        assert_eq!(c.get(&"a".into()), Some(1));

        assert!(c.remove(&"a".into()));
        assert_eq!(c.get(&"a".into()), None);
        assert!(!c.remove(&"a".into()));
    }

    #[test]
    fn purge_then_add_is_clean() {
        let c = cache(10);
        c.add("a".into(), 1);
        c.add("b".into(), 2);
        c.purge();
        assert_eq!(c.len(), 0);
        c.add("a".into(), 3);
        assert_eq!(c.get(&"a".into()), Some(3));
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn evicts_least_recently_used() {
        let c = cache(2);
        c.add("a".into(), 1);
        c.add("b".into(), 2);
        // Touch "a" so "b" becomes the eviction candidate.
        assert_eq!(c.get(&"a".into()), Some(1));
        c.add("c".into(), 3);

        assert_eq!(c.get(&"a".into()), Some(1));
        assert_eq!(c.get(&"b".into()), None);
        assert_eq!(c.get(&"c".into()), Some(3));
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn overwrite_updates_value_and_recency() {
        let c = cache(2);
        c.add("a".into(), 1);
        c.add("b".into(), 2);
        c.add("a".into(), 10);
        c.add("c".into(), 3);

        assert_eq!(c.get(&"a".into()), Some(10));
        assert_eq!(c.get(&"b".into()), None);
    }

    #[test]
    fn expired_entry_is_a_miss() {
        let c = cache(10);
        c.add_with_ttl("a".into(), 1, Duration::from_millis(10));
        assert_eq!(c.get(&"a".into()), Some(1));
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(c.get(&"a".into()), None);
        assert_eq!(c.len(), 0);
    }

    #[test]
    fn zero_ttl_never_expires() {
        let c = cache(10);
        c.add_with_ttl("a".into(), 1, Duration::ZERO);
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(c.get(&"a".into()), Some(1));
    }

    #[test]
    fn resize_evicts_oldest_and_reports_count() {
        let c = cache(5);
        for i in 0..5 {
            c.add(format!("k{i}"), i);
        }
        assert_eq!(c.resize(3), 2);
        assert_eq!(c.len(), 3);
        assert_eq!(c.get(&"k0".into()), None);
        assert_eq!(c.get(&"k1".into()), None);
        assert_eq!(c.get(&"k4".into()), Some(4));

        // Growing or same-size resize evicts nothing.
        assert_eq!(c.resize(10), 0);
        assert_eq!(c.resize(0), 0);
        assert_eq!(c.len(), 3);
    }

    #[test]
    fn get_or_add_runs_provider_once() {
        let c = cache(10);
        let calls = AtomicUsize::new(0);
        let provider = || {
            calls.fetch_add(1, Ordering::SeqCst);
            7
        };
        assert_eq!(c.get_or_add("a".into(), provider), (7, false));
        assert_eq!(c.get_or_add("a".into(), || 8), (7, true));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn get_or_load_caches_loaded_value() {
        let c = cache(10);
        let (v, existed) = c
            .get_or_load("a".into(), |_| async { Ok(41) })
            .await
            .unwrap();
        assert_eq!((v, existed), (41, false));

        let (v, existed) = c
            .get_or_load("a".into(), |_| async { panic!("loader must not run") })
            .await
            .unwrap();
        assert_eq!((v, existed), (41, true));
    }

    #[tokio::test]
    async fn get_or_load_error_is_not_cached() {
        let c = cache(10);
        let err = c
            .get_or_load("a".into(), |_| async { anyhow::bail!("backend down") })
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::Failed(_)));
        assert!(err.to_string().contains("backend down"));
        assert_eq!(c.len(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn get_or_load_coalesces_concurrent_loads() {
        let c = Arc::new(LruCache::<String, i32>::new(10, None).unwrap());
        let loader_calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let c = c.clone();
            let loader_calls = loader_calls.clone();
            tasks.push(tokio::spawn(async move {
                c.get_or_load("shared".into(), |_| {
                    let loader_calls = loader_calls.clone();
                    async move {
                        loader_calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok(99)
                    }
                })
                .await
            }));
        }
        for task in tasks {
            let (v, _) = task.await.unwrap().unwrap();
            assert_eq!(v, 99);
        }
        assert_eq!(loader_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn get_or_load_propagates_loader_panic() {
        let c = Arc::new(LruCache::<String, i32>::new(10, None).unwrap());

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let c = c.clone();
            tasks.push(tokio::spawn(async move {
                c.get_or_load("boom".into(), |_| async {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    panic!("loader exploded");
                })
                .await
            }));
        }
        for task in tasks {
            let err = task.await.unwrap().unwrap_err();
            match err {
                LoadError::Panicked { message, .. } => assert!(message.contains("loader exploded")),
                other => panic!("expected Panicked, got {other:?}"),
            }
        }
        assert_eq!(c.len(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn get_or_load_reports_abandoned_leader() {
        let c = Arc::new(LruCache::<String, i32>::new(10, None).unwrap());

        let leader = {
            let c = c.clone();
            tokio::spawn(async move {
                let _ = c
                    .get_or_load("stuck".into(), |_| async {
                        futures::future::pending::<anyhow::Result<i32>>().await
                    })
                    .await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let waiter = {
            let c = c.clone();
            tokio::spawn(async move {
                c.get_or_load("stuck".into(), |_| async { Ok(1) }).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        leader.abort();

        let result = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter must be released")
            .unwrap();
        assert!(matches!(result, Err(LoadError::Abandoned)));
    }

    #[tokio::test]
    async fn periodic_cleanup_sweeps_expired_entries() {
        let c = Arc::new(LruCache::<String, i32>::new(10, None).unwrap());
        c.add_with_ttl("short".into(), 1, Duration::from_millis(10));
        c.add("forever".into(), 2);

        let cancel = CancellationToken::new();
        let sweeper = {
            let c = c.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                c.run_periodic_cleanup(Duration::from_millis(20), cancel).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();
        sweeper.await.unwrap();

        assert_eq!(c.len(), 1);
        assert_eq!(c.get(&"forever".into()), Some(2));
    }

    #[test]
    fn prometheus_collector_tracks_usage() {
        let pm = Arc::new(PrometheusMetrics::new("test_cache"));
        let collector: Arc<dyn MetricsCollector> = pm.clone();
        let c = LruCache::<String, i32>::new(2, Some(collector)).unwrap();

        c.add("a".into(), 1);
        c.add("b".into(), 2);
        c.add("c".into(), 3); // evicts "a"
        let _ = c.get(&"b".into()); // hit
        let _ = c.get(&"zz".into()); // miss

        assert_eq!(pm.hits_total(), 1);
        assert_eq!(pm.misses_total(), 1);
        assert_eq!(pm.evictions_total(), 1);
        assert_eq!(pm.entries_amount(), 2);
    }
}
