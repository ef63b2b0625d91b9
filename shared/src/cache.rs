use std::fmt;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::{Clock, SystemClock, UnixTimeMs};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicy {
    pub capacity: usize,
    pub idle_ttl_ms: u64,
    /// `None` purges idle entries by age alone.
    pub min_access_to_survive_sweep: Option<u32>,
}

impl CachePolicy {
    #[must_use]
    pub const fn new(capacity: usize, idle_ttl_ms: u64, min_access: Option<u32>) -> Self {
        Self {
            capacity,
            idle_ttl_ms,
            min_access_to_survive_sweep: min_access,
        }
    }

    #[must_use]
    pub const fn images() -> Self {
        Self::new(20, 10 * 60 * 1000, Some(3))
    }

    #[must_use]
    pub const fn documents() -> Self {
        Self::new(5, 15 * 60 * 1000, Some(2))
    }

    #[must_use]
    pub const fn rendered_pages() -> Self {
        Self::new(20, 5 * 60 * 1000, None)
    }

    #[must_use]
    pub const fn idle_ttl(&self) -> Duration {
        Duration::from_millis(self.idle_ttl_ms)
    }

    fn survives_sweep(&self, access_count: u32) -> bool {
        self.min_access_to_survive_sweep
            .is_some_and(|min| access_count >= min)
    }
}

/// Rough memory footprint of a cached value, reported through [`CacheStats`].
pub trait SizeEstimate {
    fn estimated_bytes(&self) -> usize;
}

impl<T: SizeEstimate + ?Sized> SizeEstimate for Arc<T> {
    fn estimated_bytes(&self) -> usize {
        (**self).estimated_bytes()
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    value: V,
    timestamp: UnixTimeMs,
    access_count: u32,
    size_estimate_bytes: usize,
}

impl<V> CacheEntry<V> {
    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn timestamp(&self) -> UnixTimeMs {
        self.timestamp
    }

    pub fn access_count(&self) -> u32 {
        self.access_count
    }

    pub fn size_estimate_bytes(&self) -> usize {
        self.size_estimate_bytes
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats<K> {
    pub size: usize,
    pub capacity: usize,
    pub total_estimated_bytes: usize,
    pub average_access_count: f64,
    /// Most recently used first.
    pub keys: Vec<K>,
}

pub type DisposeHook<K, V> = Box<dyn FnMut(&K, V) + Send>;

pub struct ResourceCache<K: Hash + Eq, V> {
    name: &'static str,
    policy: CachePolicy,
    entries: LruCache<K, CacheEntry<V>>,
    clock: Arc<dyn Clock>,
    dispose: Option<DisposeHook<K, V>>,
}

pub type SharedCache<K, V> = Arc<Mutex<ResourceCache<K, V>>>;

impl<K: Hash + Eq, V> fmt::Debug for ResourceCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceCache")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("len", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl<K: Hash + Eq, V> ResourceCache<K, V> {
    pub fn new(name: &'static str, policy: CachePolicy) -> Self {
        Self::with_clock(name, policy, Arc::new(SystemClock))
    }

    pub fn with_clock(name: &'static str, policy: CachePolicy, clock: Arc<dyn Clock>) -> Self {
        let capacity = NonZeroUsize::new(policy.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            name,
            policy,
            entries: LruCache::new(capacity),
            clock,
            dispose: None,
        }
    }

    /// Runs `hook` on every value leaving the cache through eviction, sweep,
    /// replacement or [`clear`](Self::clear).
    #[must_use]
    pub fn with_disposer(mut self, hook: impl FnMut(&K, V) + Send + 'static) -> Self {
        self.dispose = Some(Box::new(hook));
        self
    }

    pub fn into_shared(self) -> SharedCache<K, V> {
        Arc::new(Mutex::new(self))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains(key)
    }

    /// Looks at an entry without touching its recency or access statistics.
    pub fn peek(&self, key: &K) -> Option<&CacheEntry<V>> {
        self.entries.peek(key)
    }

    pub fn get(&mut self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let now = self.clock.now();
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.timestamp = now;
                entry.access_count = entry.access_count.saturating_add(1);
                counter!("cache.hit", "cache" => self.name).increment(1);
                debug!(cache = self.name, access_count = entry.access_count, "cache hit");
                Some(entry.value.clone())
            }
            None => {
                counter!("cache.miss", "cache" => self.name).increment(1);
                debug!(cache = self.name, "cache miss");
                None
            }
        }
    }

    /// Inserts `value`, evicting the least recently accessed entry first if
    /// the cache is full. Never fails.
    pub fn put(&mut self, key: K, value: V)
    where
        V: SizeEstimate,
    {
        let entry = CacheEntry {
            size_estimate_bytes: value.estimated_bytes(),
            value,
            timestamp: self.clock.now(),
            access_count: 1,
        };

        if let Some((old_key, old)) = self.entries.push(key, entry) {
            if self.entries.contains(&old_key) {
                debug!(cache = self.name, "cache entry replaced");
            } else {
                counter!("cache.eviction", "cache" => self.name).increment(1);
                debug!(
                    cache = self.name,
                    access_count = old.access_count,
                    "evicted least recently used entry"
                );
            }
            self.dispose(&old_key, old.value);
        }
    }

    /// Drops entries idle for longer than the TTL whose access count is
    /// below the survival floor. Returns how many were removed.
    pub fn sweep(&mut self, now: UnixTimeMs) -> usize
    where
        K: Clone,
    {
        let ttl = self.policy.idle_ttl_ms;
        let policy = self.policy;
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, e)| {
                now.elapsed_since(e.timestamp) > ttl && !policy.survives_sweep(e.access_count)
            })
            .map(|(k, _)| k.clone())
            .collect();

        let removed = expired.len();
        for key in expired {
            if let Some(entry) = self.entries.pop(&key) {
                self.dispose(&key, entry.value);
            }
        }

        if removed > 0 {
            counter!("cache.swept", "cache" => self.name).increment(removed as u64);
            info!(cache = self.name, removed, remaining = self.entries.len(), "cache sweep");
        }
        removed
    }

    /// [`sweep`](Self::sweep) against the cache's own clock.
    pub fn sweep_expired(&mut self) -> usize
    where
        K: Clone,
    {
        let now = self.clock.now();
        self.sweep(now)
    }

    /// Disposes and removes everything.
    pub fn clear(&mut self) {
        let count = self.entries.len();
        while let Some((key, entry)) = self.entries.pop_lru() {
            self.dispose(&key, entry.value);
        }
        if count > 0 {
            debug!(cache = self.name, count, "cache cleared");
        }
    }

    pub fn stats(&self) -> CacheStats<K>
    where
        K: Clone,
    {
        let size = self.entries.len();
        let total_access: u64 = self
            .entries
            .iter()
            .map(|(_, e)| u64::from(e.access_count))
            .sum();
        #[allow(clippy::cast_precision_loss)]
        let average_access_count = if size == 0 {
            0.0
        } else {
            total_access as f64 / size as f64
        };

        CacheStats {
            size,
            capacity: self.policy.capacity,
            total_estimated_bytes: self.entries.iter().map(|(_, e)| e.size_estimate_bytes).sum(),
            average_access_count,
            keys: self.entries.iter().map(|(k, _)| k.clone()).collect(),
        }
    }

    fn dispose(&mut self, key: &K, value: V) {
        if let Some(hook) = self.dispose.as_mut() {
            hook(key, value);
        }
    }
}

/// Periodic sweep over a shared cache. The task holds the cache weakly and
/// stops once the cache is gone or the handle is dropped.
#[derive(Debug)]
pub struct SweepTask {
    handle: JoinHandle<()>,
}

impl SweepTask {
    pub fn spawn<K, V>(cache: &SharedCache<K, V>, interval: Duration) -> Self
    where
        K: Hash + Eq + Clone + Send + 'static,
        V: Send + 'static,
    {
        let weak = Arc::downgrade(cache);
        let period = interval.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // the first tick resolves immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                cache.lock().await.sweep_expired();
            }
        });
        Self { handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for SweepTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ManualClock;
    use proptest::prelude::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, Clone, PartialEq)]
    struct Blob(usize);

    impl SizeEstimate for Blob {
        fn estimated_bytes(&self) -> usize {
            self.0
        }
    }

    const MINUTE: u64 = 60 * 1000;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(UnixTimeMs(1_000_000)))
    }

    fn disposed_log() -> (Arc<StdMutex<Vec<&'static str>>>, impl FnMut(&&'static str, Blob) + Send) {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        (log, move |key: &&'static str, _value: Blob| {
            sink.lock().unwrap().push(*key);
        })
    }

    #[test]
    fn put_then_get_round_trips_and_counts_access() {
        let mut cache = ResourceCache::with_clock("test", CachePolicy::images(), clock());
        cache.put("a", Blob(10));
        assert_eq!(cache.peek(&"a").unwrap().access_count(), 1);

        assert_eq!(cache.get(&"a"), Some(Blob(10)));
        assert_eq!(cache.peek(&"a").unwrap().access_count(), 2);
        assert_eq!(cache.get(&"missing"), None);
    }

    #[test]
    fn get_refreshes_timestamp() {
        let clock = clock();
        let mut cache = ResourceCache::with_clock("test", CachePolicy::images(), clock.clone());
        cache.put("a", Blob(1));
        clock.advance(Duration::from_secs(30));
        cache.get(&"a");
        assert_eq!(cache.peek(&"a").unwrap().timestamp(), clock.now());
    }

    #[test]
    fn overflow_evicts_least_recently_accessed_once() {
        let (log, hook) = disposed_log();
        let mut cache = ResourceCache::with_clock("test", CachePolicy::new(3, MINUTE, Some(2)), clock())
            .with_disposer(hook);
        cache.put("a", Blob(1));
        cache.put("b", Blob(1));
        cache.put("c", Blob(1));
        cache.get(&"a");

        cache.put("d", Blob(1));

        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(&"b"));
        assert!(cache.contains(&"a"));
        assert_eq!(*log.lock().unwrap(), vec!["b"]);
    }

    #[test]
    fn replacing_a_key_disposes_the_previous_value() {
        let (log, hook) = disposed_log();
        let mut cache =
            ResourceCache::with_clock("test", CachePolicy::images(), clock()).with_disposer(hook);
        cache.put("a", Blob(1));
        cache.put("a", Blob(2));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"a"), Some(Blob(2)));
        assert_eq!(*log.lock().unwrap(), vec!["a"]);
    }

    #[test]
    fn sweep_removes_idle_rarely_used_entries_only() {
        let clock = clock();
        let (log, hook) = disposed_log();
        let mut cache = ResourceCache::with_clock("test", CachePolicy::new(10, 10 * MINUTE, Some(3)), clock.clone())
            .with_disposer(hook);
        cache.put("cold", Blob(1));
        cache.put("hot", Blob(1));
        cache.get(&"hot");
        cache.get(&"hot");
        // both now share the same last-access time
        cache.get(&"cold");
        assert_eq!(cache.peek(&"hot").unwrap().access_count(), 3);
        assert_eq!(cache.peek(&"cold").unwrap().access_count(), 2);

        clock.advance(Duration::from_millis(10 * MINUTE));
        assert_eq!(cache.sweep(clock.now()), 0, "age equal to the TTL is not expired");

        clock.advance(Duration::from_millis(1));
        assert_eq!(cache.sweep(clock.now()), 1);
        assert!(cache.contains(&"hot"));
        assert!(!cache.contains(&"cold"));
        assert_eq!(*log.lock().unwrap(), vec!["cold"]);
    }

    #[test]
    fn age_only_policy_ignores_access_count() {
        let clock = clock();
        let mut cache = ResourceCache::with_clock("pages", CachePolicy::rendered_pages(), clock.clone());
        cache.put("p1", Blob(1));
        for _ in 0..50 {
            cache.get(&"p1");
        }
        cache.put("p2", Blob(1));
        clock.advance(Duration::from_millis(5 * MINUTE + 1));
        assert_eq!(cache.sweep_expired(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn clear_disposes_everything() {
        let (log, hook) = disposed_log();
        let mut cache =
            ResourceCache::with_clock("test", CachePolicy::documents(), clock()).with_disposer(hook);
        cache.put("a", Blob(1));
        cache.put("b", Blob(1));
        cache.clear();
        assert!(cache.is_empty());
        let mut disposed = log.lock().unwrap().clone();
        disposed.sort_unstable();
        assert_eq!(disposed, vec!["a", "b"]);
    }

    #[test]
    fn stats_report_size_bytes_and_access() {
        let mut cache = ResourceCache::with_clock("test", CachePolicy::images(), clock());
        assert_eq!(cache.stats().average_access_count, 0.0);
        cache.put("a", Blob(100));
        cache.put("b", Blob(50));
        cache.get(&"a");
        cache.get(&"a");

        let stats = cache.stats();
        assert_eq!(stats.size, 2);
        assert_eq!(stats.capacity, 20);
        assert_eq!(stats.total_estimated_bytes, 150);
        assert!((stats.average_access_count - 2.0).abs() < f64::EPSILON);
        assert_eq!(stats.keys, vec!["a", "b"]);
    }

    #[test]
    fn zero_capacity_still_holds_one_entry() {
        let mut cache = ResourceCache::with_clock("test", CachePolicy::new(0, MINUTE, None), clock());
        cache.put("a", Blob(1));
        cache.put("b", Blob(1));
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&"b"));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_task_runs_on_interval_and_stops_when_dropped() {
        let clock = clock();
        let cache = ResourceCache::with_clock("test", CachePolicy::new(5, MINUTE, Some(2)), clock.clone())
            .into_shared();
        cache.lock().await.put("stale", Blob(1));
        clock.advance(Duration::from_millis(2 * MINUTE));

        let task = SweepTask::spawn(&cache, Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(cache.lock().await.is_empty());

        task.stop();
        cache.lock().await.put("stale-again", Blob(1));
        clock.advance(Duration::from_millis(2 * MINUTE));
        tokio::time::sleep(Duration::from_secs(180)).await;
        assert!(cache.lock().await.contains(&"stale-again"));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_task_exits_when_cache_is_dropped() {
        let cache: SharedCache<&'static str, Blob> =
            ResourceCache::with_clock("test", CachePolicy::images(), clock()).into_shared();
        let task = SweepTask::spawn(&cache, Duration::from_secs(1));
        drop(cache);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(task.is_finished());
    }

    proptest! {
        #[test]
        fn size_never_exceeds_capacity(capacity in 1usize..10, keys in proptest::collection::vec(0u8..30, 0..60)) {
            let mut cache = ResourceCache::with_clock("prop", CachePolicy::new(capacity, MINUTE, None), clock());
            for key in keys {
                if cache.get(&key).is_none() {
                    cache.put(key, Blob(1));
                }
                prop_assert!(cache.len() <= capacity);
            }
        }
    }
}
