//! Keyed connection cache with capacity limits and lazy staleness checks
//!
//! Every key maps to a recency-ordered list of entries. A global sequence
//! index orders all resident entries by insertion so the oldest one across
//! all keys can be evicted when the global capacity is exceeded. All
//! bookkeeping happens under one short-lived lock; closing connections always
//! happens after the lock is released.

use crate::config::PoolOptions;
use crate::connection::{CacheKey, Connection};
use crate::errors::TeardownError;
use crate::eviction::{EvictionReason, IdleExpiration};
use crate::metrics::{MetricsTracker, PoolMetrics};

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{trace, warn};

/// A connection resident in the cache together with its dial-time state
pub struct CacheEntry<C, S> {
    conn: Arc<C>,
    state: S,
    inserted_at: Instant,
}

impl<C, S> CacheEntry<C, S> {
    pub fn new(conn: Arc<C>, state: S) -> Self {
        Self {
            conn,
            state,
            inserted_at: Instant::now(),
        }
    }

    pub fn conn(&self) -> &Arc<C> {
        &self.conn
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn into_parts(self) -> (Arc<C>, S) {
        (self.conn, self.state)
    }
}

struct Slot<C, S> {
    seq: u64,
    entry: CacheEntry<C, S>,
}

struct CacheInner<K, C, S> {
    // Per key, oldest at the front.
    entries: HashMap<K, VecDeque<Slot<C, S>>>,
    // Insertion sequence of every resident entry, oldest first.
    order: BTreeMap<u64, K>,
    next_seq: u64,
    closed: bool,
}

impl<K: CacheKey, C, S> CacheInner<K, C, S> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
            closed: false,
        }
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn key_len(&self, key: &K) -> usize {
        self.entries.get(key).map_or(0, VecDeque::len)
    }

    /// Inserts as the most recent entry. A connection already resident under
    /// the same key is refreshed rather than stored twice.
    fn insert(&mut self, key: K, entry: CacheEntry<C, S>) {
        let seq = self.next_seq;
        self.next_seq += 1;

        let slots = self.entries.entry(key.clone()).or_default();
        if let Some(pos) = slots.iter().position(|slot| Arc::ptr_eq(&slot.entry.conn, &entry.conn))
            && let Some(previous) = slots.remove(pos)
        {
            self.order.remove(&previous.seq);
        }
        slots.push_back(Slot { seq, entry });
        self.order.insert(seq, key);
    }

    /// Pops the most recent entry that is not stale. Stale entries found on
    /// the way are moved to `stale`.
    fn take(
        &mut self,
        key: &K,
        expiration: &IdleExpiration,
        stale: &mut Vec<(CacheEntry<C, S>, EvictionReason)>,
    ) -> Option<CacheEntry<C, S>>
    where
        C: Connection,
    {
        let slots = self.entries.get_mut(key)?;
        let mut found = None;
        while let Some(slot) = slots.pop_back() {
            self.order.remove(&slot.seq);
            match expiration.staleness(&*slot.entry.conn, slot.entry.inserted_at) {
                Some(reason) => stale.push((slot.entry, reason)),
                None => {
                    found = Some(slot.entry);
                    break;
                }
            }
        }
        if slots.is_empty() {
            self.entries.remove(key);
        }
        found
    }

    fn evict_oldest_of(&mut self, key: &K) -> Option<CacheEntry<C, S>> {
        let slots = self.entries.get_mut(key)?;
        let slot = slots.pop_front()?;
        self.order.remove(&slot.seq);
        if slots.is_empty() {
            self.entries.remove(key);
        }
        Some(slot.entry)
    }

    fn evict_oldest(&mut self) -> Option<(K, CacheEntry<C, S>)> {
        let (seq, key) = self.order.pop_first()?;
        let slots = self.entries.get_mut(&key)?;
        let pos = slots.iter().position(|slot| slot.seq == seq)?;
        let slot = slots.remove(pos)?;
        if slots.is_empty() {
            self.entries.remove(&key);
        }
        Some((key, slot.entry))
    }

    fn drain(&mut self) -> Vec<(K, CacheEntry<C, S>)> {
        self.order.clear();
        self.entries
            .drain()
            .flat_map(|(key, slots)| slots.into_iter().map(move |slot| (key.clone(), slot.entry)))
            .collect()
    }
}

/// Thread-safe keyed store of reusable connections.
///
/// After every [`put`](Self::put) the cache holds at most `capacity`
/// connections in total and at most `key_capacity` per key (a limit of `0`
/// is not enforced). Entries that are broken or idle-expired are never
/// returned by [`take`](Self::take).
pub struct ConnectionCache<K, C, S> {
    inner: Mutex<CacheInner<K, C, S>>,
    capacity: usize,
    key_capacity: usize,
    expiration: IdleExpiration,
    metrics: MetricsTracker,
}

impl<K, C, S> ConnectionCache<K, C, S>
where
    K: CacheKey,
    C: Connection,
    S: Send + Sync + 'static,
{
    pub fn new(options: &PoolOptions) -> Self {
        Self {
            inner: Mutex::new(CacheInner::new()),
            capacity: options.capacity,
            key_capacity: options.key_capacity,
            expiration: IdleExpiration::new(options.idle_expiration),
            metrics: MetricsTracker::new(),
        }
    }

    /// Removes and returns the most recently stored usable entry for `key`.
    ///
    /// Broken or idle-expired entries encountered while looking are closed
    /// and dropped.
    pub fn take(&self, key: &K) -> Option<CacheEntry<C, S>> {
        let mut stale = Vec::new();
        let found = self.inner.lock().take(key, &self.expiration, &mut stale);

        for (entry, reason) in stale {
            self.dispose(key, entry, reason);
        }
        found
    }

    /// Stores `entry` under `key`, evicting the oldest entries as needed.
    ///
    /// Once the cache is closed the entry is closed immediately instead.
    pub fn put(&self, key: K, entry: CacheEntry<C, S>) {
        if let Err(entry) = self.try_put(key.clone(), entry) {
            self.dispose(&key, entry, EvictionReason::Shutdown);
        }
    }

    /// Like [`put`](Self::put), but a closed cache hands the entry back
    /// untouched instead of closing it.
    pub fn try_put(&self, key: K, entry: CacheEntry<C, S>) -> Result<(), CacheEntry<C, S>> {
        let mut evicted = Vec::new();
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(entry);
            }

            trace!(?key, "put connection");
            inner.insert(key.clone(), entry);

            if self.key_capacity > 0 {
                while inner.key_len(&key) > self.key_capacity {
                    match inner.evict_oldest_of(&key) {
                        Some(entry) => evicted.push((key.clone(), entry, EvictionReason::KeyCapacity)),
                        None => break,
                    }
                }
            }

            if self.capacity > 0 {
                while inner.len() > self.capacity {
                    match inner.evict_oldest() {
                        Some((key, entry)) => evicted.push((key, entry, EvictionReason::Capacity)),
                        None => break,
                    }
                }
            }
        }

        for (key, entry, reason) in evicted {
            self.dispose(&key, entry, reason);
        }
        Ok(())
    }

    /// Closes every resident connection and disables the cache.
    ///
    /// Returns the failures of the closes performed by this call. Calling it
    /// again is a no-op.
    pub fn close(&self) -> Result<(), TeardownError> {
        let drained = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Ok(());
            }
            inner.closed = true;
            inner.drain()
        };

        let mut failures = TeardownError::default();
        for (key, entry) in drained {
            self.metrics.record_eviction(EvictionReason::Shutdown);
            if let Err(err) = entry.conn.close() {
                MetricsTracker::increment(&self.metrics.teardown_failures);
                warn!(?key, error = %err, "failed to close pooled connection");
                failures.push(err);
            }
        }
        failures.into_result()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of resident connections across all keys
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of resident connections for `key`
    pub fn key_len(&self, key: &K) -> usize {
        self.inner.lock().key_len(key)
    }

    pub fn metrics(&self) -> PoolMetrics {
        let (resident, keys) = {
            let inner = self.inner.lock();
            (inner.len(), inner.entries.len())
        };
        self.metrics.get_metrics(resident, keys, self.capacity)
    }

    pub(crate) fn tracker(&self) -> &MetricsTracker {
        &self.metrics
    }

    fn dispose(&self, key: &K, entry: CacheEntry<C, S>, reason: EvictionReason) {
        trace!(?key, %reason, "evicting connection");
        self.metrics.record_eviction(reason);
        if let Err(err) = entry.conn.close() {
            MetricsTracker::increment(&self.metrics.teardown_failures);
            warn!(?key, %reason, error = %err, "failed to close evicted connection");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Test connection counting how often it is closed.
    #[derive(Default)]
    pub(crate) struct MockConn {
        pub id: usize,
        pub broken: AtomicBool,
        pub closes: AtomicUsize,
        pub fail_close: bool,
    }

    impl MockConn {
        pub fn new(id: usize) -> Arc<Self> {
            Arc::new(Self {
                id,
                ..Default::default()
            })
        }

        pub fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }

        pub fn break_it(&self) {
            self.broken.store(true, Ordering::SeqCst);
        }
    }

    impl Connection for MockConn {
        type Error = String;

        fn close(&self) -> Result<(), String> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.broken.store(true, Ordering::SeqCst);
            if self.fail_close {
                Err(format!("conn {} reset", self.id))
            } else {
                Ok(())
            }
        }

        fn is_closed(&self) -> bool {
            self.broken.load(Ordering::SeqCst)
        }
    }

    fn cache(capacity: usize, key_capacity: usize) -> ConnectionCache<&'static str, MockConn, ()> {
        ConnectionCache::new(
            &PoolOptions::new()
                .with_capacity(capacity)
                .with_key_capacity(key_capacity)
                .with_idle_expiration(Duration::ZERO),
        )
    }

    fn entry(conn: &Arc<MockConn>) -> CacheEntry<MockConn, ()> {
        CacheEntry::new(Arc::clone(conn), ())
    }

    #[test]
    fn test_take_returns_most_recent() {
        let cache = cache(10, 10);
        let first = MockConn::new(1);
        let second = MockConn::new(2);
        cache.put("a", entry(&first));
        cache.put("a", entry(&second));

        assert_eq!(cache.take(&"a").unwrap().conn().id, 2);
        assert_eq!(cache.take(&"a").unwrap().conn().id, 1);
        assert!(cache.take(&"a").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_take_skips_and_closes_broken() {
        let cache = cache(10, 10);
        let healthy = MockConn::new(1);
        let broken = MockConn::new(2);
        cache.put("a", entry(&healthy));
        cache.put("a", entry(&broken));
        broken.break_it();

        assert_eq!(cache.take(&"a").unwrap().conn().id, 1);
        assert_eq!(broken.closes(), 1);
        assert_eq!(healthy.closes(), 0);
        assert_eq!(cache.metrics().stale_evictions, 1);
    }

    #[test]
    fn test_take_reports_miss_after_only_stale_entries() {
        let cache = cache(10, 10);
        let conns: Vec<_> = (0..3).map(MockConn::new).collect();
        for conn in &conns {
            cache.put("a", entry(conn));
            conn.break_it();
        }

        assert!(cache.take(&"a").is_none());
        assert!(conns.iter().all(|conn| conn.closes() == 1));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_key_capacity_evicts_oldest_of_key() {
        let cache = cache(10, 2);
        let conns: Vec<_> = (0..3).map(MockConn::new).collect();
        let other = MockConn::new(9);
        cache.put("b", entry(&other));
        for conn in &conns {
            cache.put("a", entry(conn));
        }

        assert_eq!(cache.key_len(&"a"), 2);
        assert_eq!(conns[0].closes(), 1);
        assert_eq!(other.closes(), 0);
        assert_eq!(cache.metrics().capacity_evictions, 1);
    }

    #[test]
    fn test_global_capacity_evicts_oldest_across_keys() {
        let cache = cache(2, 10);
        let a = MockConn::new(1);
        let b = MockConn::new(2);
        let c = MockConn::new(3);
        cache.put("a", entry(&a));
        cache.put("b", entry(&b));
        cache.put("c", entry(&c));

        assert_eq!(cache.len(), 2);
        assert_eq!(a.closes(), 1);
        assert_eq!(b.closes(), 0);
        assert_eq!(cache.key_len(&"a"), 0);
        assert_eq!(cache.metrics().resident_keys, 2);
    }

    #[test]
    fn test_bounds_hold_after_every_put() {
        let cache = cache(5, 2);
        let keys = ["a", "b", "c", "d"];
        for i in 0..40 {
            let key = keys[i % keys.len()];
            cache.put(key, entry(&MockConn::new(i)));
            assert!(cache.len() <= 5);
            assert!(keys.iter().all(|key| cache.key_len(key) <= 2));
        }
    }

    #[test]
    fn test_zero_limits_are_unbounded() {
        let cache = cache(0, 0);
        for i in 0..50 {
            cache.put("a", entry(&MockConn::new(i)));
        }
        assert_eq!(cache.key_len(&"a"), 50);
    }

    #[test]
    fn test_put_same_connection_refreshes() {
        let cache = cache(2, 2);
        let shared = MockConn::new(1);
        let other = MockConn::new(2);
        cache.put("a", entry(&shared));
        cache.put("b", entry(&other));
        cache.put("a", entry(&shared));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.key_len(&"a"), 1);

        // The refreshed entry is now the newest, so "b" is evicted first.
        cache.put("c", entry(&MockConn::new(3)));
        assert_eq!(other.closes(), 1);
        assert_eq!(shared.closes(), 0);
    }

    #[test]
    fn test_close_is_idempotent_and_disables_put() {
        let cache = cache(10, 10);
        let conns: Vec<_> = (0..3).map(MockConn::new).collect();
        for (i, conn) in conns.iter().enumerate() {
            cache.put(if i % 2 == 0 { "a" } else { "b" }, entry(conn));
        }

        cache.close().unwrap();
        cache.close().unwrap();
        assert!(conns.iter().all(|conn| conn.closes() == 1));
        assert!(cache.is_closed());

        let late = MockConn::new(7);
        cache.put("a", entry(&late));
        assert_eq!(late.closes(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_try_put_after_close_hands_entry_back() {
        let cache = cache(10, 10);
        cache.close().unwrap();

        let late = MockConn::new(7);
        let refused = cache.try_put("a", entry(&late)).unwrap_err();
        assert!(Arc::ptr_eq(refused.conn(), &late));
        assert_eq!(late.closes(), 0);
        assert!(!late.is_closed());
        assert!(cache.is_empty());
        assert_eq!(cache.metrics().shutdown_closes, 0);
    }

    #[test]
    fn test_close_aggregates_failures() {
        let cache = cache(10, 10);
        let failing = Arc::new(MockConn {
            id: 4,
            fail_close: true,
            ..Default::default()
        });
        cache.put("a", entry(&failing));
        cache.put("a", entry(&MockConn::new(5)));

        let err = cache.close().unwrap_err();
        assert_eq!(err.failures(), ["conn 4 reset"]);
        assert_eq!(cache.metrics().teardown_failures, 1);
        assert!(cache.close().is_ok());
    }

    #[test]
    fn test_eviction_failure_is_contained() {
        let cache = cache(1, 1);
        let failing = Arc::new(MockConn {
            id: 1,
            fail_close: true,
            ..Default::default()
        });
        cache.put("a", entry(&failing));
        cache.put("a", entry(&MockConn::new(2)));

        assert_eq!(failing.closes(), 1);
        assert_eq!(cache.metrics().teardown_failures, 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_entry_is_stale() {
        let cache: ConnectionCache<&str, MockConn, ()> =
            ConnectionCache::new(&PoolOptions::new().with_idle_expiration(Duration::from_secs(5)));
        let conn = MockConn::new(1);
        cache.put("a", entry(&conn));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(cache.take(&"a").is_none());
        assert_eq!(conn.closes(), 1);
    }

    #[test]
    fn test_concurrent_take_put() {
        let cache = Arc::new(cache(8, 3));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    let keys = ["a", "b", "c"];
                    for i in 0..200 {
                        let key = keys[(t + i) % keys.len()];
                        let entry = cache
                            .take(&key)
                            .unwrap_or_else(|| CacheEntry::new(MockConn::new(t * 1000 + i), ()));
                        cache.put(key, entry);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(cache.len() <= 8);
        assert!(["a", "b", "c"].iter().all(|key| cache.key_len(key) <= 3));
    }
}
