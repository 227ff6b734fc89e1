//! The per-zone record cache.
//!
//! Answering from the store on every query would put a database
//! round-trip on the hot path, so the full record set of a zone is
//! cached under the zone name and dropped either when its entry
//! expires or when the change-stream reports an edit.
//!
//! A cold zone under load is the dangerous case: without coordination,
//! every concurrent query for it would issue its own store fetch.
//! Misses therefore go through a per-zone flight guard, and only the
//! first caller in hits the store; the rest find the entry populated
//! when they get the guard.

use priority_queue::PriorityQueue;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;

use crate::store::{StoreError, ZoneRecord, ZoneStore};

/// How many zones to hold before evicting in least-recently-used
/// order.
pub const DEFAULT_CAPACITY: usize = 1_000_000;

/// How long a cached record set stays usable.  The deadline is
/// absolute: reads do not extend it.
pub const DEFAULT_ENTRY_TTL: Duration = Duration::from_secs(30 * 60);

const MUTEX_POISON_MESSAGE: &str =
    "[INTERNAL ERROR] cache mutex poisoned, cannot recover from this - aborting";

/// A bounded, expiring map from zone name to that zone's full record
/// set.  Snapshots are immutable: an invalidation drops the entry and
/// the next demand re-reads the store.
pub struct ZoneCache {
    store: Arc<dyn ZoneStore>,
    inner: Mutex<CacheInner>,
    flights: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    entry_ttl: Duration,
}

struct CacheInner {
    entries: HashMap<String, CachedZone>,

    /// Zone names ordered by last read, oldest first.  Used to pick
    /// eviction victims once the cache is over capacity.
    ///
    /// INVARIANT: the names in here are exactly the names in `entries`.
    access_priority: PriorityQueue<String, Reverse<Instant>>,

    /// Zone names ordered by expiry deadline, soonest first.
    ///
    /// INVARIANT: the names in here are exactly the names in `entries`.
    expiry_priority: PriorityQueue<String, Reverse<Instant>>,

    capacity: usize,
}

struct CachedZone {
    records: Arc<[ZoneRecord]>,
    expires_at: Instant,
}

impl ZoneCache {
    /// Create a cache with the given bounds.
    ///
    /// # Panics
    ///
    /// If called with a capacity of 0.
    pub fn new(store: Arc<dyn ZoneStore>, capacity: usize, entry_ttl: Duration) -> Self {
        assert!(capacity > 0, "cannot create a zero-capacity cache");

        Self {
            store,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                access_priority: PriorityQueue::new(),
                expiry_priority: PriorityQueue::new(),
                capacity,
            }),
            flights: AsyncMutex::new(HashMap::new()),
            entry_ttl,
        }
    }

    /// A snapshot of all records for the zone, from the cache if the
    /// entry is live, otherwise from the store.
    ///
    /// Zones with no records are never cached, so the "zone exists but
    /// is empty" case costs a store read each time; the existence
    /// filter is what keeps unknown zones away from here.
    ///
    /// # Errors
    ///
    /// If the store read fails.  The cache is left unchanged.
    pub async fn get_records(&self, zone_name: &str) -> Result<Arc<[ZoneRecord]>, StoreError> {
        if let Some(records) = self.lookup(zone_name) {
            return Ok(records);
        }

        let flight = {
            let mut flights = self.flights.lock().await;
            flights.entry(zone_name.to_string()).or_default().clone()
        };
        let _guard = flight.lock().await;

        // whoever held the guard before us may have already populated
        // the entry
        if let Some(records) = self.lookup(zone_name) {
            self.finish_flight(zone_name).await;
            return Ok(records);
        }

        let records = match self.store.records_for_zone(zone_name).await {
            Ok(records) => records,
            Err(error) => {
                self.finish_flight(zone_name).await;
                return Err(error);
            }
        };

        let records: Arc<[ZoneRecord]> = records.into();
        if !records.is_empty() {
            self.insert(zone_name, Arc::clone(&records));
        }
        self.finish_flight(zone_name).await;

        Ok(records)
    }

    /// Drop the entry for a zone, if any.
    pub fn invalidate(&self, zone_name: &str) {
        let mut inner = self.inner.lock().expect(MUTEX_POISON_MESSAGE);
        inner.remove_entry(zone_name);
    }

    /// How many zones are currently cached.
    pub fn len(&self) -> usize {
        self.inner.lock().expect(MUTEX_POISON_MESSAGE).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, zone_name: &str) -> Option<Arc<[ZoneRecord]>> {
        let mut inner = self.inner.lock().expect(MUTEX_POISON_MESSAGE);
        let now = Instant::now();

        let hit = match inner.entries.get(zone_name) {
            None => return None,
            Some(entry) if entry.expires_at <= now => None,
            Some(entry) => Some(Arc::clone(&entry.records)),
        };

        match hit {
            Some(records) => {
                inner
                    .access_priority
                    .change_priority(zone_name, Reverse(now));
                Some(records)
            }
            None => {
                inner.remove_entry(zone_name);
                None
            }
        }
    }

    fn insert(&self, zone_name: &str, records: Arc<[ZoneRecord]>) {
        let mut inner = self.inner.lock().expect(MUTEX_POISON_MESSAGE);
        let now = Instant::now();
        let expires_at = now + self.entry_ttl;

        inner.entries.insert(
            zone_name.to_string(),
            CachedZone {
                records,
                expires_at,
            },
        );
        inner.access_priority.push(zone_name.to_string(), Reverse(now));
        inner
            .expiry_priority
            .push(zone_name.to_string(), Reverse(expires_at));
        inner.evict(now);
    }

    async fn finish_flight(&self, zone_name: &str) {
        let mut flights = self.flights.lock().await;
        flights.remove(zone_name);
    }
}

impl CacheInner {
    fn remove_entry(&mut self, zone_name: &str) {
        self.entries.remove(zone_name);
        self.access_priority.remove(zone_name);
        self.expiry_priority.remove(zone_name);
    }

    /// Clear expired entries, then if still over capacity evict in LRU
    /// order.
    fn evict(&mut self, now: Instant) {
        loop {
            let due = matches!(self.expiry_priority.peek(), Some((_, Reverse(e))) if *e <= now);
            if !due {
                break;
            }
            if let Some((zone_name, _)) = self.expiry_priority.pop() {
                self.entries.remove(&zone_name);
                self.access_priority.remove(&zone_name);
            }
        }

        while self.entries.len() > self.capacity {
            let Some((zone_name, _)) = self.access_priority.pop() else {
                break;
            };
            self.entries.remove(&zone_name);
            self.expiry_priority.remove(&zone_name);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::test_util::{record, MemoryStore};

    fn cache_over(store: Arc<MemoryStore>) -> ZoneCache {
        ZoneCache::new(store, DEFAULT_CAPACITY, DEFAULT_ENTRY_TTL)
    }

    #[tokio::test]
    async fn get_records_fetches_once_and_caches() {
        let store = Arc::new(MemoryStore::new());
        store.add_record(record("example.com", "api.example.com", "A", "203.0.113.5", 60, 0));
        let cache = cache_over(Arc::clone(&store));

        let first = cache.get_records("example.com").await.unwrap();
        let second = cache.get_records("example.com").await.unwrap();

        assert_eq!(1, first.len());
        assert_eq!(first, second);
        assert_eq!(1, store.record_fetches());
    }

    #[tokio::test]
    async fn empty_zones_are_not_cached() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_over(Arc::clone(&store));

        assert!(cache.get_records("empty.example").await.unwrap().is_empty());
        assert!(cache.get_records("empty.example").await.unwrap().is_empty());

        assert_eq!(2, store.record_fetches());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn invalidate_forces_a_fresh_store_read() {
        let store = Arc::new(MemoryStore::new());
        store.add_record(record("example.com", "api.example.com", "A", "203.0.113.5", 60, 0));
        let cache = cache_over(Arc::clone(&store));

        cache.get_records("example.com").await.unwrap();
        cache.invalidate("example.com");
        cache.get_records("example.com").await.unwrap();

        assert_eq!(2, store.record_fetches());
    }

    #[tokio::test]
    async fn expired_entries_are_refetched() {
        let store = Arc::new(MemoryStore::new());
        store.add_record(record("example.com", "api.example.com", "A", "203.0.113.5", 60, 0));
        let store_dyn: Arc<dyn ZoneStore> = store.clone();
        let cache = ZoneCache::new(store_dyn, DEFAULT_CAPACITY, Duration::ZERO);

        cache.get_records("example.com").await.unwrap();
        cache.get_records("example.com").await.unwrap();

        assert_eq!(2, store.record_fetches());
    }

    #[tokio::test]
    async fn over_capacity_evicts_least_recently_used() {
        let store = Arc::new(MemoryStore::new());
        for zone in ["a.example", "b.example", "c.example"] {
            store.add_record(record(zone, &format!("www.{zone}"), "A", "203.0.113.5", 60, 0));
        }
        let store_dyn: Arc<dyn ZoneStore> = store.clone();
        let cache = ZoneCache::new(store_dyn, 2, DEFAULT_ENTRY_TTL);

        cache.get_records("a.example").await.unwrap();
        cache.get_records("b.example").await.unwrap();
        // reading "a" makes "b" the eviction victim
        cache.get_records("a.example").await.unwrap();
        cache.get_records("c.example").await.unwrap();

        assert_eq!(2, cache.len());
        let fetches = store.record_fetches();
        cache.get_records("a.example").await.unwrap();
        assert_eq!(fetches, store.record_fetches());
        cache.get_records("b.example").await.unwrap();
        assert_eq!(fetches + 1, store.record_fetches());
    }

    #[tokio::test]
    async fn concurrent_misses_collapse_to_a_single_fetch() {
        let store = Arc::new(MemoryStore::with_fetch_delay(Duration::from_millis(20)));
        store.add_record(record("example.com", "api.example.com", "A", "203.0.113.5", 60, 0));
        let cache = Arc::new(cache_over(Arc::clone(&store)));

        let successes = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..32 {
            let cache = Arc::clone(&cache);
            let successes = Arc::clone(&successes);
            handles.push(tokio::spawn(async move {
                let records = cache.get_records("example.com").await.unwrap();
                assert_eq!(1, records.len());
                successes.fetch_add(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(32, successes.load(Ordering::SeqCst));
        assert_eq!(1, store.record_fetches());
    }
}
