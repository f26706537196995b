//! Sharded TTL cache.
//!
//! Entries expire lazily on access and through an optional background sweep.
//! The entry count is bounded; when full, the oldest insertion still present
//! is dropped. Insertion order lives in a queue next to the map, so making
//! room never scans the whole cache.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::traits::{Cache, CacheStats, StatsSource};

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    /// Insertion sequence number, matched against the order queue.
    seq: u64,
    expires_at: Instant,
}

/// Concurrent cache with absolute time-to-live and a size bound.
#[derive(Debug)]
pub struct TtlCache<K, V>
where
    K: Eq + Hash,
{
    name: String,
    entries: DashMap<K, Entry<V>>,
    /// `(key, seq)` per insertion, oldest first. Overwritten and removed keys
    /// leave stale pairs behind that are skipped or compacted away.
    order: Mutex<VecDeque<(K, u64)>>,
    next_seq: AtomicU64,
    ttl: Duration,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache.
    ///
    /// `concurrency_level` is rounded up to the next power of two (minimum 2)
    /// and used as the shard count.
    pub fn new(name: impl Into<String>, ttl: Duration, max_entries: usize, concurrency_level: usize) -> Self {
        let shards = concurrency_level.max(2).next_power_of_two();
        Self {
            name: name.into(),
            entries: DashMap::with_capacity_and_shard_amount(max_entries.min(1024), shards),
            order: Mutex::new(VecDeque::new()),
            next_seq: AtomicU64::new(0),
            ttl,
            max_entries: max_entries.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of physically stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `key` is physically stored, without touching the counters.
    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert with an entry-specific time-to-live.
    pub fn put_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let now = Instant::now();
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_entries {
            self.make_room();
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            key.clone(),
            Entry {
                value,
                seq,
                expires_at: now + ttl,
            },
        );

        let mut order = self.order.lock().unwrap_or_else(PoisonError::into_inner);
        order.push_back((key, seq));
        if order.len() > self.max_entries.saturating_mul(2).max(64) {
            order.retain(|(key, seq)| self.entries.get(key).is_some_and(|e| e.seq == *seq));
        }
    }

    /// Remove every expired entry. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        let removed = before.saturating_sub(self.entries.len());
        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Run [`Self::sweep`] every `period` until the cache is dropped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // First tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let removed = cache.sweep();
                if removed > 0 {
                    tracing::debug!(cache = %cache.name, removed, "Swept expired cache entries");
                }
            }
        })
    }

    /// Drop the oldest insertion that is still live in the map.
    fn make_room(&self) {
        let mut order = self.order.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some((key, seq)) = order.pop_front() {
            if self.entries.remove_if(&key, |_, e| e.seq == seq).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
    }
}

impl<K, V> Cache<K, V> for TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
        }
        // The read guard is released before removing from the same shard.
        if self
            .entries
            .remove_if(key, |_, entry| entry.expires_at <= now)
            .is_some()
        {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    fn put(&self, key: K, value: V) {
        self.put_with_ttl(key, value, self.ttl);
    }

    fn invalidate(&self, key: &K) -> bool {
        self.entries.remove(key).is_some()
    }

    fn invalidate_if(&self, predicate: &dyn Fn(&K, &V) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, entry| !predicate(key, &entry.value));
        before.saturating_sub(self.entries.len())
    }

    fn invalidate_all(&self) {
        self.entries.clear();
        self.order
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: self.entries.len() as u64,
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

impl<K, V> StatsSource for TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn stats(&self) -> CacheStats {
        Cache::stats(self)
    }
}
