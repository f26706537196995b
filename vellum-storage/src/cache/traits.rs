//! Cache abstraction and statistics.
//!
//! The repository layer only talks to caches through [`Cache`], so any
//! concurrent map with expiry can back it. [`super::TtlCache`] is the
//! implementation used by the facade.

/// Key/value cache with explicit invalidation.
///
/// Implementations must be thread-safe. `invalidate` is idempotent: removing
/// an absent key is a no-op, which is what makes at-least-once invalidation
/// delivery safe.
pub trait Cache<K, V>: Send + Sync {
    /// Get a live value, or `None` on miss or expiry.
    fn get(&self, key: &K) -> Option<V>;

    /// Insert or overwrite a value, resetting its age.
    fn put(&self, key: K, value: V);

    /// Remove one key. Returns whether an entry was removed.
    fn invalidate(&self, key: &K) -> bool;

    /// Remove every entry matching `predicate`. Returns the number removed.
    fn invalidate_if(&self, predicate: &dyn Fn(&K, &V) -> bool) -> usize;

    /// Remove every entry.
    fn invalidate_all(&self);

    /// Counters since construction, plus the current entry count.
    fn stats(&self) -> CacheStats;
}

/// Point-in-time counters of one cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Live entries, expired ones not yet swept included.
    pub entry_count: u64,
    /// Entries dropped by expiry or capacity, not by invalidation.
    pub evictions: u64,
}

impl CacheStats {
    /// Fraction of lookups served from the cache; zero before any lookup.
    pub fn hit_rate(&self) -> f64 {
        match self.hits + self.misses {
            0 => 0.0,
            lookups => self.hits as f64 / lookups as f64,
        }
    }
}

/// Anything that can report [`CacheStats`] to a metrics sink.
pub trait StatsSource: Send + Sync {
    fn stats(&self) -> CacheStats;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_rate_counts_only_lookups() {
        let warm = CacheStats {
            hits: 3,
            misses: 1,
            entry_count: 40,
            evictions: 7,
        };
        assert_eq!(warm.hit_rate(), 0.75);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }
}
