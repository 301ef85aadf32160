//! Query result caching
//!
//! Short-TTL cache for read results, keyed by a fingerprint of normalized
//! SQL plus parameters. The cache is a bounded map evicted in insertion
//! order; writes never invalidate entries, so the staleness window is
//! bounded by the TTL and callers needing strict freshness disable caching
//! per call.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::query::QueryOutput;

pub type CacheKey = [u8; 32];

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of cached results
    pub max_entries: usize,
    /// How long a cached result stays servable
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            ttl: Duration::from_secs(300), // 5 minutes
        }
    }
}

struct CacheEntry {
    output: QueryOutput,
    created_at: Instant,
}

struct CacheInner {
    entries: HashMap<CacheKey, CacheEntry>,
    /// Insertion order; stale keys are skipped at eviction time.
    order: VecDeque<CacheKey>,
}

/// Cache hit/miss statistics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
    pub expired: u64,
    pub hit_ratio: f64,
}

/// Bounded TTL cache for read query results.
pub struct QueryCache {
    config: CacheConfig,
    inner: Mutex<CacheInner>,
    hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    evictions: AtomicU64,
    expired: AtomicU64,
}

impl QueryCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            insertions: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    /// Look up a cached result. Expired entries are removed on access.
    pub fn get(&self, key: &CacheKey) -> Option<QueryOutput> {
        let mut inner = self.inner.lock();
        match inner.entries.get(key) {
            Some(entry) if entry.created_at.elapsed() <= self.config.ttl => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                let mut output = entry.output.clone();
                output.cached = true;
                Some(output)
            }
            Some(_) => {
                inner.entries.remove(key);
                self.expired.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert a result, evicting oldest-inserted entries over the cap.
    pub fn put(&self, key: CacheKey, output: QueryOutput) {
        let mut inner = self.inner.lock();

        if inner.entries.insert(key, CacheEntry {
            output,
            created_at: Instant::now(),
        }).is_none()
        {
            inner.order.push_back(key);
        }
        self.insertions.fetch_add(1, Ordering::Relaxed);

        while inner.entries.len() > self.config.max_entries {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            // Keys already removed by expiry just fall out of the queue.
            if inner.entries.remove(&oldest).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                trace!("evicted oldest cache entry");
            }
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.inner.lock().entries.len();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            entries,
            hits,
            misses,
            insertions: self.insertions.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            hit_ratio: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{fingerprint, SqlValue};

    fn output(n: i64) -> QueryOutput {
        QueryOutput::rows_only(vec!["n".into()], vec![vec![SqlValue::Integer(n)]])
    }

    #[test]
    fn test_hit_within_ttl() {
        let cache = QueryCache::new(CacheConfig::default());
        let key = fingerprint("SELECT 1", &[]);
        cache.put(key, output(1));

        let hit = cache.get(&key).unwrap();
        assert!(hit.cached);
        assert_eq!(hit.rows, output(1).rows);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_expiry_after_ttl() {
        let cache = QueryCache::new(CacheConfig {
            ttl: Duration::from_millis(10),
            ..Default::default()
        });
        let key = fingerprint("SELECT 1", &[]);
        cache.put(key, output(1));

        std::thread::sleep(Duration::from_millis(25));
        assert!(cache.get(&key).is_none());
        assert_eq!(cache.stats().expired, 1);
    }

    #[test]
    fn test_eviction_is_insertion_ordered() {
        let cache = QueryCache::new(CacheConfig {
            max_entries: 2,
            ..Default::default()
        });
        let k1 = fingerprint("SELECT 1", &[]);
        let k2 = fingerprint("SELECT 2", &[]);
        let k3 = fingerprint("SELECT 3", &[]);

        cache.put(k1, output(1));
        cache.put(k2, output(2));
        // Touching k1 must not protect it; order is insertion, not recency.
        cache.get(&k1);
        cache.put(k3, output(3));

        assert!(cache.get(&k1).is_none());
        assert!(cache.get(&k2).is_some());
        assert!(cache.get(&k3).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_reinsert_keeps_original_position() {
        let cache = QueryCache::new(CacheConfig {
            max_entries: 2,
            ..Default::default()
        });
        let k1 = fingerprint("SELECT 1", &[]);
        let k2 = fingerprint("SELECT 2", &[]);
        let k3 = fingerprint("SELECT 3", &[]);

        cache.put(k1, output(1));
        cache.put(k2, output(2));
        cache.put(k1, output(10)); // refresh value, same key
        cache.put(k3, output(3));

        // k1 was inserted first and is still the eviction victim.
        assert!(cache.get(&k1).is_none());
        assert!(cache.get(&k2).is_some());
    }
}
