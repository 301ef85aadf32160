//! Per-query execution metrics
//!
//! Aggregates timing and failure counts per normalized-SQL fingerprint.
//! The registry has its own lock so recording never contends with the
//! execution path: query execution takes pool and admission locks, metrics
//! take only this one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Cumulative statistics for one query shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryStats {
    /// Normalized SQL text this entry aggregates.
    pub query: String,
    pub count: u64,
    pub error_count: u64,
    /// Executions that hit at least one transient lock error before
    /// completing.
    pub lock_wait_count: u64,
    pub total_duration: Duration,
    pub min_duration: Duration,
    pub max_duration: Duration,
}

impl QueryStats {
    fn new(query: String) -> Self {
        Self {
            query,
            count: 0,
            error_count: 0,
            lock_wait_count: 0,
            total_duration: Duration::ZERO,
            min_duration: Duration::MAX,
            max_duration: Duration::ZERO,
        }
    }

    pub fn avg_duration(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total_duration / self.count as u32
        }
    }
}

/// Registry of per-query statistics plus process-wide counters.
#[derive(Default)]
pub struct MetricsRegistry {
    entries: RwLock<HashMap<u64, QueryStats>>,
    queries_total: AtomicU64,
    queries_failed: AtomicU64,
    lock_waits_total: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one execution under the given fingerprint.
    pub fn record(
        &self,
        key: u64,
        normalized_sql: &str,
        duration: Duration,
        failed: bool,
        lock_waited: bool,
    ) {
        self.queries_total.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.queries_failed.fetch_add(1, Ordering::Relaxed);
        }
        if lock_waited {
            self.lock_waits_total.fetch_add(1, Ordering::Relaxed);
        }

        let mut entries = self.entries.write();
        let stats = entries
            .entry(key)
            .or_insert_with(|| QueryStats::new(normalized_sql.to_string()));
        stats.count += 1;
        if failed {
            stats.error_count += 1;
        }
        if lock_waited {
            stats.lock_wait_count += 1;
        }
        stats.total_duration += duration;
        stats.min_duration = stats.min_duration.min(duration);
        stats.max_duration = stats.max_duration.max(duration);
    }

    pub fn queries_total(&self) -> u64 {
        self.queries_total.load(Ordering::Relaxed)
    }

    pub fn queries_failed(&self) -> u64 {
        self.queries_failed.load(Ordering::Relaxed)
    }

    pub fn lock_waits_total(&self) -> u64 {
        self.lock_waits_total.load(Ordering::Relaxed)
    }

    pub fn get(&self, key: u64) -> Option<QueryStats> {
        self.entries.read().get(&key).cloned()
    }

    pub fn snapshot(&self) -> Vec<QueryStats> {
        self.entries.read().values().cloned().collect()
    }

    /// The `limit` slowest query shapes by average duration.
    pub fn slowest(&self, limit: usize) -> Vec<QueryStats> {
        let mut all = self.snapshot();
        all.sort_by(|a, b| b.avg_duration().cmp(&a.avg_duration()));
        all.truncate(limit);
        all
    }

    /// Drop all per-query entries. Process-wide counters keep counting.
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::metrics_key;

    #[test]
    fn test_record_aggregates() {
        let registry = MetricsRegistry::new();
        let key = metrics_key("SELECT * FROM t");

        registry.record(key, "SELECT * FROM t", Duration::from_millis(10), false, false);
        registry.record(key, "SELECT * FROM t", Duration::from_millis(30), false, true);
        registry.record(key, "SELECT * FROM t", Duration::from_millis(20), true, false);

        let stats = registry.get(key).unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.lock_wait_count, 1);
        assert_eq!(stats.min_duration, Duration::from_millis(10));
        assert_eq!(stats.max_duration, Duration::from_millis(30));
        assert_eq!(stats.avg_duration(), Duration::from_millis(20));
        assert_eq!(registry.queries_total(), 3);
        assert_eq!(registry.queries_failed(), 1);
    }

    #[test]
    fn test_slowest_ordering() {
        let registry = MetricsRegistry::new();
        registry.record(1, "fast", Duration::from_millis(1), false, false);
        registry.record(2, "slow", Duration::from_millis(100), false, false);
        registry.record(3, "medium", Duration::from_millis(50), false, false);

        let top = registry.slowest(2);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].query, "slow");
        assert_eq!(top[1].query, "medium");
    }

    #[test]
    fn test_clear_resets_entries() {
        let registry = MetricsRegistry::new();
        registry.record(1, "q", Duration::from_millis(1), false, false);
        registry.clear();
        assert!(registry.get(1).is_none());
        assert!(registry.snapshot().is_empty());
        // Counters survive a clear.
        assert_eq!(registry.queries_total(), 1);
    }
}
