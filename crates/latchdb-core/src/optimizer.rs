//! Query routing, admission control, and execution
//!
//! The optimizer classifies every statement, bounds how many of each class
//! run at once, and wraps execution in the lock-error retry policy:
//! - Reads share a counting semaphore and may be served from the result
//!   cache.
//! - Writes, DDL, transactions, and anything ambiguous serialize on a
//!   single process-wide write mutex (the database allows one writer) and
//!   additionally draw from a small write permit pool.
//!
//! Admission permits are guard-scoped, so they release on every exit path
//! including errors and timeouts.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tracing::{instrument, trace};

use crate::cache::{CacheConfig, CacheStats, QueryCache};
use crate::errors::{LatchError, Result};
use crate::metrics::MetricsRegistry;
use crate::pool::ConnectionPool;
use crate::query::{
    fingerprint, metrics_key, normalize_sql, QueryKind, QueryOptions, QueryOutput, QueryRequest,
    SqlValue, Statement,
};
use crate::retry::{execute_with_retry, RetryStrategy};

/// Optimizer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Concurrent read statements admitted at once
    pub max_concurrent_reads: usize,
    /// Concurrent write-class operations admitted at once; actual execution
    /// is still serialized by the write mutex
    pub max_concurrent_writes: usize,
    /// Result cache settings
    pub cache: CacheConfig,
    /// Retry strategy applied to transient lock errors
    pub retry: RetryStrategy,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_reads: 16,
            max_concurrent_writes: 4,
            cache: CacheConfig::default(),
            retry: RetryStrategy::aggressive(),
        }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_reads == 0 || self.max_concurrent_writes == 0 {
            return Err(LatchError::InvalidConfig(
                "admission limits must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Admission guards held for the duration of one execution.
enum Admission {
    Read(#[allow(dead_code)] OwnedSemaphorePermit),
    Write(
        #[allow(dead_code)] OwnedMutexGuard<()>,
        #[allow(dead_code)] OwnedSemaphorePermit,
    ),
}

/// Classifying query router with admission control, caching, and metrics.
pub struct QueryOptimizer {
    pool: ConnectionPool,
    config: OptimizerConfig,
    read_permits: Arc<Semaphore>,
    write_permits: Arc<Semaphore>,
    write_lock: Arc<tokio::sync::Mutex<()>>,
    cache: QueryCache,
    metrics: MetricsRegistry,
}

impl QueryOptimizer {
    pub fn new(pool: ConnectionPool, config: OptimizerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            read_permits: Arc::new(Semaphore::new(config.max_concurrent_reads)),
            write_permits: Arc::new(Semaphore::new(config.max_concurrent_writes)),
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
            cache: QueryCache::new(config.cache.clone()),
            metrics: MetricsRegistry::new(),
            pool,
            config,
        })
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Execute one statement with classification, admission control,
    /// caching, and lock-error retry.
    #[instrument(skip(self, params), fields(priority = ?opts.priority))]
    pub async fn execute(
        &self,
        sql: &str,
        params: &[SqlValue],
        opts: &QueryOptions,
    ) -> Result<QueryOutput> {
        let request = QueryRequest::new(sql, params, opts.priority);
        match opts.timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, self.execute_inner(&request, opts)).await {
                    Ok(result) => result,
                    Err(_) => Err(LatchError::QueryTimeout {
                        waited_ms: limit.as_millis() as u64,
                    }),
                }
            }
            None => self.execute_inner(&request, opts).await,
        }
    }

    async fn execute_inner(
        &self,
        request: &QueryRequest,
        opts: &QueryOptions,
    ) -> Result<QueryOutput> {
        let cacheable = request.kind.is_read() && opts.enable_cache;
        let cache_key = fingerprint(&request.sql, &request.params);

        if cacheable {
            if let Some(hit) = self.cache.get(&cache_key) {
                trace!("result cache hit");
                return Ok(hit);
            }
        }

        let _admission = self.admit(request.kind).await?;

        let normalized = normalize_sql(&request.sql);
        let key = metrics_key(&request.sql);
        let attempts = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let result = execute_with_retry(&self.config.retry, || {
            let attempts = Arc::clone(&attempts);
            async move {
                attempts.fetch_add(1, Ordering::Relaxed);
                let mut conn = self
                    .pool
                    .acquire(self.pool.config().acquire_timeout)
                    .await?;
                conn.execute(&request.sql, &request.params).await
            }
        })
        .await;

        let lock_waited = attempts.load(Ordering::Relaxed) > 1;
        self.metrics.record(
            key,
            &normalized,
            start.elapsed(),
            result.is_err(),
            lock_waited,
        );

        let output = result?;
        if cacheable {
            self.cache.put(cache_key, output.clone());
        }
        Ok(output)
    }

    /// Execute a batch of statements as one serialized transaction.
    #[instrument(skip(self, ops), fields(statements = ops.len()))]
    pub async fn execute_transaction(&self, ops: &[Statement]) -> Result<Vec<QueryOutput>> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }

        let _admission = self.admit(QueryKind::Transaction).await?;

        let normalized = ops
            .iter()
            .map(|op| normalize_sql(&op.sql))
            .collect::<Vec<_>>()
            .join("; ");
        let key = metrics_key(&normalized);
        let attempts = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let result = execute_with_retry(&self.config.retry, || {
            let attempts = Arc::clone(&attempts);
            async move {
                attempts.fetch_add(1, Ordering::Relaxed);
                let mut conn = self
                    .pool
                    .acquire(self.pool.config().acquire_timeout)
                    .await?;
                conn.transaction(ops).await
            }
        })
        .await;

        let lock_waited = attempts.load(Ordering::Relaxed) > 1;
        self.metrics.record(
            key,
            &normalized,
            start.elapsed(),
            result.is_err(),
            lock_waited,
        );
        result
    }

    /// Take the admission guards for one operation of the given class.
    ///
    /// Write-class operations take the global write mutex first, then a
    /// write permit, so writers queue in one place and can never starve
    /// reads of their separate permit pool.
    async fn admit(&self, kind: QueryKind) -> Result<Admission> {
        match kind {
            QueryKind::Read => {
                let permit = self
                    .read_permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| LatchError::Internal("read semaphore closed".into()))?;
                Ok(Admission::Read(permit))
            }
            _ => {
                let lock = self.write_lock.clone().lock_owned().await;
                let permit = self
                    .write_permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| LatchError::Internal("write semaphore closed".into()))?;
                Ok(Admission::Write(lock, permit))
            }
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::{ConnectionFactory, FactoryConfig};
    use crate::pool::PoolConfig;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn test_optimizer(dir: &TempDir, config: OptimizerConfig) -> QueryOptimizer {
        let factory = Arc::new(ConnectionFactory::new(
            dir.path().join("opt.db"),
            FactoryConfig::default(),
        ));
        let pool = ConnectionPool::new(factory, PoolConfig::default()).unwrap();
        pool.initialize().await.unwrap();
        QueryOptimizer::new(pool, config).unwrap()
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let optimizer = test_optimizer(&dir, OptimizerConfig::default()).await;
        let opts = QueryOptions::default();

        optimizer
            .execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)", &[], &opts)
            .await
            .unwrap();
        let ins = optimizer
            .execute(
                "INSERT INTO t (v) VALUES (?1)",
                &[SqlValue::from("x")],
                &opts,
            )
            .await
            .unwrap();
        assert_eq!(ins.rows_affected, 1);

        let sel = optimizer
            .execute("SELECT v FROM t", &[], &opts)
            .await
            .unwrap();
        assert_eq!(sel.rows.len(), 1);
        assert!(!sel.cached);
    }

    #[tokio::test]
    async fn test_cache_hit_and_expiry() {
        let dir = TempDir::new().unwrap();
        let optimizer = test_optimizer(
            &dir,
            OptimizerConfig {
                cache: CacheConfig {
                    ttl: Duration::from_millis(80),
                    ..Default::default()
                },
                ..Default::default()
            },
        )
        .await;
        let opts = QueryOptions::default();

        optimizer
            .execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)", &[], &opts)
            .await
            .unwrap();
        optimizer
            .execute(
                "INSERT INTO t (v) VALUES (?1)",
                &[SqlValue::from("cached")],
                &opts,
            )
            .await
            .unwrap();

        let first = optimizer
            .execute("SELECT v FROM t", &[], &opts)
            .await
            .unwrap();
        assert!(!first.cached);

        // Writes do not invalidate; within the TTL the old rows come back.
        optimizer
            .execute(
                "INSERT INTO t (v) VALUES (?1)",
                &[SqlValue::from("newer")],
                &opts,
            )
            .await
            .unwrap();
        let second = optimizer
            .execute("SELECT v FROM t", &[], &opts)
            .await
            .unwrap();
        assert!(second.cached);
        assert_eq!(second.rows, first.rows);

        // After expiry the query re-executes and sees the new row.
        tokio::time::sleep(Duration::from_millis(120)).await;
        let third = optimizer
            .execute("SELECT v FROM t", &[], &opts)
            .await
            .unwrap();
        assert!(!third.cached);
        assert_eq!(third.rows.len(), 2);
    }

    #[tokio::test]
    async fn test_cache_disabled_per_call() {
        let dir = TempDir::new().unwrap();
        let optimizer = test_optimizer(&dir, OptimizerConfig::default()).await;
        let opts = QueryOptions::default();

        optimizer
            .execute("CREATE TABLE t (id INTEGER PRIMARY KEY)", &[], &opts)
            .await
            .unwrap();

        let no_cache = QueryOptions {
            enable_cache: false,
            ..Default::default()
        };
        optimizer
            .execute("SELECT COUNT(*) FROM t", &[], &no_cache)
            .await
            .unwrap();
        let again = optimizer
            .execute("SELECT COUNT(*) FROM t", &[], &no_cache)
            .await
            .unwrap();
        assert!(!again.cached);
        assert_eq!(optimizer.cache_stats().entries, 0);
    }

    #[tokio::test]
    async fn test_transaction_is_atomic() {
        let dir = TempDir::new().unwrap();
        let optimizer = test_optimizer(&dir, OptimizerConfig::default()).await;
        let opts = QueryOptions::default();

        optimizer
            .execute("CREATE TABLE t (id INTEGER PRIMARY KEY)", &[], &opts)
            .await
            .unwrap();

        let bad = vec![
            Statement::new("INSERT INTO t (id) VALUES (1)", vec![]),
            Statement::new("INSERT INTO missing (id) VALUES (2)", vec![]),
        ];
        assert!(optimizer.execute_transaction(&bad).await.is_err());

        let count = optimizer
            .execute("SELECT COUNT(*) FROM t", &[], &opts)
            .await
            .unwrap();
        assert_eq!(count.rows[0][0], SqlValue::Integer(0));
    }

    #[tokio::test]
    async fn test_fatal_error_propagates_unchanged() {
        let dir = TempDir::new().unwrap();
        let optimizer = test_optimizer(&dir, OptimizerConfig::default()).await;

        let err = optimizer
            .execute("SELECT * FROM no_such_table", &[], &QueryOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LatchError::Sqlite(_)));
        assert_eq!(optimizer.metrics().queries_failed(), 1);
    }

    #[tokio::test]
    async fn test_metrics_recorded_per_query_shape() {
        let dir = TempDir::new().unwrap();
        let optimizer = test_optimizer(&dir, OptimizerConfig::default()).await;
        let opts = QueryOptions {
            enable_cache: false,
            ..Default::default()
        };

        optimizer
            .execute("CREATE TABLE t (id INTEGER PRIMARY KEY)", &[], &opts)
            .await
            .unwrap();
        for _ in 0..3 {
            optimizer
                .execute("SELECT COUNT(*) FROM t", &[], &opts)
                .await
                .unwrap();
        }

        let key = metrics_key("SELECT COUNT(*) FROM t");
        let stats = optimizer.metrics().get(key).unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.error_count, 0);
    }

    #[tokio::test]
    async fn test_query_timeout_is_typed() {
        let dir = TempDir::new().unwrap();
        let optimizer = test_optimizer(&dir, OptimizerConfig::default()).await;

        let opts = QueryOptions {
            timeout: Some(Duration::from_nanos(1)),
            ..Default::default()
        };
        let err = optimizer
            .execute("SELECT 1", &[], &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, LatchError::QueryTimeout { .. }));
    }
}
