//! Top-level database facade
//!
//! Wires the factory, pool, optimizer, health checker, and recovery
//! executor together behind the three calls collaborators use:
//! `execute_query`, `execute_transaction`, and `acquire_connection`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::CacheStats;
use crate::errors::Result;
use crate::factory::{ConnectionFactory, FactoryConfig};
use crate::health::{HealthChecker, HealthCheckResult, HealthConfig};
use crate::metrics::MetricsRegistry;
use crate::optimizer::{OptimizerConfig, QueryOptimizer};
use crate::pool::{ConnectionPool, PoolConfig, PooledConnection, PoolStats};
use crate::query::{QueryOptions, QueryOutput, SqlValue, Statement};
use crate::recovery::{RecoveryConfig, RecoveryExecutor};

/// Configuration for every layer of one database.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub factory: FactoryConfig,
    pub pool: PoolConfig,
    pub optimizer: OptimizerConfig,
    pub health: HealthConfig,
    pub recovery: RecoveryConfig,
}

/// Combined statistics snapshot for external sinks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub path: String,
    pub pool: PoolStats,
    pub cache: CacheStats,
    pub queries_total: u64,
    pub queries_failed: u64,
    pub lock_waits_total: u64,
}

/// One managed database file: pool, query routing, and self-healing.
pub struct Database {
    path: PathBuf,
    pool: ConnectionPool,
    optimizer: QueryOptimizer,
    health: Arc<HealthChecker>,
    recovery: RecoveryExecutor,
}

impl Database {
    /// Open the database and pre-create the minimum pool connections.
    /// Background loops stay off until [`Database::start`].
    pub async fn open(path: impl AsRef<Path>, config: DatabaseConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let factory = Arc::new(ConnectionFactory::new(&path, config.factory));
        let pool = ConnectionPool::new(Arc::clone(&factory), config.pool)?;
        pool.initialize().await?;

        let optimizer = QueryOptimizer::new(pool.clone(), config.optimizer)?;
        let health = Arc::new(HealthChecker::new(
            pool.clone(),
            Arc::clone(&factory),
            config.health,
        ));
        let recovery = RecoveryExecutor::new(pool.clone(), factory, config.recovery);

        info!(path = %path.display(), "database opened");
        Ok(Self {
            path,
            pool,
            optimizer,
            health,
            recovery,
        })
    }

    /// Start the pool maintenance and auto-recovery background loops.
    pub fn start(&self) {
        self.pool.start_maintenance();
        self.recovery.start_auto_recovery(Arc::clone(&self.health));
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Execute one statement through classification, admission control,
    /// caching, and lock-error retry.
    pub async fn execute_query(
        &self,
        sql: &str,
        params: &[SqlValue],
        opts: QueryOptions,
    ) -> Result<QueryOutput> {
        self.optimizer.execute(sql, params, &opts).await
    }

    /// Execute a batch of statements as one atomic, serialized transaction.
    pub async fn execute_transaction(&self, ops: &[Statement]) -> Result<Vec<QueryOutput>> {
        self.optimizer.execute_transaction(ops).await
    }

    /// Acquire a raw pooled connection. The guard releases the connection
    /// on drop on every exit path; bypasses admission control and caching.
    pub async fn acquire_connection(&self, timeout: Duration) -> Result<PooledConnection> {
        self.pool.acquire(timeout).await
    }

    /// Run one health check cycle now.
    pub async fn run_health_checks(&self) -> Vec<HealthCheckResult> {
        self.health.run_health_checks().await
    }

    pub fn health(&self) -> &HealthChecker {
        &self.health
    }

    pub fn recovery(&self) -> &RecoveryExecutor {
        &self.recovery
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        self.optimizer.metrics()
    }

    pub fn stats(&self) -> DatabaseStats {
        let metrics = self.optimizer.metrics();
        DatabaseStats {
            path: self.path.display().to_string(),
            pool: self.pool.stats(),
            cache: self.optimizer.cache_stats(),
            queries_total: metrics.queries_total(),
            queries_failed: metrics.queries_failed(),
            lock_waits_total: metrics.lock_waits_total(),
        }
    }

    /// Stop background loops and close the pool. In-flight guards release
    /// their connections as they drop.
    pub async fn shutdown(&self) {
        self.recovery.stop();
        self.pool.close().await;
        info!(path = %self.path.display(), "database shut down");
    }
}
