//! Concurrency-safe access layer for single-file SQLite databases.
//!
//! Many independent tasks, one database file, one writer at a time:
//! - Validated, dynamically-sized connection pool
//! - Exponential backoff + jitter retry for transient lock errors
//! - Query classification with read/write admission control and a TTL
//!   result cache
//! - Scored health checks driving cooldown-gated recovery actions

pub mod cache;
pub mod database;
pub mod errors;
pub mod factory;
pub mod health;
pub mod metrics;
pub mod optimizer;
pub mod pool;
pub mod query;
pub mod recovery;
pub mod registry;
pub mod retry;

pub use database::{Database, DatabaseConfig, DatabaseStats};
pub use errors::{LatchError, Result};
pub use factory::{ConnectionFactory, FactoryConfig, SqliteConnection};
pub use health::{HealthCheckResult, HealthChecker, HealthConfig, HealthStatus};
pub use optimizer::{OptimizerConfig, QueryOptimizer};
pub use pool::{ConnectionPool, PoolConfig, PooledConnection, PoolStats};
pub use query::{Priority, QueryKind, QueryOptions, QueryOutput, SqlValue, Statement};
pub use recovery::{RecoveryAction, RecoveryAttempt, RecoveryConfig, RecoveryExecutor};
pub use registry::PoolRegistry;
pub use retry::{classify, execute_with_retry, execute_with_retry_classified, ErrorClass, RetryStrategy};
