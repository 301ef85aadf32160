//! Health checking and scoring
//!
//! Each check cycle produces one scored result per component (the pool and
//! the database file). Scores start at 1.0 and lose fixed penalties for
//! observed problems; status is derived from the final score. Results are
//! kept in a bounded ring buffer so callers can query recent trends.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::factory::ConnectionFactory;
use crate::pool::ConnectionPool;

pub const POOL_COMPONENT: &str = "pool";
pub const DATABASE_COMPONENT: &str = "database";

/// Component status derived from its health score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Warning,
    Degraded,
    Critical,
    Unknown,
}

impl HealthStatus {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.9 {
            HealthStatus::Healthy
        } else if score >= 0.7 {
            HealthStatus::Warning
        } else if score >= 0.4 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Critical
        }
    }
}

/// One component's result for one check cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub component: String,
    pub status: HealthStatus,
    /// Normalized score in [0, 1].
    pub score: f64,
    pub message: String,
    /// Structured evidence backing the score.
    pub evidence: serde_json::Value,
    pub checked_at: SystemTime,
}

impl HealthCheckResult {
    fn new(component: &str, score: f64, message: String, evidence: serde_json::Value) -> Self {
        let score = score.clamp(0.0, 1.0);
        Self {
            component: component.to_string(),
            status: HealthStatus::from_score(score),
            score,
            message,
            evidence,
            checked_at: SystemTime::now(),
        }
    }
}

/// Health checker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Probe latency above this costs a penalty
    pub slow_probe_threshold: Duration,
    /// Connection count above this soft limit costs a penalty
    pub soft_connection_limit: usize,
    /// Freelist fraction above this costs a penalty
    pub fragmentation_threshold: f64,
    /// Ring buffer capacity for recent results
    pub history_capacity: usize,
    /// How often the auto-recovery loop re-checks
    pub check_interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            slow_probe_threshold: Duration::from_millis(100),
            soft_connection_limit: 8,
            fragmentation_threshold: 0.2,
            history_capacity: 64,
            check_interval: Duration::from_secs(30),
        }
    }
}

/// Periodic health prober for one database and its pool.
pub struct HealthChecker {
    pool: ConnectionPool,
    factory: Arc<ConnectionFactory>,
    config: HealthConfig,
    history: RwLock<VecDeque<HealthCheckResult>>,
}

impl HealthChecker {
    pub fn new(pool: ConnectionPool, factory: Arc<ConnectionFactory>, config: HealthConfig) -> Self {
        Self {
            pool,
            factory,
            config,
            history: RwLock::new(VecDeque::new()),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Run one full check cycle and append the results to history.
    pub async fn run_health_checks(&self) -> Vec<HealthCheckResult> {
        let results = vec![self.check_pool().await, self.check_database().await];
        let mut history = self.history.write();
        for result in &results {
            if result.status != HealthStatus::Healthy {
                warn!(
                    component = %result.component,
                    score = result.score,
                    "health check below healthy: {}",
                    result.message
                );
            } else {
                debug!(component = %result.component, score = result.score, "health check");
            }
            history.push_back(result.clone());
            while history.len() > self.config.history_capacity {
                history.pop_front();
            }
        }
        results
    }

    /// Pool connectivity and sizing check.
    async fn check_pool(&self) -> HealthCheckResult {
        let mut score = 1.0;
        let mut problems: Vec<String> = Vec::new();
        let stats = self.pool.stats();

        let probe_started = Instant::now();
        let probe_result = match self.pool.acquire(Duration::from_secs(2)).await {
            Ok(mut guard) => guard.probe().await,
            Err(e) => Err(e),
        };
        let probe_latency = probe_started.elapsed();

        match probe_result {
            Ok(()) => {
                if probe_latency > self.config.slow_probe_threshold {
                    score -= 0.1;
                    problems.push(format!("slow probe ({} ms)", probe_latency.as_millis()));
                }
            }
            Err(e) => {
                score -= 0.5;
                problems.push(format!("connectivity probe failed: {e}"));
            }
        }

        if stats.total_connections > self.config.soft_connection_limit {
            score -= 0.2;
            problems.push(format!(
                "connection count {} above soft limit {}",
                stats.total_connections, self.config.soft_connection_limit
            ));
        }

        let message = if problems.is_empty() {
            "pool healthy".to_string()
        } else {
            problems.join("; ")
        };
        let evidence = json!({
            "total_connections": stats.total_connections,
            "active_connections": stats.active_connections,
            "idle_connections": stats.idle_connections,
            "utilization": stats.utilization,
            "acquire_timeouts": stats.acquire_timeouts,
            "probe_latency_ms": probe_latency.as_millis() as u64,
        });
        HealthCheckResult::new(POOL_COMPONENT, score, message, evidence)
    }

    /// Database file check on a dedicated connection, outside the pool so a
    /// saturated pool cannot mask file-level problems.
    async fn check_database(&self) -> HealthCheckResult {
        let mut score = 1.0;
        let mut problems: Vec<String> = Vec::new();

        let probe_started = Instant::now();
        let conn = match self.factory.open().await {
            Ok(conn) => conn,
            Err(e) => {
                let evidence = json!({ "open_error": e.to_string() });
                return HealthCheckResult::new(
                    DATABASE_COMPONENT,
                    1.0 - 0.8,
                    format!("cannot open database: {e}"),
                    evidence,
                );
            }
        };

        if let Err(e) = conn.probe().await {
            score -= 0.8;
            problems.push(format!("connectivity probe failed: {e}"));
        }
        let probe_latency = probe_started.elapsed();
        if probe_latency > self.config.slow_probe_threshold {
            score -= 0.1;
            problems.push(format!("slow probe ({} ms)", probe_latency.as_millis()));
        }

        let integrity = conn.integrity_check().await.unwrap_or_else(|e| e.to_string());
        if integrity != "ok" {
            score -= 0.5;
            problems.push(format!("integrity check: {integrity}"));
        }

        let journal_mode = conn.journal_mode().await.unwrap_or_default();
        if !journal_mode.eq_ignore_ascii_case("wal") {
            score -= 0.1;
            problems.push(format!("journal mode is {journal_mode}, expected wal"));
        }

        let fragmentation = conn.fragmentation_ratio().await.unwrap_or(0.0);
        if fragmentation > self.config.fragmentation_threshold {
            score -= 0.1;
            problems.push(format!(
                "free-page fragmentation {:.0}%",
                fragmentation * 100.0
            ));
        }

        let _ = conn.close().await;

        let message = if problems.is_empty() {
            "database healthy".to_string()
        } else {
            problems.join("; ")
        };
        let evidence = json!({
            "probe_latency_ms": probe_latency.as_millis() as u64,
            "integrity": integrity,
            "journal_mode": journal_mode,
            "fragmentation": fragmentation,
        });
        HealthCheckResult::new(DATABASE_COMPONENT, score, message, evidence)
    }

    /// Recent results, oldest first.
    pub fn history(&self) -> Vec<HealthCheckResult> {
        self.history.read().iter().cloned().collect()
    }

    /// Recent scores for one component, oldest first.
    pub fn trend(&self, component: &str) -> Vec<f64> {
        self.history
            .read()
            .iter()
            .filter(|r| r.component == component)
            .map(|r| r.score)
            .collect()
    }

    /// Most recent result for one component.
    pub fn latest(&self, component: &str) -> Option<HealthCheckResult> {
        self.history
            .read()
            .iter()
            .rev()
            .find(|r| r.component == component)
            .cloned()
    }
}
