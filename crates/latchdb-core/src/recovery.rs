//! Recovery actions and the auto-recovery loop
//!
//! Maps degraded health to corrective actions and executes them under
//! per-action cooldowns:
//! - Pool: drain idle connections (Degraded) or retire the whole generation
//!   (Critical)
//! - Database: WAL checkpoint (Degraded) or VACUUM + ANALYZE (Critical)
//!
//! An attempt inside its action's cooldown window is recorded as a no-op
//! failure instead of executing, so a failing action can never hot-loop.
//! Every executed attempt, successful or not, restarts its cooldown clock.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::errors::Result;
use crate::factory::ConnectionFactory;
use crate::health::{HealthChecker, HealthStatus, DATABASE_COMPONENT, POOL_COMPONENT};
use crate::pool::ConnectionPool;

/// Corrective actions the executor can apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecoveryAction {
    ReconnectPool,
    DrainIdle,
    WalCheckpoint,
    VacuumAnalyze,
}

impl RecoveryAction {
    pub fn name(self) -> &'static str {
        match self {
            RecoveryAction::ReconnectPool => "reconnect-pool",
            RecoveryAction::DrainIdle => "drain-idle",
            RecoveryAction::WalCheckpoint => "wal-checkpoint",
            RecoveryAction::VacuumAnalyze => "vacuum-analyze",
        }
    }
}

/// Recovery configuration: per-action cooldowns and history size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    pub reconnect_cooldown: Duration,
    pub drain_cooldown: Duration,
    pub checkpoint_cooldown: Duration,
    pub vacuum_cooldown: Duration,
    pub history_capacity: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            reconnect_cooldown: Duration::from_secs(120),   // 2 minutes
            drain_cooldown: Duration::from_secs(300),       // 5 minutes
            checkpoint_cooldown: Duration::from_secs(900),  // 15 minutes
            vacuum_cooldown: Duration::from_secs(3600),     // 1 hour
            history_capacity: 128,
        }
    }
}

impl RecoveryConfig {
    fn cooldown(&self, action: RecoveryAction) -> Duration {
        match action {
            RecoveryAction::ReconnectPool => self.reconnect_cooldown,
            RecoveryAction::DrainIdle => self.drain_cooldown,
            RecoveryAction::WalCheckpoint => self.checkpoint_cooldown,
            RecoveryAction::VacuumAnalyze => self.vacuum_cooldown,
        }
    }
}

/// Record of one recovery attempt, executed or suppressed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub action: RecoveryAction,
    pub reason: String,
    pub started_at: SystemTime,
    pub success: bool,
    pub duration: Duration,
    pub error: Option<String>,
}

/// Executes recovery actions and runs the periodic check-and-recover loop.
#[derive(Clone)]
pub struct RecoveryExecutor {
    pool: ConnectionPool,
    factory: Arc<ConnectionFactory>,
    config: RecoveryConfig,
    history: Arc<Mutex<VecDeque<RecoveryAttempt>>>,
    last_attempt: Arc<Mutex<HashMap<RecoveryAction, Instant>>>,
    loop_handle: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl RecoveryExecutor {
    pub fn new(
        pool: ConnectionPool,
        factory: Arc<ConnectionFactory>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            pool,
            factory,
            config,
            history: Arc::new(Mutex::new(VecDeque::new())),
            last_attempt: Arc::new(Mutex::new(HashMap::new())),
            loop_handle: Arc::new(Mutex::new(None)),
        }
    }

    /// Pick the corrective action for a component's status, most invasive
    /// for Critical and a lighter touch for Degraded.
    pub fn decide(component: &str, status: HealthStatus) -> Option<RecoveryAction> {
        match (component, status) {
            (POOL_COMPONENT, HealthStatus::Critical) => Some(RecoveryAction::ReconnectPool),
            (POOL_COMPONENT, HealthStatus::Degraded) => Some(RecoveryAction::DrainIdle),
            (DATABASE_COMPONENT, HealthStatus::Critical) => Some(RecoveryAction::VacuumAnalyze),
            (DATABASE_COMPONENT, HealthStatus::Degraded) => Some(RecoveryAction::WalCheckpoint),
            _ => None,
        }
    }

    /// Execute one action unless it is inside its cooldown window. Always
    /// returns and records an attempt.
    pub async fn execute(&self, action: RecoveryAction, reason: &str) -> RecoveryAttempt {
        {
            let last = self.last_attempt.lock();
            if let Some(at) = last.get(&action) {
                let cooldown = self.config.cooldown(action);
                if at.elapsed() < cooldown {
                    let attempt = RecoveryAttempt {
                        action,
                        reason: reason.to_string(),
                        started_at: SystemTime::now(),
                        success: false,
                        duration: Duration::ZERO,
                        error: Some(format!(
                            "on cooldown for another {:?}",
                            cooldown - at.elapsed()
                        )),
                    };
                    drop(last);
                    warn!(action = action.name(), "recovery suppressed: on cooldown");
                    self.push_history(attempt.clone());
                    return attempt;
                }
            }
        }
        // The attempt itself starts the cooldown, success or not, so a
        // failing action cannot hot-loop.
        self.last_attempt.lock().insert(action, Instant::now());

        info!(action = action.name(), reason, "executing recovery action");
        let started_at = SystemTime::now();
        let started = Instant::now();
        let result = self.apply(action).await;
        let duration = started.elapsed();

        let attempt = match result {
            Ok(()) => {
                info!(
                    action = action.name(),
                    duration_ms = duration.as_millis() as u64,
                    "recovery action succeeded"
                );
                RecoveryAttempt {
                    action,
                    reason: reason.to_string(),
                    started_at,
                    success: true,
                    duration,
                    error: None,
                }
            }
            Err(e) => {
                error!(action = action.name(), "recovery action failed: {e}");
                RecoveryAttempt {
                    action,
                    reason: reason.to_string(),
                    started_at,
                    success: false,
                    duration,
                    error: Some(e.to_string()),
                }
            }
        };
        self.push_history(attempt.clone());
        attempt
    }

    async fn apply(&self, action: RecoveryAction) -> Result<()> {
        match action {
            RecoveryAction::ReconnectPool => self.pool.reconnect_all().await,
            RecoveryAction::DrainIdle => {
                let drained = self.pool.drain_idle();
                info!(drained, "drained idle pool connections");
                Ok(())
            }
            RecoveryAction::WalCheckpoint => {
                let conn = self.factory.open().await?;
                let result = conn.wal_checkpoint().await;
                let _ = conn.close().await;
                let checkpoint = result?;
                info!(
                    log_frames = checkpoint.log_frames,
                    checkpointed = checkpoint.checkpointed_frames,
                    "WAL checkpoint complete"
                );
                Ok(())
            }
            RecoveryAction::VacuumAnalyze => {
                let conn = self.factory.open().await?;
                let result = conn.vacuum_analyze().await;
                let _ = conn.close().await;
                result
            }
        }
    }

    fn push_history(&self, attempt: RecoveryAttempt) {
        let mut history = self.history.lock();
        history.push_back(attempt);
        while history.len() > self.config.history_capacity {
            history.pop_front();
        }
    }

    /// Recorded attempts, oldest first.
    pub fn history(&self) -> Vec<RecoveryAttempt> {
        self.history.lock().iter().cloned().collect()
    }

    /// Spawn the periodic check-and-recover loop. Runs independently of
    /// in-flight queries and survives its own failures.
    pub fn start_auto_recovery(&self, checker: Arc<HealthChecker>) {
        let mut handle_slot = self.loop_handle.lock();
        if handle_slot.is_some() {
            return;
        }
        let executor = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(checker.config().check_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let results = checker.run_health_checks().await;
                for result in results {
                    if let Some(action) = Self::decide(&result.component, result.status) {
                        let reason = format!(
                            "{} {:?} (score {:.2}): {}",
                            result.component, result.status, result.score, result.message
                        );
                        executor.execute(action, &reason).await;
                    }
                }
            }
        });
        *handle_slot = Some(handle);
    }

    /// Stop the auto-recovery loop without touching in-flight queries.
    pub fn stop(&self) {
        if let Some(handle) = self.loop_handle.lock().take() {
            handle.abort();
            info!("auto-recovery loop stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::FactoryConfig;
    use crate::pool::PoolConfig;
    use tempfile::TempDir;

    fn executor_for(dir: &TempDir, config: RecoveryConfig) -> RecoveryExecutor {
        let factory = Arc::new(ConnectionFactory::new(
            dir.path().join("recovery.db"),
            FactoryConfig::default(),
        ));
        let pool = ConnectionPool::new(factory.clone(), PoolConfig::default()).unwrap();
        RecoveryExecutor::new(pool, factory, config)
    }

    #[test]
    fn test_decision_table() {
        assert_eq!(
            RecoveryExecutor::decide(POOL_COMPONENT, HealthStatus::Critical),
            Some(RecoveryAction::ReconnectPool)
        );
        assert_eq!(
            RecoveryExecutor::decide(POOL_COMPONENT, HealthStatus::Degraded),
            Some(RecoveryAction::DrainIdle)
        );
        assert_eq!(
            RecoveryExecutor::decide(DATABASE_COMPONENT, HealthStatus::Critical),
            Some(RecoveryAction::VacuumAnalyze)
        );
        assert_eq!(
            RecoveryExecutor::decide(DATABASE_COMPONENT, HealthStatus::Degraded),
            Some(RecoveryAction::WalCheckpoint)
        );
        assert_eq!(
            RecoveryExecutor::decide(POOL_COMPONENT, HealthStatus::Healthy),
            None
        );
        assert_eq!(
            RecoveryExecutor::decide(DATABASE_COMPONENT, HealthStatus::Warning),
            None
        );
    }

    #[tokio::test]
    async fn test_checkpoint_executes_and_records() {
        let dir = TempDir::new().unwrap();
        let executor = executor_for(&dir, RecoveryConfig::default());

        let attempt = executor
            .execute(RecoveryAction::WalCheckpoint, "test trigger")
            .await;
        assert!(attempt.success, "checkpoint failed: {:?}", attempt.error);
        assert_eq!(executor.history().len(), 1);
    }

    #[tokio::test]
    async fn test_second_attempt_inside_cooldown_is_noop() {
        let dir = TempDir::new().unwrap();
        let executor = executor_for(&dir, RecoveryConfig::default());

        let first = executor
            .execute(RecoveryAction::DrainIdle, "first")
            .await;
        assert!(first.success);

        let second = executor
            .execute(RecoveryAction::DrainIdle, "second")
            .await;
        assert!(!second.success);
        assert!(second.error.as_deref().unwrap_or("").contains("on cooldown"));

        // Both attempts land in history.
        assert_eq!(executor.history().len(), 2);
    }

    #[tokio::test]
    async fn test_cooldown_expires() {
        let dir = TempDir::new().unwrap();
        let executor = executor_for(
            &dir,
            RecoveryConfig {
                drain_cooldown: Duration::from_millis(30),
                ..Default::default()
            },
        );

        assert!(executor
            .execute(RecoveryAction::DrainIdle, "first")
            .await
            .success);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(executor
            .execute(RecoveryAction::DrainIdle, "after cooldown")
            .await
            .success);
    }

    #[tokio::test]
    async fn test_cooldowns_are_per_action() {
        let dir = TempDir::new().unwrap();
        let executor = executor_for(&dir, RecoveryConfig::default());

        assert!(executor
            .execute(RecoveryAction::DrainIdle, "drain")
            .await
            .success);
        // A different action is not affected by the drain cooldown.
        assert!(executor
            .execute(RecoveryAction::WalCheckpoint, "checkpoint")
            .await
            .success);
    }

    #[tokio::test]
    async fn test_vacuum_analyze_on_real_file() {
        let dir = TempDir::new().unwrap();
        let executor = executor_for(&dir, RecoveryConfig::default());

        let attempt = executor
            .execute(RecoveryAction::VacuumAnalyze, "test trigger")
            .await;
        assert!(attempt.success, "vacuum failed: {:?}", attempt.error);
    }
}
