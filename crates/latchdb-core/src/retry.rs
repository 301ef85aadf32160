//! Retry policy for transient lock errors
//!
//! SQLite reports write contention as SQLITE_BUSY ("database is locked") or
//! SQLITE_LOCKED ("database table is locked"). Those are worth retrying with
//! exponential backoff; everything else is a real error and retrying would
//! only hide it. Backoff delays are jittered so a herd of waiters does not
//! retry in lockstep.
//!
//! Retry behavior is explicit at the call site: callers pass an operation
//! into [`execute_with_retry`] together with a named [`RetryStrategy`].

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{LatchError, Result};

/// Message fragments that identify a transient contention error when the
/// driver error code alone is not conclusive.
const TRANSIENT_PHRASES: [&str; 5] = [
    "database is locked",
    "database table is locked",
    "busy",
    "schema has changed",
    "cannot commit transaction",
];

/// How an error should be handled by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Contention that is expected to clear; retry with backoff.
    Transient,
    /// Anything else; return immediately.
    Fatal,
}

/// Classify an error as retryable contention or a fatal failure.
pub fn classify(err: &LatchError) -> ErrorClass {
    match err {
        LatchError::Sqlite(e) => {
            if is_contention_code(e) || message_is_transient(&e.to_string()) {
                ErrorClass::Transient
            } else {
                ErrorClass::Fatal
            }
        }
        _ => ErrorClass::Fatal,
    }
}

/// SQLITE_BUSY under write contention, SQLITE_LOCKED with shared-cache or
/// table-level locks.
fn is_contention_code(err: &rusqlite::Error) -> bool {
    use rusqlite::ffi;
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            ffi::Error {
                code: ffi::ErrorCode::DatabaseBusy | ffi::ErrorCode::DatabaseLocked,
                ..
            },
            _,
        )
    )
}

fn message_is_transient(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    TRANSIENT_PHRASES.iter().any(|p| lower.contains(p))
}

/// Backoff parameters for one retry loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryStrategy {
    /// Retries after the first attempt; an operation runs at most
    /// `max_retries + 1` times.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Uniform perturbation of each delay, as a fraction of the delay.
    pub jitter_fraction: f64,
}

impl RetryStrategy {
    /// Heavy contention: many fast retries.
    pub fn aggressive() -> Self {
        Self {
            max_retries: 10,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            multiplier: 1.5,
            jitter_fraction: 0.25,
        }
    }

    /// Sensible default.
    pub fn balanced() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_fraction: 0.25,
        }
    }

    /// Few, slow retries for callers that would rather fail than wait.
    pub fn conservative() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 3.0,
            jitter_fraction: 0.25,
        }
    }

    /// Deterministic delay for attempt `i` before jitter:
    /// `min(max_delay, base_delay * multiplier^i)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let raw = self.base_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(raw.min(self.max_delay.as_secs_f64()))
    }

    /// Jittered delay for attempt `i`, clamped to `max_delay`.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt).as_secs_f64();
        let factor = 1.0 + self.jitter_fraction * (fastrand::f64() * 2.0 - 1.0);
        let jittered = (base * factor).max(0.0);
        Duration::from_secs_f64(jittered.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::balanced()
    }
}

/// Run `op`, retrying transient contention errors with backoff, using the
/// default [`classify`] function.
///
/// Fatal errors return immediately. When a transient error survives
/// `max_retries + 1` attempts the loop returns
/// [`LatchError::RetryExhausted`] wrapping the final underlying error.
pub async fn execute_with_retry<T, F, Fut>(strategy: &RetryStrategy, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    execute_with_retry_classified(strategy, classify, op).await
}

/// [`execute_with_retry`] with a caller-supplied error classifier.
pub async fn execute_with_retry_classified<T, F, Fut, C>(
    strategy: &RetryStrategy,
    classifier: C,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    C: Fn(&LatchError) -> ErrorClass,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if classifier(&err) == ErrorClass::Fatal {
                    return Err(err);
                }
                if attempt >= strategy.max_retries {
                    return Err(LatchError::RetryExhausted {
                        attempts: attempt + 1,
                        source: Box::new(err),
                    });
                }
                let delay = strategy.jittered_delay(attempt);
                debug!(
                    attempt = attempt + 1,
                    max = strategy.max_retries + 1,
                    delay_ms = delay.as_millis() as u64,
                    "transient lock error, backing off: {err}"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn busy_error() -> LatchError {
        LatchError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".to_string()),
        ))
    }

    fn syntax_error() -> LatchError {
        LatchError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
            Some("near \"SELEC\": syntax error".to_string()),
        ))
    }

    #[test]
    fn test_classification() {
        assert_eq!(classify(&busy_error()), ErrorClass::Transient);
        assert_eq!(classify(&syntax_error()), ErrorClass::Fatal);
        assert_eq!(
            classify(&LatchError::PoolTimeout { waited_ms: 5 }),
            ErrorClass::Fatal
        );
        // Phrase match without a contention code.
        let schema_changed = LatchError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
            Some("schema has changed mid-statement".to_string()),
        ));
        assert_eq!(classify(&schema_changed), ErrorClass::Transient);
    }

    #[test]
    fn test_delay_sequence_monotone_and_capped() {
        let strategy = RetryStrategy::balanced();
        let mut prev = Duration::ZERO;
        for attempt in 0..12 {
            let d = strategy.delay_for_attempt(attempt);
            assert!(d >= prev, "delay decreased at attempt {attempt}");
            assert!(d <= strategy.max_delay);
            prev = d;
        }
    }

    #[test]
    fn test_jitter_never_exceeds_max_delay() {
        let strategy = RetryStrategy {
            jitter_fraction: 0.5,
            ..RetryStrategy::aggressive()
        };
        for attempt in 0..20 {
            assert!(strategy.jittered_delay(attempt) <= strategy.max_delay);
        }
    }

    #[tokio::test]
    async fn test_attempt_count_on_exhaustion() {
        let strategy = RetryStrategy {
            max_retries: 4,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 1.0,
            jitter_fraction: 0.0,
        };
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let err = execute_with_retry(&strategy, move || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(busy_error())
            }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        match err {
            LatchError::RetryExhausted { attempts, .. } => assert_eq!(attempts, 5),
            other => panic!("expected RetryExhausted, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_fatal_error_fails_fast() {
        let strategy = RetryStrategy::aggressive();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let err = execute_with_retry(&strategy, move || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(syntax_error())
            }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, LatchError::Sqlite(_)));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_errors() {
        let strategy = RetryStrategy {
            max_retries: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 1.0,
            jitter_fraction: 0.0,
        };
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let value = execute_with_retry(&strategy, move || {
            let calls = calls_clone.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(busy_error())
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
