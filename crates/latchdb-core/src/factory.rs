//! Connection opening and low-level statement execution
//!
//! The factory owns the one place where raw SQLite connections are created
//! and configured. Every physical connection gets the same pragma sequence
//! on open; those settings are the contract that makes the concurrency model
//! above it (WAL readers + serialized writers) safe.
//!
//! A [`SqliteConnection`] is not safe for two concurrent callers; the pool
//! guarantees single-owner access. Blocking driver calls run on the blocking
//! thread pool so the async scheduler is never stalled by SQLite I/O.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params_from_iter, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{LatchError, Result};
use crate::query::{QueryOutput, SqlValue, Statement};

/// Per-connection pragma configuration.
///
/// Applied once per physical connection, in a fixed order. Downstream tooling
/// (backup scripts and the like) must tolerate the WAL side files these
/// settings produce (`<db>-wal`, `<db>-shm`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactoryConfig {
    /// How long a connection waits on a lock before the driver reports busy.
    pub busy_timeout: Duration,
    /// Page cache size in KiB.
    pub cache_size_kib: u32,
    /// Memory-map window in bytes.
    pub mmap_size: u64,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(30),
            cache_size_kib: 8192,        // 8 MiB
            mmap_size: 128 * 1024 * 1024, // 128 MiB
        }
    }
}

impl FactoryConfig {
    /// The fixed pragma sequence applied to every new connection.
    fn pragma_sql(&self) -> String {
        // WAL for concurrent readers during a writer, NORMAL sync (safe with
        // WAL, fewer fsyncs), busy_timeout as the first line of defense
        // against transient lock errors before the retry layer kicks in.
        format!(
            "PRAGMA journal_mode=WAL; \
             PRAGMA busy_timeout={}; \
             PRAGMA synchronous=NORMAL; \
             PRAGMA foreign_keys=ON; \
             PRAGMA temp_store=MEMORY; \
             PRAGMA cache_size=-{}; \
             PRAGMA mmap_size={};",
            self.busy_timeout.as_millis(),
            self.cache_size_kib,
            self.mmap_size,
        )
    }
}

/// Result of a WAL checkpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CheckpointResult {
    /// 1 if the checkpoint could not run to completion because of a busy lock.
    pub busy: i64,
    /// WAL frames at checkpoint time.
    pub log_frames: i64,
    /// Frames actually moved back into the main database file.
    pub checkpointed_frames: i64,
}

/// Opens and configures raw connections for one database file.
pub struct ConnectionFactory {
    path: PathBuf,
    config: FactoryConfig,
    next_id: AtomicU64,
}

impl ConnectionFactory {
    pub fn new(path: impl AsRef<Path>, config: FactoryConfig) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            config,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a new physical connection and apply the pragma sequence.
    pub async fn open(&self) -> Result<SqliteConnection> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let path = self.path.clone();
        let pragmas = self.config.pragma_sql();

        let conn = run_blocking(move || {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let conn = rusqlite::Connection::open(&path)?;
            conn.execute_batch(&pragmas)?;
            Ok(conn)
        })
        .await?;

        debug!(connection_id = id, "opened connection");
        Ok(SqliteConnection {
            id,
            inner: Arc::new(Mutex::new(Some(conn))),
        })
    }

    /// Total connections this factory has ever opened.
    pub fn opened_count(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed) - 1
    }
}

/// A single configured connection.
///
/// The handle is cheap to clone; all clones share the underlying driver
/// connection. `close()` is idempotent and every call after it fails with
/// [`LatchError::ConnectionClosed`].
#[derive(Clone)]
pub struct SqliteConnection {
    id: u64,
    inner: Arc<Mutex<Option<rusqlite::Connection>>>,
}

impl SqliteConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Execute one statement. Statements that produce columns return rows;
    /// everything else returns the affected-row count.
    pub async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<QueryOutput> {
        let inner = self.inner.clone();
        let sql = sql.to_string();
        let params = params.to_vec();

        run_blocking(move || {
            let guard = inner.lock();
            let conn = guard.as_ref().ok_or(LatchError::ConnectionClosed)?;
            execute_on(conn, &sql, &params)
        })
        .await
    }

    /// Execute a batch of statements inside one IMMEDIATE transaction.
    ///
    /// IMMEDIATE takes the write lock up front, so a mid-transaction upgrade
    /// can never deadlock against another writer. Any statement error rolls
    /// the whole batch back.
    pub async fn transaction(&self, ops: &[Statement]) -> Result<Vec<QueryOutput>> {
        let inner = self.inner.clone();
        let ops = ops.to_vec();

        run_blocking(move || {
            let mut guard = inner.lock();
            let conn = guard.as_mut().ok_or(LatchError::ConnectionClosed)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut outputs = Vec::with_capacity(ops.len());
            for op in &ops {
                outputs.push(execute_on(&tx, &op.sql, &op.params)?);
            }
            tx.commit()?;
            Ok(outputs)
        })
        .await
    }

    /// Cheap liveness probe.
    pub async fn probe(&self) -> Result<()> {
        let inner = self.inner.clone();
        run_blocking(move || {
            let guard = inner.lock();
            let conn = guard.as_ref().ok_or(LatchError::ConnectionClosed)?;
            let one: i64 = conn.query_row("SELECT 1", [], |row| row.get(0))?;
            if one == 1 {
                Ok(())
            } else {
                Err(LatchError::Internal("probe returned unexpected value".into()))
            }
        })
        .await
    }

    /// Current journal mode as reported by the database.
    pub async fn journal_mode(&self) -> Result<String> {
        self.query_pragma("PRAGMA journal_mode").await
    }

    /// Runs `PRAGMA quick_check` and returns the first result row ("ok" when
    /// the file is structurally sound).
    pub async fn integrity_check(&self) -> Result<String> {
        self.query_pragma("PRAGMA quick_check").await
    }

    /// Fraction of pages sitting on the freelist, 0.0 when the file is empty.
    pub async fn fragmentation_ratio(&self) -> Result<f64> {
        let inner = self.inner.clone();
        run_blocking(move || {
            let guard = inner.lock();
            let conn = guard.as_ref().ok_or(LatchError::ConnectionClosed)?;
            let pages: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
            let free: i64 = conn.query_row("PRAGMA freelist_count", [], |row| row.get(0))?;
            if pages == 0 {
                Ok(0.0)
            } else {
                Ok(free as f64 / pages as f64)
            }
        })
        .await
    }

    /// Truncating WAL checkpoint.
    pub async fn wal_checkpoint(&self) -> Result<CheckpointResult> {
        let inner = self.inner.clone();
        run_blocking(move || {
            let guard = inner.lock();
            let conn = guard.as_ref().ok_or(LatchError::ConnectionClosed)?;
            let result = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
                Ok(CheckpointResult {
                    busy: row.get(0)?,
                    log_frames: row.get(1)?,
                    checkpointed_frames: row.get(2)?,
                })
            })?;
            Ok(result)
        })
        .await
    }

    /// Rebuild the database file and refresh planner statistics.
    pub async fn vacuum_analyze(&self) -> Result<()> {
        let inner = self.inner.clone();
        run_blocking(move || {
            let guard = inner.lock();
            let conn = guard.as_ref().ok_or(LatchError::ConnectionClosed)?;
            conn.execute_batch("VACUUM; ANALYZE;")?;
            Ok(())
        })
        .await
    }

    /// Close the underlying connection. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let inner = self.inner.clone();
        let id = self.id;
        run_blocking(move || {
            if inner.lock().take().is_some() {
                debug!(connection_id = id, "closed connection");
            }
            Ok(())
        })
        .await
    }

    /// Whether `close()` has been called on any clone of this handle.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().is_none()
    }

    async fn query_pragma(&self, pragma: &str) -> Result<String> {
        let inner = self.inner.clone();
        let pragma = pragma.to_string();
        run_blocking(move || {
            let guard = inner.lock();
            let conn = guard.as_ref().ok_or(LatchError::ConnectionClosed)?;
            let value: String = conn.query_row(&pragma, [], |row| row.get(0))?;
            Ok(value)
        })
        .await
    }
}

fn execute_on(conn: &rusqlite::Connection, sql: &str, params: &[SqlValue]) -> Result<QueryOutput> {
    let mut stmt = conn.prepare(sql)?;
    if stmt.column_count() > 0 {
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(columns.len());
            for i in 0..columns.len() {
                values.push(SqlValue::from(row.get_ref(i)?));
            }
            out.push(values);
        }
        Ok(QueryOutput::rows_only(columns, out))
    } else {
        let affected = stmt.execute(params_from_iter(params.iter()))?;
        Ok(QueryOutput::affected(affected))
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| LatchError::Internal(format!("blocking task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_test_connection() -> (TempDir, SqliteConnection) {
        let dir = TempDir::new().unwrap();
        let factory = ConnectionFactory::new(dir.path().join("test.db"), FactoryConfig::default());
        let conn = factory.open().await.unwrap();
        (dir, conn)
    }

    #[tokio::test]
    async fn test_pragma_contract() {
        let (_dir, conn) = open_test_connection().await;
        assert_eq!(conn.journal_mode().await.unwrap(), "wal");

        let fk = conn
            .execute("PRAGMA foreign_keys", &[])
            .await
            .unwrap();
        assert_eq!(fk.rows[0][0], SqlValue::Integer(1));

        let busy = conn.execute("PRAGMA busy_timeout", &[]).await.unwrap();
        assert_eq!(busy.rows[0][0], SqlValue::Integer(30_000));

        let sync = conn.execute("PRAGMA synchronous", &[]).await.unwrap();
        assert_eq!(sync.rows[0][0], SqlValue::Integer(1)); // NORMAL
    }

    #[tokio::test]
    async fn test_execute_rows_and_affected() {
        let (_dir, conn) = open_test_connection().await;
        conn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)", &[])
            .await
            .unwrap();

        let ins = conn
            .execute(
                "INSERT INTO t (name) VALUES (?1)",
                &[SqlValue::from("alice")],
            )
            .await
            .unwrap();
        assert_eq!(ins.rows_affected, 1);

        let sel = conn.execute("SELECT id, name FROM t", &[]).await.unwrap();
        assert_eq!(sel.columns, vec!["id", "name"]);
        assert_eq!(sel.rows.len(), 1);
        assert_eq!(sel.rows[0][1], SqlValue::from("alice"));
    }

    #[tokio::test]
    async fn test_transaction_rolls_back_on_error() {
        let (_dir, conn) = open_test_connection().await;
        conn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY)", &[])
            .await
            .unwrap();

        let ops = vec![
            Statement::new("INSERT INTO t (id) VALUES (1)", vec![]),
            Statement::new("INSERT INTO nonexistent (id) VALUES (2)", vec![]),
        ];
        assert!(conn.transaction(&ops).await.is_err());

        let count = conn
            .execute("SELECT COUNT(*) FROM t", &[])
            .await
            .unwrap();
        assert_eq!(count.rows[0][0], SqlValue::Integer(0));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_fails_after() {
        let (_dir, conn) = open_test_connection().await;
        conn.close().await.unwrap();
        conn.close().await.unwrap();
        assert!(conn.is_closed());

        let err = conn.execute("SELECT 1", &[]).await.unwrap_err();
        assert!(matches!(err, LatchError::ConnectionClosed));
        assert!(matches!(
            conn.probe().await.unwrap_err(),
            LatchError::ConnectionClosed
        ));
    }

    #[tokio::test]
    async fn test_upsert_increment() {
        let (_dir, conn) = open_test_connection().await;
        conn.execute(
            "CREATE TABLE counters (key TEXT PRIMARY KEY, value INTEGER NOT NULL)",
            &[],
        )
        .await
        .unwrap();

        for _ in 0..3 {
            conn.execute(
                "INSERT INTO counters (key, value) VALUES (?1, 1) \
                 ON CONFLICT(key) DO UPDATE SET value = value + 1",
                &[SqlValue::from("hits")],
            )
            .await
            .unwrap();
        }

        let got = conn
            .execute(
                "SELECT value FROM counters WHERE key = ?1",
                &[SqlValue::from("hits")],
            )
            .await
            .unwrap();
        assert_eq!(got.rows[0][0], SqlValue::Integer(3));
    }
}
