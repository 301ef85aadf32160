//! Query values, classification, and request metadata
//!
//! Everything the optimizer needs to know about a statement before it runs:
//! - Parameter and result value types that round-trip through the driver
//! - Keyword-based classification into read/write/DDL/transaction classes
//! - SQL normalization and fingerprinting for cache keys and metric keys

use std::time::Duration;
use std::time::Instant;

use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::ToSql;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A dynamically-typed SQL parameter or result cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            SqlValue::Real(f) => ToSqlOutput::Owned(Value::Real(*f)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

impl From<ValueRef<'_>> for SqlValue {
    fn from(v: ValueRef<'_>) -> Self {
        match v {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(i) => SqlValue::Integer(i),
            ValueRef::Real(f) => SqlValue::Real(f),
            ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

/// One SQL statement plus its bound parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// Result of executing one statement: rows for SELECT-like statements,
/// affected-row count for everything else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
    pub rows_affected: usize,
    /// Whether this result was served from the result cache.
    pub cached: bool,
}

impl QueryOutput {
    pub fn rows_only(columns: Vec<String>, rows: Vec<Vec<SqlValue>>) -> Self {
        Self {
            columns,
            rows,
            rows_affected: 0,
            cached: false,
        }
    }

    pub fn affected(count: usize) -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            rows_affected: count,
            cached: false,
        }
    }
}

/// Statement classes the optimizer routes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryKind {
    Read,
    Write,
    Ddl,
    Transaction,
    Mixed,
}

const WRITE_KEYWORDS: [&str; 7] = [
    "INSERT", "UPDATE", "DELETE", "REPLACE", "CREATE", "ALTER", "DROP",
];

impl QueryKind {
    /// Classify a statement by its leading keyword.
    ///
    /// SELECTs that embed a write keyword anywhere (CTE with a data-modifying
    /// clause, `INSERT ... SELECT` pasted together, etc.) fall back to Mixed
    /// so they go through the write path and never run concurrently with a
    /// real writer.
    pub fn classify(sql: &str) -> Self {
        let trimmed = sql.trim_start();
        let first = leading_keyword(trimmed);

        match first.as_str() {
            "CREATE" | "ALTER" | "DROP" => QueryKind::Ddl,
            "BEGIN" | "COMMIT" | "ROLLBACK" => QueryKind::Transaction,
            "INSERT" | "UPDATE" | "DELETE" | "REPLACE" => QueryKind::Write,
            "SELECT" => {
                let rest = &trimmed[first.len()..];
                if contains_keyword(rest, &WRITE_KEYWORDS) {
                    QueryKind::Mixed
                } else {
                    QueryKind::Read
                }
            }
            _ => QueryKind::Mixed,
        }
    }

    pub fn is_read(self) -> bool {
        self == QueryKind::Read
    }
}

fn leading_keyword(sql: &str) -> String {
    sql.chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase()
}

/// Whole-word, case-insensitive keyword scan.
fn contains_keyword(sql: &str, keywords: &[&str]) -> bool {
    let upper = sql.to_ascii_uppercase();
    let mut start = None;
    let bytes = upper.as_bytes();
    for (i, &b) in bytes.iter().chain(std::iter::once(&b' ')).enumerate() {
        if b.is_ascii_alphabetic() || b == b'_' {
            if start.is_none() {
                start = Some(i);
            }
        } else if let Some(s) = start.take() {
            let word = &upper[s..i];
            if keywords.contains(&word) {
                return true;
            }
        }
    }
    false
}

/// Relative scheduling weight carried on a request. Recorded in spans and
/// metrics; admission order itself is semaphore FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Per-call execution options.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub priority: Priority,
    /// Overall deadline for the call, including pool wait and retries.
    pub timeout: Option<Duration>,
    /// Whether a read may be served from (and stored into) the result cache.
    /// Callers needing strict freshness disable this per call.
    pub enable_cache: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            timeout: None,
            enable_cache: true,
        }
    }
}

/// Internal per-call request record. Created per call, discarded after
/// execution; carries no cross-call state.
#[derive(Debug)]
pub struct QueryRequest {
    pub sql: String,
    pub params: Vec<SqlValue>,
    pub kind: QueryKind,
    pub priority: Priority,
    pub submitted_at: Instant,
    pub retries: u32,
}

impl QueryRequest {
    pub fn new(sql: &str, params: &[SqlValue], priority: Priority) -> Self {
        Self {
            sql: sql.to_string(),
            params: params.to_vec(),
            kind: QueryKind::classify(sql),
            priority,
            submitted_at: Instant::now(),
            retries: 0,
        }
    }
}

/// Collapse whitespace runs so trivial formatting differences share a
/// fingerprint.
pub fn normalize_sql(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut in_space = false;
    for c in sql.trim().chars() {
        if c.is_whitespace() {
            if !in_space {
                out.push(' ');
            }
            in_space = true;
        } else {
            out.push(c);
            in_space = false;
        }
    }
    out
}

/// Fingerprint of normalized SQL plus parameters, used as the cache key.
pub fn fingerprint(sql: &str, params: &[SqlValue]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(normalize_sql(sql).as_bytes());
    for p in params {
        match p {
            SqlValue::Null => hasher.update(b"\x00n"),
            SqlValue::Integer(i) => {
                hasher.update(b"\x00i");
                hasher.update(i.to_le_bytes());
            }
            SqlValue::Real(f) => {
                hasher.update(b"\x00r");
                hasher.update(f.to_le_bytes());
            }
            SqlValue::Text(s) => {
                hasher.update(b"\x00t");
                hasher.update(s.as_bytes());
            }
            SqlValue::Blob(b) => {
                hasher.update(b"\x00b");
                hasher.update(b);
            }
        }
    }
    hasher.finalize().into()
}

/// Truncated fingerprint of the normalized SQL alone, used as the metrics key.
pub fn metrics_key(sql: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(normalize_sql(sql).as_bytes());
    let digest: [u8; 32] = hasher.finalize().into();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(prefix)
}
