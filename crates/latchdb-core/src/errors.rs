use thiserror::Error;

#[derive(Error, Debug)]
pub enum LatchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("pool is closed")]
    PoolClosed,

    #[error("timed out after {waited_ms}ms waiting for a pool connection")]
    PoolTimeout { waited_ms: u64 },

    #[error("query timed out after {waited_ms}ms")]
    QueryTimeout { waited_ms: u64 },

    #[error("retries exhausted after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<LatchError>,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, LatchError>;

impl LatchError {
    /// True for errors that mean "try again later" rather than "the query is wrong".
    pub fn is_transient_failure(&self) -> bool {
        matches!(
            self,
            LatchError::RetryExhausted { .. } | LatchError::PoolTimeout { .. }
        )
    }
}
