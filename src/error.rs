// Error types shared by the agent, the ingest path and the history store.

use thiserror::Error;

/// A message or query argument that must not reach rate state or storage.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("missing agent id")]
    MissingAgentId,

    #[error("non-finite value for {field}")]
    NonFinite { field: &'static str },

    #[error("unsupported frame version {0}")]
    UnsupportedVersion(u8),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),
}

/// One sampling cycle could not produce a metric. Callers skip the cycle.
#[derive(Debug, Error)]
pub enum CollectionError {
    #[error("sysinfo lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("sysinfo task join: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("{counter} counters unavailable")]
    Unavailable { counter: &'static str },
}

/// Failure of one of the history store operations.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("encode record: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("decode record: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("unsupported payload version {0}")]
    PayloadVersion(u8),
}

/// Terminal outcome of an agent session that did not end through cancellation.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("dial {addr}: timed out after {timeout_ms} ms")]
    DialTimeout { addr: String, timeout_ms: u64 },

    #[error("dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("encode metric: {0}")]
    Encode(String),

    #[error("send metric: {0}")]
    Send(#[source] std::io::Error),
}
