// SQLite history of enriched records. Append-only: one row per record, ordered by
// (agent_id, collected_at, id). The row payload is a version-prefixed JSON blob so the
// record layout can evolve without a schema change.

use async_trait::async_trait;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tracing::instrument;

use crate::blob::{self, RECORD_VERSION};
use crate::error::{PersistenceError, ValidationError};
use crate::models::MetricRecord;

/// Persistence operations the ingest and distribution paths depend on.
/// Implementations must be safe for concurrent appends and reads.
#[async_trait]
pub trait MetricStore: Send + Sync {
    /// Append one record atomically.
    async fn save(&self, record: &MetricRecord) -> Result<(), PersistenceError>;

    /// Records for one agent, oldest to newest. With `limit > 0` only the first
    /// (oldest) `limit` records are returned; `limit <= 0` is unbounded.
    async fn list(&self, agent_id: &str, limit: i64)
    -> Result<Vec<MetricRecord>, PersistenceError>;

    /// Most recent record for an agent; `None` when the agent has no history.
    async fn latest(&self, agent_id: &str) -> Result<Option<MetricRecord>, PersistenceError>;

    /// Distinct agent ids with at least one record, sorted ascending.
    async fn agents(&self) -> Result<Vec<String>, PersistenceError>;
}

pub struct HistoryRepo {
    pool: SqlitePool,
}

impl HistoryRepo {
    /// Connect to SQLite at `path`, create parent dir and DB if missing, enable WAL + pragmas.
    pub async fn connect(path: &str, max_pool_size: u32) -> anyhow::Result<Self> {
        if let Some(parent) = Path::new(path).parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_pool_size)
            .connect_with(opts)
            .await?;
        Ok(Self { pool })
    }

    pub async fn init(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS telemetry_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_id TEXT NOT NULL,
                collected_at INTEGER NOT NULL,
                payload BLOB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_records_agent_collected ON telemetry_records(agent_id, collected_at, id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl MetricStore for HistoryRepo {
    #[instrument(skip(self, record), fields(repo = "history", operation = "save", agent_id = %record.agent_id))]
    async fn save(&self, record: &MetricRecord) -> Result<(), PersistenceError> {
        if record.agent_id.is_empty() {
            return Err(ValidationError::MissingAgentId.into());
        }
        let payload = encode_record(record)?;
        sqlx::query(
            "INSERT INTO telemetry_records (agent_id, collected_at, payload) VALUES ($1, $2, $3)",
        )
        .bind(&record.agent_id)
        .bind(record.collected_at.timestamp_micros())
        .bind(&payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(repo = "history", operation = "list"))]
    async fn list(
        &self,
        agent_id: &str,
        limit: i64,
    ) -> Result<Vec<MetricRecord>, PersistenceError> {
        if agent_id.is_empty() {
            return Err(ValidationError::MissingAgentId.into());
        }
        let rows = if limit > 0 {
            sqlx::query(
                "SELECT payload FROM telemetry_records WHERE agent_id = $1
                 ORDER BY collected_at ASC, id ASC LIMIT $2",
            )
            .bind(agent_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(
                "SELECT payload FROM telemetry_records WHERE agent_id = $1
                 ORDER BY collected_at ASC, id ASC",
            )
            .bind(agent_id)
            .fetch_all(&self.pool)
            .await?
        };

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: Vec<u8> = row.try_get("payload")?;
            out.push(decode_record(&payload)?);
        }
        Ok(out)
    }

    #[instrument(skip(self), fields(repo = "history", operation = "latest"))]
    async fn latest(&self, agent_id: &str) -> Result<Option<MetricRecord>, PersistenceError> {
        if agent_id.is_empty() {
            return Err(ValidationError::MissingAgentId.into());
        }
        let row = sqlx::query(
            "SELECT payload FROM telemetry_records WHERE agent_id = $1
             ORDER BY collected_at DESC, id DESC LIMIT 1",
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let payload: Vec<u8> = row.try_get("payload")?;
        Ok(Some(decode_record(&payload)?))
    }

    #[instrument(skip(self), fields(repo = "history", operation = "agents"))]
    async fn agents(&self) -> Result<Vec<String>, PersistenceError> {
        let agents = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT agent_id FROM telemetry_records ORDER BY agent_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(agents)
    }
}

fn encode_record(record: &MetricRecord) -> Result<Vec<u8>, PersistenceError> {
    let json = serde_json::to_vec(record).map_err(PersistenceError::Encode)?;
    Ok(blob::with_version_prefix(RECORD_VERSION, json))
}

fn decode_record(bytes: &[u8]) -> Result<MetricRecord, PersistenceError> {
    match blob::split_version(bytes) {
        Some((RECORD_VERSION, payload)) => {
            serde_json::from_slice(payload).map_err(PersistenceError::Decode)
        }
        Some((version, _)) => Err(PersistenceError::PayloadVersion(version)),
        None => Err(PersistenceError::PayloadVersion(0)),
    }
}
