// Shared test helpers
#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use telemetry::config::AgentConfig;
use telemetry::error::{CollectionError, PersistenceError};
use telemetry::history_repo::{HistoryRepo, MetricStore};
use telemetry::models::{Metric, MetricRecord};
use telemetry::sysinfo_repo::SampleSource;
use tempfile::TempDir;

/// Sample with fixed gauges and the given cumulative tx counter.
pub fn metric(agent_id: &str, collected_at_ms: i64, network_tx_bytes: u64) -> Metric {
    Metric {
        agent_id: agent_id.into(),
        collected_at_ms: Some(collected_at_ms),
        cpu_usage: 12.5,
        memory_used_bytes: 2048,
        memory_percent: 50.0,
        network_tx_bytes,
        network_rx_bytes: 0,
        disk_read_bytes: 0,
        disk_write_bytes: 0,
        load_avg1: 0.5,
        load_avg5: 0.25,
        load_avg15: 0.125,
    }
}

/// Unenriched record at `collected_at_ms`.
pub fn record(agent_id: &str, collected_at_ms: i64) -> MetricRecord {
    MetricRecord::from_metric(metric(agent_id, collected_at_ms, 0), chrono::Utc::now())
        .expect("valid metric")
}

/// Fresh initialized store in a temp dir. Keep the TempDir alive for the test.
pub async fn temp_repo() -> (TempDir, Arc<HistoryRepo>) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("history.db");
    let repo = HistoryRepo::connect(path.to_str().unwrap(), 4).await.unwrap();
    repo.init().await.unwrap();
    (dir, Arc::new(repo))
}

/// Store whose every operation fails.
pub struct FailingStore;

#[async_trait]
impl MetricStore for FailingStore {
    async fn save(&self, _record: &MetricRecord) -> Result<(), PersistenceError> {
        Err(sqlx::Error::PoolClosed.into())
    }

    async fn list(
        &self,
        _agent_id: &str,
        _limit: i64,
    ) -> Result<Vec<MetricRecord>, PersistenceError> {
        Err(sqlx::Error::PoolClosed.into())
    }

    async fn latest(&self, _agent_id: &str) -> Result<Option<MetricRecord>, PersistenceError> {
        Err(sqlx::Error::PoolClosed.into())
    }

    async fn agents(&self) -> Result<Vec<String>, PersistenceError> {
        Err(sqlx::Error::PoolClosed.into())
    }
}

/// Deterministic sample source: tx counter grows by 1000 per call, timestamps are
/// left to the collector. The first `fail_first` calls fail.
pub struct ScriptedSource {
    calls: AtomicUsize,
    fail_first: usize,
    tx_bytes: AtomicU64,
}

impl ScriptedSource {
    pub fn new(fail_first: usize) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_first,
            tx_bytes: AtomicU64::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SampleSource for ScriptedSource {
    async fn sample(&self, agent_id: &str) -> Result<Metric, CollectionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            return Err(CollectionError::Unavailable { counter: "memory" });
        }
        let tx = self.tx_bytes.fetch_add(1000, Ordering::SeqCst) + 1000;
        let mut m = metric(agent_id, 0, tx);
        m.collected_at_ms = None;
        Ok(m)
    }
}

pub fn agent_config(server_addr: &str, interval_ms: u64) -> AgentConfig {
    AgentConfig::load_from_str(&format!(
        r#"
[agent]
server_addr = "{server_addr}"
agent_id = "test-agent"
interval_ms = {interval_ms}
dial_timeout_ms = 1000
"#
    ))
    .unwrap()
}

/// Poll `check` every 20ms for up to 5s.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + tokio::time::Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
    }
    false
}
