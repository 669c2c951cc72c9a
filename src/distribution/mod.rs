// Read side of the collector: history queries and per-subscriber live feeds.

pub mod live;

pub use live::{FeedEnd, LiveUpdate};

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::PersistenceError;
use crate::history_repo::MetricStore;
use crate::models::MetricRecord;

/// One agent with its most recent record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSummary {
    pub agent_id: String,
    pub latest: MetricRecord,
}

pub struct DistributionService {
    store: Arc<dyn MetricStore>,
    poll_interval: Duration,
    default_limit: i64,
}

impl DistributionService {
    pub fn new(store: Arc<dyn MetricStore>, poll_interval: Duration, default_limit: i64) -> Self {
        Self {
            store,
            poll_interval,
            default_limit,
        }
    }

    /// Requested cap when positive, else the configured default.
    pub fn effective_limit(&self, requested: Option<i64>) -> i64 {
        requested
            .filter(|limit| *limit > 0)
            .unwrap_or(self.default_limit)
    }

    pub async fn history(
        &self,
        agent_id: &str,
        limit: Option<i64>,
    ) -> Result<Vec<MetricRecord>, PersistenceError> {
        self.store
            .list(agent_id, self.effective_limit(limit))
            .await
    }

    pub async fn agents(&self) -> Result<Vec<String>, PersistenceError> {
        self.store.agents().await
    }

    /// Every known agent with its latest record. Agents whose lookup fails or
    /// that have no record are left out.
    pub async fn summaries(&self) -> Result<Vec<AgentSummary>, PersistenceError> {
        let agents = self.store.agents().await?;
        let mut out = Vec::with_capacity(agents.len());
        for agent_id in agents {
            match self.store.latest(&agent_id).await {
                Ok(Some(latest)) => out.push(AgentSummary { agent_id, latest }),
                Ok(None) => {}
                Err(e) => {
                    error!(agent_id = %agent_id, error = %e, "load latest metric failed");
                }
            }
        }
        Ok(out)
    }

    /// Start a live feed for one agent. The feed stops when `cancel` fires or the
    /// returned receiver is dropped.
    pub fn subscribe(&self, agent_id: String, cancel: CancellationToken) -> mpsc::Receiver<LiveUpdate> {
        let (tx, rx) = mpsc::channel(1);
        let store = self.store.clone();
        let poll_interval = self.poll_interval;
        tokio::spawn(async move {
            let end = live::run_feed(store, agent_id.clone(), poll_interval, tx, cancel).await;
            debug!(agent_id = %agent_id, ?end, "live feed ended");
        });
        rx
    }
}
