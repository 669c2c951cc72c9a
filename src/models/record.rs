// Enriched record: what ingest persists and what the query/live surfaces return

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Metric;
use crate::error::ValidationError;

/// Derived throughput in bytes per second.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Rates {
    pub network_tx: f64,
    pub network_rx: f64,
    pub disk_read: f64,
    pub disk_write: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricRecord {
    pub agent_id: String,
    pub collected_at: DateTime<Utc>,
    pub cpu_usage: f64,
    #[serde(rename = "memoryUsageBytes")]
    pub memory_used_bytes: u64,
    pub memory_percent: f64,
    pub network_tx_bytes: u64,
    pub network_rx_bytes: u64,
    pub network_tx_rate: f64,
    pub network_rx_rate: f64,
    pub disk_read_bytes: u64,
    pub disk_write_bytes: u64,
    pub disk_read_rate: f64,
    pub disk_write_rate: f64,
    pub load_avg1: f64,
    pub load_avg5: f64,
    pub load_avg15: f64,
}

impl MetricRecord {
    /// Validate a wire metric and build a record with zero rates.
    /// A missing timestamp becomes `received_at`.
    pub fn from_metric(
        metric: Metric,
        received_at: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        if metric.agent_id.is_empty() {
            return Err(ValidationError::MissingAgentId);
        }
        for (field, value) in [
            ("cpu_usage", metric.cpu_usage),
            ("memory_percent", metric.memory_percent),
            ("load_avg1", metric.load_avg1),
            ("load_avg5", metric.load_avg5),
            ("load_avg15", metric.load_avg15),
        ] {
            if !value.is_finite() {
                return Err(ValidationError::NonFinite { field });
            }
        }
        let collected_at = match metric.collected_at_ms {
            Some(ms) => DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| {
                ValidationError::MalformedFrame(format!("collected_at {} out of range", ms))
            })?,
            None => received_at,
        };

        Ok(Self {
            agent_id: metric.agent_id,
            collected_at,
            cpu_usage: metric.cpu_usage,
            memory_used_bytes: metric.memory_used_bytes,
            memory_percent: metric.memory_percent,
            network_tx_bytes: metric.network_tx_bytes,
            network_rx_bytes: metric.network_rx_bytes,
            network_tx_rate: 0.0,
            network_rx_rate: 0.0,
            disk_read_bytes: metric.disk_read_bytes,
            disk_write_bytes: metric.disk_write_bytes,
            disk_read_rate: 0.0,
            disk_write_rate: 0.0,
            load_avg1: metric.load_avg1,
            load_avg5: metric.load_avg5,
            load_avg15: metric.load_avg15,
        })
    }

    pub fn rates(&self) -> Rates {
        Rates {
            network_tx: self.network_tx_rate,
            network_rx: self.network_rx_rate,
            disk_read: self.disk_read_rate,
            disk_write: self.disk_write_rate,
        }
    }

    pub fn with_rates(mut self, rates: Rates) -> Self {
        self.network_tx_rate = rates.network_tx;
        self.network_rx_rate = rates.network_rx;
        self.disk_read_rate = rates.disk_read;
        self.disk_write_rate = rates.disk_write;
        self
    }
}
