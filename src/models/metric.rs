// Raw sample as produced by an agent and sent over the ingest stream

use serde::{Deserialize, Serialize};
use wincode::{SchemaRead, SchemaWrite};

/// One unenriched host snapshot. Counters are cumulative since boot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, SchemaRead, SchemaWrite)]
#[serde(rename_all = "camelCase")]
pub struct Metric {
    pub agent_id: String,
    /// Unix milliseconds. `None` is replaced by the collector's receive time.
    pub collected_at_ms: Option<i64>,
    pub cpu_usage: f64,
    pub memory_used_bytes: u64,
    pub memory_percent: f64,
    pub network_tx_bytes: u64,
    pub network_rx_bytes: u64,
    pub disk_read_bytes: u64,
    pub disk_write_bytes: u64,
    pub load_avg1: f64,
    pub load_avg5: f64,
    pub load_avg15: f64,
}
