// Per-agent rate derivation over cumulative counters.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::models::{MetricRecord, Rates};

/// Bytes per second between two readings of a cumulative counter.
/// A counter that went backwards (interface restart, reboot) yields 0, as do
/// non-positive intervals and any non-finite result.
pub fn rate_per_second(old_value: u64, new_value: u64, seconds: f64) -> f64 {
    if seconds <= 0.0 || !seconds.is_finite() || new_value < old_value {
        return 0.0;
    }
    let rate = (new_value - old_value) as f64 / seconds;
    if rate.is_finite() { rate } else { 0.0 }
}

/// Rates for `current` relative to the previous record of the same agent.
pub fn derive_rates(previous: Option<&MetricRecord>, current: &MetricRecord) -> Rates {
    let Some(prev) = previous else {
        return Rates::default();
    };
    let elapsed = (current.collected_at - prev.collected_at)
        .num_microseconds()
        .map(|us| us as f64 / 1_000_000.0)
        .unwrap_or(0.0);
    if elapsed <= 0.0 {
        return Rates::default();
    }
    Rates {
        network_tx: rate_per_second(prev.network_tx_bytes, current.network_tx_bytes, elapsed),
        network_rx: rate_per_second(prev.network_rx_bytes, current.network_rx_bytes, elapsed),
        disk_read: rate_per_second(prev.disk_read_bytes, current.disk_read_bytes, elapsed),
        disk_write: rate_per_second(prev.disk_write_bytes, current.disk_write_bytes, elapsed),
    }
}

/// Last enriched record per agent. Owned by the ingest service and shared by all
/// connections; every lookup-compute-store happens under one lock.
#[derive(Default)]
pub struct RateState {
    previous: Mutex<HashMap<String, MetricRecord>>,
}

impl RateState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill in the rate fields of `record` and make it the agent's new previous
    /// record, whatever the outcome of the computation.
    pub fn enrich(&self, record: MetricRecord) -> MetricRecord {
        let mut previous = self
            .previous
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let rates = derive_rates(previous.get(&record.agent_id), &record);
        let enriched = record.with_rates(rates);
        previous.insert(enriched.agent_id.clone(), enriched.clone());
        enriched
    }

    pub fn previous(&self, agent_id: &str) -> Option<MetricRecord> {
        self.previous
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(agent_id)
            .cloned()
    }

    /// Number of agents with a cached previous record.
    pub fn len(&self) -> usize {
        self.previous
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
