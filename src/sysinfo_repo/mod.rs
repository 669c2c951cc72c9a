// Host sampling via sysinfo. One call = one raw Metric for the ingest stream.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use sysinfo::{Disks, Networks, System};
use tracing::instrument;

use crate::error::CollectionError;
use crate::models::Metric;

/// Produces one raw snapshot on demand. Failures are per call; callers skip the cycle.
#[async_trait]
pub trait SampleSource: Send + Sync {
    async fn sample(&self, agent_id: &str) -> Result<Metric, CollectionError>;
}

/// Used bytes and percentage. Falls back to `total - available` when the primary
/// used figure is missing; the percentage is always recomputed from bytes.
pub fn memory_usage(total: u64, used: u64, available: u64) -> (u64, f64) {
    let used = if used > 0 {
        used
    } else if total > available {
        total - available
    } else {
        0
    };
    let percent = if total > 0 {
        (used as f64 / total as f64) * 100.0
    } else {
        0.0
    };
    (used, percent)
}

/// Cumulative (read, written) bytes over distinct devices. A device mounted more
/// than once (bind mounts, subvolumes) is counted once.
pub fn disk_io_totals<'a>(devices: impl IntoIterator<Item = (&'a str, u64, u64)>) -> (u64, u64) {
    let mut seen = HashSet::new();
    devices
        .into_iter()
        .filter(|(name, _, _)| seen.insert(*name))
        .fold((0u64, 0u64), |(read, written), (_, r, w)| {
            (read.saturating_add(r), written.saturating_add(w))
        })
}

#[derive(Clone)]
pub struct SysinfoRepo {
    sys: Arc<Mutex<System>>,
    disks: Arc<Mutex<Disks>>,
    networks: Arc<Mutex<Networks>>,
    last_cpu_refresh: Arc<Mutex<Option<(Instant, f64)>>>,
}

impl Default for SysinfoRepo {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoRepo {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu_all();
        Self {
            sys: Arc::new(Mutex::new(sys)),
            disks: Arc::new(Mutex::new(Disks::new_with_refreshed_list())),
            networks: Arc::new(Mutex::new(Networks::new_with_refreshed_list())),
            last_cpu_refresh: Arc::new(Mutex::new(None)),
        }
    }

    /// Host name used as the default agent id.
    pub fn host_name() -> Option<String> {
        System::host_name().filter(|h| !h.is_empty())
    }

    fn collect(&self, agent_id: &str) -> Result<Metric, CollectionError> {
        let mut sys = self
            .sys
            .lock()
            .map_err(|e| CollectionError::LockPoisoned(e.to_string()))?;

        sys.refresh_memory();
        let total = sys.total_memory();
        if total == 0 {
            return Err(CollectionError::Unavailable { counter: "memory" });
        }
        let (memory_used_bytes, memory_percent) =
            memory_usage(total, sys.used_memory(), sys.available_memory());

        let cpu_usage = {
            let mut last = self
                .last_cpu_refresh
                .lock()
                .map_err(|e| CollectionError::LockPoisoned(e.to_string()))?;
            let now = Instant::now();
            let previous = *last;
            match previous {
                Some((prev_ts, prev_usage))
                    if now.duration_since(prev_ts) < sysinfo::MINIMUM_CPU_UPDATE_INTERVAL =>
                {
                    prev_usage
                }
                Some(_) => {
                    sys.refresh_cpu_all();
                    let usage = sys.global_cpu_usage() as f64;
                    *last = Some((now, usage));
                    usage
                }
                None => {
                    // First call: usage needs two refreshes spaced by the minimum interval.
                    std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
                    sys.refresh_cpu_all();
                    let usage = sys.global_cpu_usage() as f64;
                    *last = Some((Instant::now(), usage));
                    usage
                }
            }
        };
        drop(sys);

        let (network_tx_bytes, network_rx_bytes) = {
            let mut networks = self
                .networks
                .lock()
                .map_err(|e| CollectionError::LockPoisoned(e.to_string()))?;
            networks.refresh(true);
            networks
                .list()
                .values()
                .fold((0u64, 0u64), |(tx, rx), data| {
                    (
                        tx.saturating_add(data.total_transmitted()),
                        rx.saturating_add(data.total_received()),
                    )
                })
        };

        let (disk_read_bytes, disk_write_bytes) = {
            let mut disks = self
                .disks
                .lock()
                .map_err(|e| CollectionError::LockPoisoned(e.to_string()))?;
            disks.refresh(true);
            let devices: Vec<(String, u64, u64)> = disks
                .list()
                .iter()
                .map(|d| {
                    let usage = d.usage();
                    (
                        d.name().to_string_lossy().into_owned(),
                        usage.total_read_bytes,
                        usage.total_written_bytes,
                    )
                })
                .collect();
            disk_io_totals(devices.iter().map(|(n, r, w)| (n.as_str(), *r, *w)))
        };
        let load = System::load_average();

        Ok(Metric {
            agent_id: agent_id.to_string(),
            collected_at_ms: Some(chrono::Utc::now().timestamp_millis()),
            cpu_usage: if cpu_usage.is_finite() {
                cpu_usage.clamp(0.0, 100.0)
            } else {
                0.0
            },
            memory_used_bytes,
            memory_percent,
            network_tx_bytes,
            network_rx_bytes,
            disk_read_bytes,
            disk_write_bytes,
            load_avg1: load.one,
            load_avg5: load.five,
            load_avg15: load.fifteen,
        })
    }
}

#[async_trait]
impl SampleSource for SysinfoRepo {
    #[instrument(skip(self), fields(repo = "sysinfo", operation = "sample"))]
    async fn sample(&self, agent_id: &str) -> Result<Metric, CollectionError> {
        let repo = self.clone();
        let agent_id = agent_id.to_string();
        tokio::task::spawn_blocking(move || repo.collect(&agent_id)).await?
    }
}
