//! Poll-and-push live feed.
//!
//! Each subscription polls `latest` on a fixed cadence and pushes a record only
//! when its `collected_at` is strictly after the last one delivered (the
//! high-water mark). Latest value wins: nothing is queued for slow or
//! reconnecting subscribers.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use crate::history_repo::MetricStore;
use crate::models::MetricRecord;

/// One event for a subscriber: the record and its JSON encoding.
#[derive(Debug, Clone)]
pub struct LiveUpdate {
    pub record: MetricRecord,
    pub payload: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedEnd {
    Cancelled,
    SubscriberGone,
}

enum Push {
    Sent(DateTime<Utc>),
    Skipped,
    Gone,
    Cancelled,
}

#[instrument(skip(store, tx, cancel), fields(poll_ms = poll_interval.as_millis() as u64))]
pub async fn run_feed(
    store: Arc<dyn MetricStore>,
    agent_id: String,
    poll_interval: Duration,
    tx: mpsc::Sender<LiveUpdate>,
    cancel: CancellationToken,
) -> FeedEnd {
    let mut high_water: Option<DateTime<Utc>> = None;

    match push_if_newer(store.as_ref(), &agent_id, high_water, &tx, &cancel).await {
        Push::Sent(ts) => high_water = Some(ts),
        Push::Skipped => {}
        Push::Gone => return FeedEnd::SubscriberGone,
        Push::Cancelled => return FeedEnd::Cancelled,
    }

    let mut tick = interval_at(Instant::now() + poll_interval, poll_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return FeedEnd::Cancelled,
            _ = tx.closed() => return FeedEnd::SubscriberGone,
            _ = tick.tick() => {
                match push_if_newer(store.as_ref(), &agent_id, high_water, &tx, &cancel).await {
                    Push::Sent(ts) => high_water = Some(ts),
                    Push::Skipped => {}
                    Push::Gone => return FeedEnd::SubscriberGone,
                    Push::Cancelled => return FeedEnd::Cancelled,
                }
            }
        }
    }
}

/// Fetch the latest record and deliver it when newer than `high_water`.
/// Fetch and encode failures are logged and treated as "nothing to send".
async fn push_if_newer(
    store: &dyn MetricStore,
    agent_id: &str,
    high_water: Option<DateTime<Utc>>,
    tx: &mpsc::Sender<LiveUpdate>,
    cancel: &CancellationToken,
) -> Push {
    let record = match store.latest(agent_id).await {
        Ok(Some(record)) => record,
        Ok(None) => return Push::Skipped,
        Err(e) => {
            warn!(agent_id, error = %e, operation = "poll_latest", "poll latest metric failed");
            return Push::Skipped;
        }
    };
    if high_water.is_some_and(|mark| record.collected_at <= mark) {
        return Push::Skipped;
    }
    let payload = match serde_json::to_string(&record) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(agent_id, error = %e, operation = "encode_live", "encode live metric failed");
            return Push::Skipped;
        }
    };
    let collected_at = record.collected_at;
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Push::Cancelled,
        sent = tx.send(LiveUpdate { record, payload }) => match sent {
            Ok(()) => Push::Sent(collected_at),
            Err(_) => Push::Gone,
        },
    }
}
