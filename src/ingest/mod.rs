// Collector side of the ingest stream. One task per agent connection reads frames,
// validates them, derives rates against the shared RateState and appends to history.

pub mod rates;

pub use rates::RateState;

use bytes::BytesMut;
use chrono::Utc;
use futures_util::{Stream, StreamExt};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Instant, timeout, timeout_at};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{PersistenceError, ValidationError};
use crate::history_repo::MetricStore;
use crate::models::{Metric, MetricRecord};
use crate::wire;

/// What happened to one received message.
#[derive(Debug)]
pub enum IngestOutcome {
    Saved(MetricRecord),
    Rejected(ValidationError),
    /// Enriched (RateState updated) but not persisted; the record is gone.
    Dropped(PersistenceError),
}

#[derive(Default)]
struct IngestCounters {
    connections_active: AtomicUsize,
    records_saved: AtomicU64,
    records_rejected: AtomicU64,
    records_dropped: AtomicU64,
}

/// Point-in-time copy of the ingest counters, logged periodically by the collector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub connections_active: usize,
    pub records_saved: u64,
    pub records_rejected: u64,
    pub records_dropped: u64,
}

/// Decrements the active connection count on drop (connect = +1, drop = -1).
struct ConnectionGuard<'a>(&'a AtomicUsize);

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Default time a connection keeps draining frames after shutdown starts.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
/// Upper bound for a client to complete the TLS handshake.
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct IngestService {
    store: Arc<dyn MetricStore>,
    rates: RateState,
    counters: IngestCounters,
    max_frame_bytes: usize,
    tls: Option<TlsAcceptor>,
    shutdown_grace: Duration,
}

impl IngestService {
    pub fn new(store: Arc<dyn MetricStore>, rates: RateState, max_frame_bytes: usize) -> Self {
        Self {
            store,
            rates,
            counters: IngestCounters::default(),
            max_frame_bytes,
            tls: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// Require TLS on every agent connection.
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn rates(&self) -> &RateState {
        &self.rates
    }

    pub fn stats(&self) -> IngestStats {
        IngestStats {
            connections_active: self.counters.connections_active.load(Ordering::Relaxed),
            records_saved: self.counters.records_saved.load(Ordering::Relaxed),
            records_rejected: self.counters.records_rejected.load(Ordering::Relaxed),
            records_dropped: self.counters.records_dropped.load(Ordering::Relaxed),
        }
    }

    /// Accept agent connections until `cancel` fires, then wait for the
    /// connection handlers to return.
    #[instrument(skip_all, fields(addr = ?listener.local_addr().ok()))]
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> io::Result<()> {
        let tracker = TaskTracker::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, operation = "accept", "accept failed");
                            continue;
                        }
                    };
                    let service = self.clone();
                    let cancel = cancel.clone();
                    tracker.spawn(async move {
                        if let Err(e) = service.handle_connection(socket, peer, cancel).await {
                            warn!(peer = %peer, error = %e, "ingest stream terminated");
                        }
                    });
                }
            }
        }
        tracker.close();
        tracker.wait().await;
        debug!("ingest listener stopped");
        Ok(())
    }

    #[instrument(skip(self, socket, cancel), fields(peer = %peer))]
    async fn handle_connection(
        &self,
        socket: TcpStream,
        peer: SocketAddr,
        cancel: CancellationToken,
    ) -> io::Result<()> {
        if let Err(e) = socket.set_nodelay(true) {
            debug!(error = %e, "set_nodelay failed");
        }
        self.counters
            .connections_active
            .fetch_add(1, Ordering::Relaxed);
        let _guard = ConnectionGuard(&self.counters.connections_active);
        info!("agent connected");

        let result = match &self.tls {
            Some(acceptor) => match timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(socket)).await {
                Ok(Ok(stream)) => {
                    self.handle_stream(wire::framed(stream, self.max_frame_bytes), cancel)
                        .await
                }
                Ok(Err(e)) => {
                    warn!(error = %e, operation = "tls_accept", "tls handshake failed");
                    Err(e)
                }
                Err(_) => {
                    warn!(operation = "tls_accept", "tls handshake timed out");
                    Err(io::Error::new(io::ErrorKind::TimedOut, "tls handshake timed out"))
                }
            },
            None => {
                self.handle_stream(wire::framed(socket, self.max_frame_bytes), cancel)
                    .await
            }
        };
        info!("agent disconnected");
        result
    }

    /// Consume frames until the stream ends (clean return) or a transport error
    /// (returned). After `cancel` fires, frames already in flight keep being
    /// ingested until the stream ends or the shutdown grace period runs out; a
    /// message already being processed is always finished.
    pub async fn handle_stream<S>(&self, mut frames: S, cancel: CancellationToken) -> io::Result<()>
    where
        S: Stream<Item = io::Result<BytesMut>> + Unpin,
    {
        let mut drain_deadline: Option<Instant> = None;
        loop {
            let next = match drain_deadline {
                Some(deadline) => match timeout_at(deadline, frames.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        debug!("shutdown grace elapsed; closing stream");
                        return Ok(());
                    }
                },
                None => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        drain_deadline = Some(Instant::now() + self.shutdown_grace);
                        continue;
                    }
                    next = frames.next() => next,
                },
            };
            match next {
                None => return Ok(()),
                Some(Err(e)) => {
                    error!(error = %e, operation = "receive_metric", "receive metric failed");
                    return Err(e);
                }
                Some(Ok(frame)) => {
                    self.ingest_frame(&frame).await;
                }
            }
        }
    }

    pub async fn ingest_frame(&self, frame: &[u8]) -> IngestOutcome {
        match wire::decode_metric(frame) {
            Ok(metric) => self.ingest_metric(metric).await,
            Err(e) => self.reject(e),
        }
    }

    /// Validate, enrich and persist one raw sample.
    pub async fn ingest_metric(&self, metric: Metric) -> IngestOutcome {
        let record = match MetricRecord::from_metric(metric, Utc::now()) {
            Ok(record) => record,
            Err(e) => return self.reject(e),
        };

        let record = self.rates.enrich(record);

        match self.store.save(&record).await {
            Ok(()) => {
                self.counters.records_saved.fetch_add(1, Ordering::Relaxed);
                debug!(agent_id = %record.agent_id, "metric saved");
                IngestOutcome::Saved(record)
            }
            Err(e) => {
                self.counters.records_dropped.fetch_add(1, Ordering::Relaxed);
                error!(
                    agent_id = %record.agent_id,
                    error = %e,
                    operation = "save_metric",
                    "save metric failed; record dropped"
                );
                IngestOutcome::Dropped(e)
            }
        }
    }

    fn reject(&self, e: ValidationError) -> IngestOutcome {
        self.counters
            .records_rejected
            .fetch_add(1, Ordering::Relaxed);
        warn!(error = %e, "discarding metric");
        IngestOutcome::Rejected(e)
    }
}
