// Agent side of the ingest stream: connect, send one sample immediately, then one per
// interval until cancelled. Collection failures skip a tick; send failures end the
// session unless a reconnect budget is configured.

use bytes::Bytes;
use futures_util::SinkExt;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{Duration, Instant, interval_at, sleep, timeout};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::AgentConfig;
use crate::error::SessionError;
use crate::sysinfo_repo::SampleSource;
use crate::tls::ClientTls;
use crate::wire;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Streaming,
    Closed,
}

/// Plain TCP or TLS over TCP.
trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

type MetricFrames = Framed<Box<dyn Transport>, LengthDelimitedCodec>;

/// How a streaming phase ended.
enum StreamEnd {
    Cancelled,
    Failed(SessionError),
}

pub struct AgentSession {
    config: AgentConfig,
    agent_id: String,
    source: Arc<dyn SampleSource>,
    tls: Option<ClientTls>,
    state: watch::Sender<SessionState>,
}

impl AgentSession {
    pub fn new(config: AgentConfig, agent_id: String, source: Arc<dyn SampleSource>) -> Self {
        let (state, _) = watch::channel(SessionState::Connecting);
        Self {
            config,
            agent_id,
            source,
            tls: None,
            state,
        }
    }

    /// Dial the collector over TLS.
    pub fn with_tls(mut self, tls: ClientTls) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Observe state transitions (Connecting → Streaming → Closed).
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Run until cancelled (`Ok`) or until the transport fails (`Err`).
    /// The first connection attempt is never retried.
    #[instrument(skip_all, fields(agent_id = %self.agent_id, server = %self.config.agent.server_addr))]
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), SessionError> {
        let result = self.run_inner(&cancel).await;
        self.state.send_replace(SessionState::Closed);
        result
    }

    async fn run_inner(&self, cancel: &CancellationToken) -> Result<(), SessionError> {
        let Some(mut frames) = self.connect(cancel).await? else {
            return Ok(());
        };

        let mut attempts_left = self.config.reconnect.max_attempts;
        let mut backoff = Duration::from_millis(self.config.reconnect.initial_backoff_ms);
        let max_backoff = Duration::from_millis(self.config.reconnect.max_backoff_ms);

        loop {
            let err = match self.stream(&mut frames, cancel).await {
                StreamEnd::Cancelled => {
                    self.close(&mut frames).await;
                    return Ok(());
                }
                StreamEnd::Failed(e) => e,
            };

            // Bounded attempts with exponential backoff; the budget is restored once a
            // connection is re-established.
            let mut last_err = err;
            loop {
                if attempts_left == 0 {
                    return Err(last_err);
                }
                attempts_left -= 1;
                warn!(
                    error = %last_err,
                    backoff_ms = backoff.as_millis() as u64,
                    attempts_left,
                    "stream failed; reconnecting"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(max_backoff);
                match self.connect(cancel).await {
                    Ok(Some(next)) => {
                        frames = next;
                        attempts_left = self.config.reconnect.max_attempts;
                        backoff = Duration::from_millis(self.config.reconnect.initial_backoff_ms);
                        break;
                    }
                    Ok(None) => return Ok(()),
                    Err(e) => last_err = e,
                }
            }
        }
    }

    /// `Ok(None)` when cancelled while dialing.
    async fn connect(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<MetricFrames>, SessionError> {
        self.state.send_replace(SessionState::Connecting);
        let addr = self.config.agent.server_addr.clone();
        let dial_timeout_ms = self.config.agent.dial_timeout_ms;

        let dial = async {
            let socket = TcpStream::connect(&addr).await?;
            if let Err(e) = socket.set_nodelay(true) {
                debug!(error = %e, "set_nodelay failed");
            }
            let io: Box<dyn Transport> = match &self.tls {
                Some(tls) => Box::new(
                    tls.connector
                        .connect(tls.server_name.clone(), socket)
                        .await?,
                ),
                None => Box::new(socket),
            };
            Ok::<_, io::Error>(io)
        };

        // The bound covers the TLS handshake as well as the TCP connect.
        let dialed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            r = timeout(Duration::from_millis(dial_timeout_ms), dial) => r,
        };
        let io = match dialed {
            Ok(Ok(io)) => io,
            Ok(Err(source)) => return Err(SessionError::Dial { addr, source }),
            Err(_) => {
                return Err(SessionError::DialTimeout {
                    addr,
                    timeout_ms: dial_timeout_ms,
                });
            }
        };
        info!(tls = self.tls.is_some(), "connected to collector");
        Ok(Some(wire::framed(io, self.config.agent.max_frame_bytes)))
    }

    async fn stream(&self, frames: &mut MetricFrames, cancel: &CancellationToken) -> StreamEnd {
        self.state.send_replace(SessionState::Streaming);

        // A freshly started agent reports without waiting a full interval.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return StreamEnd::Cancelled,
            r = self.publish_sample(frames) => {
                if let Err(e) = r {
                    return StreamEnd::Failed(e);
                }
            }
        }

        let period = Duration::from_millis(self.config.agent.interval_ms);
        let mut tick = interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return StreamEnd::Cancelled,
                _ = tick.tick() => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return StreamEnd::Cancelled,
                        r = self.publish_sample(frames) => {
                            if let Err(e) = r {
                                return StreamEnd::Failed(e);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Collect and send one metric. A collection failure is logged and skipped.
    async fn publish_sample(&self, frames: &mut MetricFrames) -> Result<(), SessionError> {
        let metric = match self.source.sample(&self.agent_id).await {
            Ok(metric) => metric,
            Err(e) => {
                warn!(error = %e, operation = "sample", "sample metrics failed");
                return Ok(());
            }
        };
        let frame = wire::encode_metric(&metric)?;
        frames.send(frame).await.map_err(SessionError::Send)?;
        debug!(operation = "send_metric", "metric sent");
        Ok(())
    }

    /// Shut down the write half so the collector sees a clean end of stream.
    async fn close(&self, frames: &mut MetricFrames) {
        let deadline = Duration::from_millis(self.config.agent.dial_timeout_ms);
        match timeout(deadline, SinkExt::<Bytes>::close(frames)).await {
            Ok(Ok(())) => debug!("metric stream closed"),
            Ok(Err(e)) => warn!(error = %e, "closing metric stream"),
            Err(_) => warn!("closing metric stream timed out"),
        }
    }
}
