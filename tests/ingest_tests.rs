// IngestService: validation, enrichment, persistence failures and the framed TCP path

mod common;

use bytes::BytesMut;
use common::{FailingStore, metric, temp_repo};
use futures_util::SinkExt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use telemetry::error::ValidationError;
use telemetry::history_repo::MetricStore;
use telemetry::ingest::{IngestOutcome, IngestService, RateState};
use telemetry::wire::{self, DEFAULT_MAX_FRAME_BYTES};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

fn service(store: Arc<dyn MetricStore>) -> Arc<IngestService> {
    Arc::new(IngestService::new(
        store,
        RateState::new(),
        DEFAULT_MAX_FRAME_BYTES,
    ))
}

fn frame(m: &telemetry::models::Metric) -> BytesMut {
    BytesMut::from(&wire::encode_metric(m).unwrap()[..])
}

#[tokio::test]
async fn ingest_saves_enriched_records() {
    let (_dir, repo) = temp_repo().await;
    let svc = service(repo.clone());

    assert!(matches!(
        svc.ingest_metric(metric("host-1", 0, 1000)).await,
        IngestOutcome::Saved(_)
    ));
    let IngestOutcome::Saved(second) = svc.ingest_metric(metric("host-1", 2_000, 3000)).await
    else {
        panic!("expected saved");
    };
    assert_eq!(second.network_tx_rate, 1000.0);

    let stored = repo.list("host-1", 0).await.unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[1].network_tx_rate, 1000.0);
    assert_eq!(svc.stats().records_saved, 2);
}

#[tokio::test]
async fn ingest_rejects_empty_agent_id_without_side_effects() {
    let (_dir, repo) = temp_repo().await;
    let svc = service(repo.clone());

    let outcome = svc.ingest_metric(metric("", 1_000, 10)).await;
    assert!(matches!(
        outcome,
        IngestOutcome::Rejected(ValidationError::MissingAgentId)
    ));
    assert!(svc.rates().is_empty());
    assert!(repo.agents().await.unwrap().is_empty());
    assert_eq!(svc.stats().records_rejected, 1);
}

#[tokio::test]
async fn ingest_rejects_malformed_frame() {
    let (_dir, repo) = temp_repo().await;
    let svc = service(repo.clone());
    assert!(matches!(
        svc.ingest_frame(&[1, 2, 3]).await,
        IngestOutcome::Rejected(ValidationError::MalformedFrame(_))
    ));
    assert!(matches!(
        svc.ingest_frame(&[]).await,
        IngestOutcome::Rejected(ValidationError::MalformedFrame(_))
    ));
    assert!(svc.rates().is_empty());
}

#[tokio::test]
async fn ingest_missing_timestamp_uses_receive_time() {
    let (_dir, repo) = temp_repo().await;
    let svc = service(repo);
    let mut m = metric("host-1", 0, 0);
    m.collected_at_ms = None;
    let before = chrono::Utc::now();
    let IngestOutcome::Saved(record) = svc.ingest_metric(m).await else {
        panic!("expected saved");
    };
    assert!(record.collected_at >= before);
    assert!(record.collected_at <= chrono::Utc::now());
}

#[tokio::test]
async fn ingest_persistence_failure_still_updates_rates() {
    let svc = service(Arc::new(FailingStore));
    assert!(matches!(
        svc.ingest_metric(metric("host-1", 0, 1000)).await,
        IngestOutcome::Dropped(_)
    ));
    assert_eq!(
        svc.rates().previous("host-1").unwrap().network_tx_bytes,
        1000
    );
    let IngestOutcome::Dropped(_) = svc.ingest_metric(metric("host-1", 1_000, 2000)).await else {
        panic!("expected dropped");
    };
    assert_eq!(svc.stats().records_dropped, 2);
}

#[tokio::test]
async fn handle_stream_skips_bad_frames_and_ends_cleanly() {
    let (_dir, repo) = temp_repo().await;
    let svc = service(repo.clone());
    let frames = futures_util::stream::iter(vec![
        Ok(frame(&metric("host-1", 1_000, 0))),
        Ok(BytesMut::from(&[7u8, 0, 0][..])),
        Ok(frame(&metric("", 1_500, 0))),
        Ok(frame(&metric("host-1", 2_000, 0))),
    ]);
    svc.handle_stream(frames, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(repo.list("host-1", 0).await.unwrap().len(), 2);
    let stats = svc.stats();
    assert_eq!(stats.records_saved, 2);
    assert_eq!(stats.records_rejected, 2);
}

#[tokio::test]
async fn handle_stream_returns_transport_error() {
    let (_dir, repo) = temp_repo().await;
    let svc = service(repo.clone());
    let frames = futures_util::stream::iter(vec![
        Ok(frame(&metric("host-1", 1_000, 0))),
        Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        Ok(frame(&metric("host-1", 2_000, 0))),
    ]);
    let err = svc
        .handle_stream(frames, CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    assert_eq!(repo.list("host-1", 0).await.unwrap().len(), 1);
}

#[tokio::test]
async fn handle_stream_stops_on_cancel_after_grace() {
    let (_dir, repo) = temp_repo().await;
    let svc = IngestService::new(repo, RateState::new(), DEFAULT_MAX_FRAME_BYTES)
        .with_shutdown_grace(Duration::from_millis(50));
    let cancel = CancellationToken::new();
    cancel.cancel();
    let frames = futures_util::stream::pending::<io::Result<BytesMut>>();
    timeout(Duration::from_secs(2), svc.handle_stream(frames, cancel))
        .await
        .expect("stream closed after the grace period")
        .unwrap();
}

#[tokio::test]
async fn handle_stream_drains_buffered_frames_on_cancel() {
    let (_dir, repo) = temp_repo().await;
    let svc = service(repo.clone());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let frames = futures_util::stream::iter(vec![
        Ok(frame(&metric("host-1", 1_000, 0))),
        Ok(frame(&metric("host-1", 2_000, 500))),
    ]);
    svc.handle_stream(frames, cancel).await.unwrap();

    let listed = repo.list("host-1", 0).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[1].network_tx_rate, 500.0);
}

#[tokio::test]
async fn serve_closes_idle_connection_after_grace() {
    let (_dir, repo) = temp_repo().await;
    let svc = Arc::new(
        IngestService::new(repo.clone(), RateState::new(), DEFAULT_MAX_FRAME_BYTES)
            .with_shutdown_grace(Duration::from_millis(100)),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let server = tokio::spawn(svc.clone().serve(listener, cancel.clone()));

    // Sends one frame, then holds the connection open without closing it.
    let socket = tokio::net::TcpStream::connect(addr).await.unwrap();
    let mut frames = wire::framed(socket, DEFAULT_MAX_FRAME_BYTES);
    frames
        .send(wire::encode_metric(&metric("idle", 1_000, 0)).unwrap())
        .await
        .unwrap();
    let repo_check = repo.clone();
    assert!(
        common::eventually(|| {
            let repo = repo_check.clone();
            async move { repo.list("idle", 0).await.unwrap().len() == 1 }
        })
        .await
    );

    cancel.cancel();
    timeout(Duration::from_secs(2), server)
        .await
        .expect("serve returned despite the open connection")
        .unwrap()
        .unwrap();
    assert_eq!(svc.stats().connections_active, 0);
    drop(frames);
}

#[tokio::test]
async fn serve_accepts_concurrent_agents_over_tcp() {
    let (_dir, repo) = temp_repo().await;
    let svc = service(repo.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let server = tokio::spawn(svc.clone().serve(listener, cancel.clone()));

    let mut senders = Vec::new();
    for agent in ["a", "b", "c"] {
        senders.push(tokio::spawn(async move {
            let socket = tokio::net::TcpStream::connect(addr).await.unwrap();
            let mut frames = wire::framed(socket, DEFAULT_MAX_FRAME_BYTES);
            for step in 0..3i64 {
                let m = metric(agent, step * 1_000, (step as u64) * 500);
                frames.send(wire::encode_metric(&m).unwrap()).await.unwrap();
            }
            SinkExt::<bytes::Bytes>::close(&mut frames).await.unwrap();
        }));
    }
    for s in senders {
        s.await.unwrap();
    }

    let repo_check = repo.clone();
    assert!(
        common::eventually(|| {
            let repo = repo_check.clone();
            async move {
                let mut total = 0;
                for agent in ["a", "b", "c"] {
                    total += repo.list(agent, 0).await.unwrap().len();
                }
                total == 9
            }
        })
        .await
    );
    let latest = repo.latest("b").await.unwrap().unwrap();
    assert_eq!(latest.network_tx_rate, 500.0);

    cancel.cancel();
    server.await.unwrap().unwrap();
    assert_eq!(svc.stats().connections_active, 0);
}
