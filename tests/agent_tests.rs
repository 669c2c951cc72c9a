// AgentSession against a real ingest listener

mod common;

use common::{ScriptedSource, agent_config, eventually, temp_repo};
use std::sync::Arc;
use std::time::Duration;
use telemetry::agent::{AgentSession, SessionState};
use telemetry::error::SessionError;
use telemetry::history_repo::MetricStore;
use telemetry::ingest::{IngestService, RateState};
use telemetry::wire::DEFAULT_MAX_FRAME_BYTES;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn agent_streams_to_collector_until_cancelled() {
    let (_dir, repo) = temp_repo().await;
    let ingest = Arc::new(IngestService::new(
        repo.clone(),
        RateState::new(),
        DEFAULT_MAX_FRAME_BYTES,
    ));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server_cancel = CancellationToken::new();
    let server = tokio::spawn(ingest.clone().serve(listener, server_cancel.clone()));

    let source = Arc::new(ScriptedSource::new(0));
    let session = Arc::new(AgentSession::new(
        agent_config(&addr, 50),
        "test-agent".into(),
        source.clone(),
    ));
    let mut state = session.subscribe_state();
    let cancel = CancellationToken::new();
    let run = tokio::spawn({
        let session = session.clone();
        let cancel = cancel.clone();
        async move { session.run(cancel).await }
    });

    let repo_check = repo.clone();
    assert!(
        eventually(|| {
            let repo = repo_check.clone();
            async move { repo.list("test-agent", 0).await.unwrap().len() >= 3 }
        })
        .await
    );
    assert_eq!(*state.borrow_and_update(), SessionState::Streaming);

    cancel.cancel();
    run.await.unwrap().unwrap();
    assert_eq!(*state.borrow(), SessionState::Closed);

    let records = repo.list("test-agent", 0).await.unwrap();
    assert!(records.windows(2).all(|w| w[0].collected_at <= w[1].collected_at));
    assert!(records.iter().skip(1).any(|r| r.network_tx_rate > 0.0));

    // Clean end of stream releases the connection.
    let ingest_check = ingest.clone();
    assert!(
        eventually(|| {
            let ingest = ingest_check.clone();
            async move { ingest.stats().connections_active == 0 }
        })
        .await
    );
    server_cancel.cancel();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn agent_skips_failed_samples() {
    let (_dir, repo) = temp_repo().await;
    let ingest = Arc::new(IngestService::new(
        repo.clone(),
        RateState::new(),
        DEFAULT_MAX_FRAME_BYTES,
    ));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server_cancel = CancellationToken::new();
    tokio::spawn(ingest.serve(listener, server_cancel.clone()));

    let source = Arc::new(ScriptedSource::new(2));
    let session = AgentSession::new(agent_config(&addr, 30), "test-agent".into(), source.clone());
    let cancel = CancellationToken::new();
    let run = tokio::spawn({
        let cancel = cancel.clone();
        async move { session.run(cancel).await }
    });

    let repo_check = repo.clone();
    assert!(
        eventually(|| {
            let repo = repo_check.clone();
            async move { !repo.list("test-agent", 0).await.unwrap().is_empty() }
        })
        .await
    );
    assert!(source.calls() >= 3);
    cancel.cancel();
    run.await.unwrap().unwrap();
    server_cancel.cancel();
}

#[tokio::test]
async fn agent_dial_failure_is_an_error() {
    // Bind then drop to get a port nothing listens on.
    let addr = {
        let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap().to_string()
    };
    let session = AgentSession::new(
        agent_config(&addr, 50),
        "test-agent".into(),
        Arc::new(ScriptedSource::new(0)),
    );
    let state = session.subscribe_state();
    let err = session.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Dial { .. } | SessionError::DialTimeout { .. }
    ));
    assert_eq!(*state.borrow(), SessionState::Closed);
}

#[tokio::test]
async fn agent_cancel_before_connect_is_ok() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let session = AgentSession::new(
        agent_config("127.0.0.1:9", 50),
        "test-agent".into(),
        Arc::new(ScriptedSource::new(0)),
    );
    session.run(cancel).await.unwrap();
}

#[tokio::test]
async fn agent_send_failure_ends_session() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    // Accept once, then drop the socket and the listener.
    let acceptor = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        drop(socket);
    });

    let session = AgentSession::new(
        agent_config(&addr, 20),
        "test-agent".into(),
        Arc::new(ScriptedSource::new(0)),
    );
    let result = tokio::time::timeout(
        Duration::from_secs(10),
        session.run(CancellationToken::new()),
    )
    .await
    .expect("session should end on its own");
    acceptor.await.unwrap();
    assert!(matches!(result, Err(SessionError::Send(_))));
}
