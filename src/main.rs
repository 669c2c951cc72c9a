use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use telemetry::*;
use tokio_util::sync::CancellationToken;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let app_config = config::CollectorConfig::load()?;
    tracing::info!(name = version::NAME, version = version::VERSION, "Starting collector");

    let history_repo = Arc::new(
        history_repo::HistoryRepo::connect(
            &app_config.database.path,
            app_config.database.max_pool_size,
        )
        .await?,
    );
    history_repo.init().await?;
    let store: Arc<dyn history_repo::MetricStore> = history_repo.clone();

    let shutdown = CancellationToken::new();

    let mut ingest = ingest::IngestService::new(
        store.clone(),
        ingest::RateState::new(),
        app_config.ingest.max_frame_bytes,
    )
    .with_shutdown_grace(Duration::from_millis(app_config.ingest.shutdown_grace_ms));
    let tls_acceptor = tls::server_acceptor(&app_config.ingest)?;
    let ingest_tls = tls_acceptor.is_some();
    if let Some(acceptor) = tls_acceptor {
        ingest = ingest.with_tls(acceptor);
    }
    let ingest = Arc::new(ingest);
    let ingest_listener = tokio::net::TcpListener::bind(&app_config.ingest.addr).await?;
    tracing::info!(tls = ingest_tls, "Ingest listening on {}", app_config.ingest.addr);
    let ingest_handle = tokio::spawn(ingest.clone().serve(ingest_listener, shutdown.clone()));

    let stats_handle = tokio::spawn(log_stats(
        ingest.clone(),
        Duration::from_secs(app_config.monitoring.stats_log_interval_secs),
        shutdown.clone(),
    ));

    let distribution = Arc::new(distribution::DistributionService::new(
        store,
        Duration::from_millis(app_config.live.poll_interval_ms),
        app_config.query.default_limit,
    ));
    let app = routes::app(distribution, shutdown.clone());
    let addr = format!("{}:{}", app_config.server.host, app_config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on http://{}", addr);

    let signal_cancel = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Received shutdown signal");
        signal_cancel.cancel();
    });

    let server_shutdown = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await;
    // Also reached when the HTTP server fails on its own.
    shutdown.cancel();

    match ingest_handle.await {
        Ok(Err(e)) => tracing::error!(error = %e, "ingest listener failed"),
        Err(e) => tracing::error!(error = %e, "ingest task panicked"),
        Ok(Ok(())) => {}
    }
    let _ = stats_handle.await;
    history_repo.close().await;
    served?;
    tracing::info!("Collector stopped");
    Ok(())
}

async fn log_stats(
    ingest: Arc<ingest::IngestService>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                let stats = ingest.stats();
                tracing::info!(
                    connections = stats.connections_active,
                    saved = stats.records_saved,
                    rejected = stats.records_rejected,
                    dropped = stats.records_dropped,
                    agents_tracked = ingest.rates().len(),
                    "ingest stats"
                );
            }
        }
    }
}
