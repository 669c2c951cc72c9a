use anyhow::Result;
use std::sync::Arc;
use telemetry::*;
use tokio_util::sync::CancellationToken;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let agent_config = config::AgentConfig::load()?;
    let agent_id = agent_config.resolve_agent_id(sysinfo_repo::SysinfoRepo::host_name());
    tracing::info!(
        name = version::NAME,
        version = version::VERSION,
        agent_id = %agent_id,
        "Starting agent"
    );

    let client_tls = tls::client_tls(&agent_config.agent)?;
    let source = Arc::new(sysinfo_repo::SysinfoRepo::new());
    let mut session = agent::AgentSession::new(agent_config, agent_id, source);
    if let Some(client_tls) = client_tls {
        session = session.with_tls(client_tls);
    }

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Received shutdown signal");
        signal_cancel.cancel();
    });

    session.run(cancel).await?;
    tracing::info!("Agent stopped");
    Ok(())
}
