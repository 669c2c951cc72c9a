use serde::Deserialize;

use crate::wire::DEFAULT_MAX_FRAME_BYTES;

/// Collector process configuration (`collector.toml`).
#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    pub server: ServerConfig,
    pub ingest: IngestConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub live: LiveConfig,
    #[serde(default)]
    pub query: QueryConfig,
    pub monitoring: MonitoringConfig,
}

/// HTTP query and live-feed listener.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

/// TCP listener for agent streams.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    pub addr: String,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// PEM certificate chain; with `tls_key_path`, the listener speaks TLS.
    #[serde(default)]
    pub tls_cert_path: Option<String>,
    #[serde(default)]
    pub tls_key_path: Option<String>,
    /// On shutdown, connections keep draining already-sent frames for up to this long.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
    pub max_pool_size: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LiveConfig {
    /// How often each live subscription polls the store for a newer record.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    /// Result cap for history queries without a positive `limit`.
    #[serde(default = "default_query_limit")]
    pub default_limit: i64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_limit: default_query_limit(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    /// How often to log ingest stats (connections, saved/rejected/dropped) at INFO level.
    pub stats_log_interval_secs: u64,
}

/// Agent process configuration (`agent.toml`).
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub agent: AgentSection,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    /// Collector ingest address (host:port).
    pub server_addr: String,
    /// Defaults to the host name when unset.
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// CA bundle for verifying the collector; unset means plain TCP.
    #[serde(default)]
    pub ca_cert_path: Option<String>,
    /// Name the collector certificate must match. Defaults to the host of `server_addr`.
    #[serde(default)]
    pub server_name: Option<String>,
}

/// Reconnection after a failed stream. `max_attempts = 0` ends the session on the
/// first send failure.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default)]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

fn default_shutdown_grace_ms() -> u64 {
    2000
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_query_limit() -> i64 {
    60
}

fn default_interval_ms() -> u64 {
    2000
}

fn default_dial_timeout_ms() -> u64 {
    5000
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn read_config_file(default_path: &str) -> anyhow::Result<String> {
    let path = std::env::var("CONFIG_FILE").unwrap_or_else(|_| default_path.into());
    std::fs::read_to_string(&path).map_err(|e| anyhow::anyhow!("read config {}: {}", path, e))
}

impl CollectorConfig {
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from_str(&read_config_file("collector.toml")?)
    }

    /// Parse and validate config from a string (e.g. for tests).
    pub fn load_from_str(s: &str) -> anyhow::Result<Self> {
        let config: CollectorConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.server.port > 0,
            "server.port must be between 1 and 65535, got {}",
            self.server.port
        );
        anyhow::ensure!(!self.ingest.addr.is_empty(), "ingest.addr must be non-empty");
        anyhow::ensure!(
            self.ingest.max_frame_bytes > 0,
            "ingest.max_frame_bytes must be > 0, got {}",
            self.ingest.max_frame_bytes
        );
        anyhow::ensure!(
            self.ingest.tls_cert_path.is_some() == self.ingest.tls_key_path.is_some(),
            "ingest.tls_cert_path and ingest.tls_key_path must be set together"
        );
        anyhow::ensure!(
            self.ingest.tls_cert_path.as_deref() != Some("")
                && self.ingest.tls_key_path.as_deref() != Some(""),
            "ingest.tls_cert_path and ingest.tls_key_path must be non-empty when set"
        );
        anyhow::ensure!(
            !self.database.path.is_empty(),
            "database.path must be non-empty"
        );
        anyhow::ensure!(
            self.database.max_pool_size > 0,
            "database.max_pool_size must be > 0, got {}",
            self.database.max_pool_size
        );
        anyhow::ensure!(
            self.live.poll_interval_ms > 0,
            "live.poll_interval_ms must be > 0, got {}",
            self.live.poll_interval_ms
        );
        anyhow::ensure!(
            self.query.default_limit > 0,
            "query.default_limit must be > 0, got {}",
            self.query.default_limit
        );
        anyhow::ensure!(
            self.monitoring.stats_log_interval_secs > 0,
            "monitoring.stats_log_interval_secs must be > 0, got {}",
            self.monitoring.stats_log_interval_secs
        );
        Ok(())
    }
}

impl AgentConfig {
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from_str(&read_config_file("agent.toml")?)
    }

    /// Parse and validate config from a string (e.g. for tests).
    pub fn load_from_str(s: &str) -> anyhow::Result<Self> {
        let config: AgentConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Configured id, else the host name, else a fixed placeholder.
    pub fn resolve_agent_id(&self, host_name: Option<String>) -> String {
        self.agent
            .agent_id
            .clone()
            .or(host_name)
            .unwrap_or_else(|| "unknown-agent".into())
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.agent.server_addr.trim().is_empty(),
            "agent.server_addr must be non-empty"
        );
        anyhow::ensure!(
            self.agent.agent_id.as_deref() != Some(""),
            "agent.agent_id must be non-empty when set"
        );
        anyhow::ensure!(
            self.agent.interval_ms > 0,
            "agent.interval_ms must be > 0, got {}",
            self.agent.interval_ms
        );
        anyhow::ensure!(
            self.agent.dial_timeout_ms > 0,
            "agent.dial_timeout_ms must be > 0, got {}",
            self.agent.dial_timeout_ms
        );
        anyhow::ensure!(
            self.agent.max_frame_bytes > 0,
            "agent.max_frame_bytes must be > 0, got {}",
            self.agent.max_frame_bytes
        );
        anyhow::ensure!(
            self.agent.ca_cert_path.as_deref() != Some(""),
            "agent.ca_cert_path must be non-empty when set"
        );
        anyhow::ensure!(
            self.agent.server_name.is_none() || self.agent.ca_cert_path.is_some(),
            "agent.server_name requires agent.ca_cert_path"
        );
        anyhow::ensure!(
            self.agent.server_name.as_deref() != Some(""),
            "agent.server_name must be non-empty when set"
        );
        anyhow::ensure!(
            self.reconnect.initial_backoff_ms > 0,
            "reconnect.initial_backoff_ms must be > 0, got {}",
            self.reconnect.initial_backoff_ms
        );
        anyhow::ensure!(
            self.reconnect.max_backoff_ms >= self.reconnect.initial_backoff_ms,
            "reconnect.max_backoff_ms must be >= reconnect.initial_backoff_ms, got {}",
            self.reconnect.max_backoff_ms
        );
        Ok(())
    }
}
