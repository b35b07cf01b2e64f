use serde::Deserialize;
use tracing::trace;

/// Message broker backend configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum BrokerConfig {
    /// In-process broker (single-binary deployments and tests)
    Memory,

    /// Redis Streams broker (multi-process deployments)
    Redis {
        /// Connection URL, e.g. "redis://127.0.0.1:6379"
        url: String,
    },
}

/// Runtime key-value store configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    /// In-memory store (no persistence across restarts)
    Memory,

    /// Redis store (default for real deployments)
    Redis {
        /// Connection URL, e.g. "redis://127.0.0.1:6379"
        url: String,

        /// Per-deployment key namespace
        #[serde(default = "default_store_prefix")]
        prefix: String,
    },
}

fn default_store_prefix() -> String {
    "alerting".to_string()
}

/// Catalog-owner RPC endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    /// Base URL of the catalog owner, e.g. "http://alerting-platform-api:8000"
    pub base_url: String,

    /// Request timeout in seconds
    #[serde(default = "default_rpc_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_rpc_timeout_secs() -> u64 {
    5
}

/// Acknowledgment gateway HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Bind address (e.g., "127.0.0.1" or "0.0.0.0")
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    /// Port to listen on
    #[serde(default = "default_gateway_port")]
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_gateway_bind(),
            port: default_gateway_port(),
        }
    }
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_gateway_port() -> u16 {
    8080
}

/// Notifier (outbound email) configuration
///
/// The SMTP password is taken from the environment, not the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct NotifierConfig {
    pub smtp_host: String,

    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,

    pub smtp_user: Option<String>,

    /// From address for notification mail
    pub from: String,

    /// Public base URL the resolve link is built against,
    /// e.g. "https://alerts.example.com"
    pub resolve_base_url: String,
}

fn default_smtp_port() -> u16 {
    587
}

/// Incident manager tuning
#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConfig {
    /// Deadline sweep cadence in seconds (bounds escalation latency)
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_sweep_interval_secs() -> u64 {
    15
}

/// Probe worker tuning
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Maximum probes in flight at once
    #[serde(default = "default_max_outstanding")]
    pub max_outstanding: usize,

    /// Per-probe HTTP timeout in seconds
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_outstanding: default_max_outstanding(),
            probe_timeout_secs: default_probe_timeout_secs(),
        }
    }
}

fn default_max_outstanding() -> usize {
    10
}

fn default_probe_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub broker: BrokerConfig,

    pub store: StoreConfig,

    pub rpc: RpcConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Required by the notifier binary; other components ignore it
    pub notifier: Option<NotifierConfig>,

    #[serde(default)]
    pub manager: ManagerConfig,

    #[serde(default)]
    pub worker: WorkerConfig,
}

impl Config {
    /// Validate configuration parameters before any component starts
    pub fn validate(&self) -> Result<(), String> {
        if self.manager.sweep_interval_secs < 1 {
            return Err("manager.sweep_interval_secs must be at least 1".to_string());
        }
        if self.manager.sweep_interval_secs > 300 {
            return Err(
                "manager.sweep_interval_secs cannot exceed 300 (escalation would stall)"
                    .to_string(),
            );
        }
        if self.worker.max_outstanding < 1 {
            return Err("worker.max_outstanding must be at least 1".to_string());
        }
        if self.worker.probe_timeout_secs < 1 {
            return Err("worker.probe_timeout_secs must be at least 1".to_string());
        }
        if self.rpc.timeout_secs < 1 {
            return Err("rpc.timeout_secs must be at least 1".to_string());
        }
        if let Some(notifier) = &self.notifier {
            if notifier.smtp_host.is_empty() {
                return Err("notifier.smtp_host must not be empty".to_string());
            }
            if notifier.resolve_base_url.is_empty() {
                return Err("notifier.resolve_base_url must not be empty".to_string());
            }
        }
        Ok(())
    }
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)?;
    serde_json::from_str(&file_content)
        .map_err(|e| anyhow::anyhow!("Invalid configuration file provided: {e}"))
        .inspect(|config| trace!("loaded config: {config:?}"))
}

const ACK_SECRET: &str = "ALERTING_SECRET";

/// Shared secret for signing acknowledgment tokens. Required at startup.
pub fn ack_secret() -> anyhow::Result<String> {
    std::env::var(ACK_SECRET)
        .map_err(|_| anyhow::anyhow!("{ACK_SECRET} must be set in the environment"))
}

const SMTP_PASSWORD: &str = "SMTP_PASSWORD";

pub fn smtp_password() -> Option<String> {
    std::env::var(SMTP_PASSWORD).ok()
}
