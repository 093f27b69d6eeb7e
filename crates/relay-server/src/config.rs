//! Server configuration.
//!
//! Configuration is layered from:
//! - Built-in defaults (credentials and port fall back to `DISCORD_TOKEN`,
//!   `APP_ID`, `GUILD_ID`, `PUBLIC_KEY` and `PORT`)
//! - The TOML file named by `CCRELAY_CONFIG`, else the first one found in
//!   the search path
//! - Environment variables (`RELAY_PORT`, `RELAY_HEARTBEAT__INTERVAL_MS`, ...)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration files tried in order.
const CONFIG_PATHS: [&str; 3] = [
    "ccrelay.toml",
    "/etc/ccrelay/ccrelay.toml",
    "~/.config/ccrelay/ccrelay.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// HTTP routes.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Presence reconciliation.
    #[serde(default)]
    pub presence: PresenceConfig,

    /// Persistence backend.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Chat platform credentials.
    #[serde(default)]
    pub discord: DiscordConfig,

    /// Subscriptions applied at startup.
    #[serde(default)]
    pub subscriptions: SubscriptionsConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// HTTP route configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path producers open their WebSocket on.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Path of the chat-platform interactions webhook.
    #[serde(default = "default_interactions_path")]
    pub interactions_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of producer connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum producer payload size in bytes. Larger payloads are dropped.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Chat messages a connection may have waiting to be routed. Further
    /// messages are dropped until the queue drains.
    #[serde(default = "default_routing_queue")]
    pub routing_queue: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,
}

/// Presence reconciliation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Reconciliation interval in milliseconds.
    #[serde(default = "default_presence_interval")]
    pub interval_ms: u64,
}

/// Persistence backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Sled,
}

/// Persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_backend")]
    pub backend: StorageBackend,

    /// Database directory for the sled backend.
    #[serde(default = "default_storage_path")]
    pub path: String,
}

/// A credential that is never printed.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("Secret(<empty>)")
        } else {
            f.write_str("Secret(<redacted>)")
        }
    }
}

/// Chat platform configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    /// REST API base URL.
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Bot token used for REST calls.
    #[serde(default = "default_bot_token")]
    pub bot_token: Secret,

    /// Application ID commands are registered for.
    #[serde(default = "default_application_id")]
    pub application_id: String,

    /// Guild ID commands are registered in.
    #[serde(default = "default_guild_id")]
    pub guild_id: String,

    /// Interactions public key.
    #[serde(default = "default_public_key")]
    pub public_key: String,
}

/// A subscription applied at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedSubscription {
    pub topic: String,
    pub channel_id: String,
}

/// Startup subscriptions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionsConfig {
    #[serde(default)]
    pub seed: Vec<SeedSubscription>,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn env_or_empty(name: &str) -> String {
    std::env::var(name).unwrap_or_default()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3000)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/".to_string()
}

fn default_interactions_path() -> String {
    "/interactions".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_message_size() -> usize {
    ccrelay_protocol::codec::DEFAULT_MAX_EVENT_SIZE
}

fn default_routing_queue() -> usize {
    256
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_presence_interval() -> u64 {
    3_000 // 3 seconds
}

fn default_storage_backend() -> StorageBackend {
    StorageBackend::Memory
}

fn default_storage_path() -> String {
    "data/ccrelay".to_string()
}

fn default_api_base() -> String {
    "https://discord.com/api/v10".to_string()
}

fn default_bot_token() -> Secret {
    Secret(env_or_empty("DISCORD_TOKEN"))
}

fn default_application_id() -> String {
    env_or_empty("APP_ID")
}

fn default_guild_id() -> String {
    env_or_empty("GUILD_ID")
}

fn default_public_key() -> String {
    env_or_empty("PUBLIC_KEY")
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            presence: PresenceConfig::default(),
            storage: StorageConfig::default(),
            discord: DiscordConfig::default(),
            subscriptions: SubscriptionsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            interactions_path: default_interactions_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
            routing_queue: default_routing_queue(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
        }
    }
}

impl HeartbeatConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_presence_interval(),
        }
    }
}

impl PresenceConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            path: default_storage_path(),
        }
    }
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            bot_token: default_bot_token(),
            application_id: default_application_id(),
            guild_id: default_guild_id(),
            public_key: default_public_key(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from `CCRELAY_CONFIG` or the first config file
    /// found, overridden by `RELAY_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file or variable cannot be parsed.
    pub fn load() -> Result<Self> {
        let base = match Self::find_config_file() {
            Some(path) => {
                tracing::info!("Loading configuration from {}", path.display());
                Self::from_file(path)?
            }
            None => Self::default(),
        };

        config::Config::builder()
            .add_source(config::Config::try_from(&base).context("Failed to layer configuration")?)
            .add_source(
                config::Environment::with_prefix("RELAY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")
    }

    fn find_config_file() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("CCRELAY_CONFIG") {
            return Some(PathBuf::from(shellexpand::tilde(&path).as_ref()));
        }

        CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }
}
