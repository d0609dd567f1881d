//! Server configuration.
//!
//! Configuration is layered:
//! - defaults,
//! - the first TOML file found in [`CONFIG_PATHS`] (or the one given explicitly),
//! - environment variables prefixed with `TRELLIS_`, nested with `__`
//!   (e.g. `TRELLIS_LIMITS__MAX_MESSAGE_SIZE=1048576`).

use anyhow::{Context, Result};
use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use trellis_core::{KeyRule, ServiceConfig};

/// Locations searched for a configuration file, in order.
pub const CONFIG_PATHS: [&str; 3] = [
    "trellis.toml",
    "/etc/trellis/trellis.toml",
    "~/.config/trellis/trellis.toml",
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

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Retained message storage.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Presence configuration.
    #[serde(default)]
    pub presence: PresenceConfig,

    /// Static keys. When empty, every request is allowed under contract 1.
    #[serde(default)]
    pub keys: Vec<KeyRule>,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum subscriptions per connection.
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions_per_connection: usize,

    /// Maximum frame size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Outbound queue length per connection. Messages beyond it are dropped.
    #[serde(default = "default_delivery_capacity")]
    pub delivery_capacity: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval announced to clients, in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Idle time after which a connection is closed, in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
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

/// Storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// Retain nothing.
    None,
    /// Keep recent messages in memory.
    Memory,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_kind")]
    pub kind: StorageKind,

    /// Messages retained per channel.
    #[serde(default = "default_storage_capacity")]
    pub capacity: usize,

    /// How often expired messages are swept, in milliseconds.
    #[serde(default = "default_purge_interval")]
    pub purge_interval_ms: u64,
}

/// Presence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Publish presence notifications on subscription changes.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_subscriptions() -> usize {
    100
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_delivery_capacity() -> usize {
    1024
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_heartbeat_timeout() -> u64 {
    60_000 // 60 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_storage_kind() -> StorageKind {
    StorageKind::Memory
}

fn default_storage_capacity() -> usize {
    64
}

fn default_purge_interval() -> u64 {
    60_000 // 1 minute
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
            storage: StorageConfig::default(),
            presence: PresenceConfig::default(),
            keys: Vec::new(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_subscriptions_per_connection: default_max_subscriptions(),
            max_message_size: default_max_message_size(),
            delivery_capacity: default_delivery_capacity(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
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

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: default_storage_kind(),
            capacity: default_storage_capacity(),
            purge_interval_ms: default_purge_interval(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Config {
    /// Load configuration from `path`, or from the first file found in
    /// [`CONFIG_PATHS`], with environment overrides applied on top.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or if an
    /// override has the wrong type.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let file = match path {
            Some(path) => Some(shellexpand::tilde(path).into_owned()),
            None => CONFIG_PATHS
                .iter()
                .map(|p| shellexpand::tilde(p).into_owned())
                .find(|p| Path::new(p).exists()),
        };

        let mut builder = config::Config::builder();
        if let Some(file) = &file {
            tracing::info!("Loading configuration from {}", file);
            builder = builder.add_source(File::new(file, FileFormat::Toml).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("TRELLIS")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")
    }

    /// Load configuration from a TOML file, without environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a valid socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Configuration of the pub/sub service.
    #[must_use]
    pub fn service(&self) -> ServiceConfig {
        ServiceConfig {
            max_subscriptions_per_connection: self.limits.max_subscriptions_per_connection,
            presence: self.presence.enabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::Action;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.transport.websocket_path, "/ws");
        assert_eq!(config.storage.kind, StorageKind::Memory);
        assert_eq!(config.storage.purge_interval_ms, 60_000);
        assert!(config.keys.is_empty());
        assert_eq!(config.bind_addr().unwrap().port(), 8080);
    }

    #[test]
    fn test_invalid_bind_addr() {
        let config = Config {
            host: "not a host".into(),
            ..Config::default()
        };
        assert!(config.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [limits]
            max_subscriptions_per_connection = 10

            [storage]
            kind = "none"

            [presence]
            enabled = false

            [[keys]]
            key = "reader"
            contract = 7
            channel = "news/#"
            permissions = ["read", "presence"]
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.limits.max_subscriptions_per_connection, 10);
        assert_eq!(config.limits.delivery_capacity, 1024);
        assert_eq!(config.storage.kind, StorageKind::None);
        assert_eq!(config.keys.len(), 1);
        assert_eq!(config.keys[0].permissions, vec![Action::Subscribe, Action::Presence]);

        let service = config.service();
        assert_eq!(service.max_subscriptions_per_connection, 10);
        assert!(!service.presence);
    }

    #[test]
    fn test_config_rejects_bad_channel() {
        let toml_str = r#"
            [[keys]]
            key = "k"
            contract = 1
            channel = "news//x"
            permissions = ["read"]
        "#;
        assert!(toml::from_str::<Config>(toml_str).is_err());
    }
}
