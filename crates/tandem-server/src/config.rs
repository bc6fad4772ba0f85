//! Server configuration.
//!
//! Configuration is layered:
//! - Built-in defaults
//! - The first TOML file found in [`CONFIG_PATHS`]
//! - Environment variables (`TANDEM_*`, nested keys joined with `__`, e.g.
//!   `TANDEM_LIMITS__MAX_MESSAGE_SIZE=131072`)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Config file locations, in lookup order.
pub const CONFIG_PATHS: [&str; 3] = [
    "tandem.toml",
    "/etc/tandem/tandem.toml",
    "~/.config/tandem/tandem.toml",
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

    /// Heartbeat and presence timeouts.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Authentication.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Document directory.
    #[serde(default)]
    pub documents: DocumentsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Query parameter carrying the document id or alias.
    #[serde(default = "default_document_param")]
    pub document_param: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of documents with a live hub.
    #[serde(default = "default_max_documents")]
    pub max_documents: usize,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Frames buffered per connection before it is evicted as a slow
    /// consumer.
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Ping interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Silence after which a connection is dropped, in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,

    /// Awareness states not refreshed within this many milliseconds are
    /// removed.
    #[serde(default = "default_awareness_timeout")]
    pub awareness_timeout_ms: u64,
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

/// Authentication configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Admit connections without a token as an anonymous user.
    #[serde(default)]
    pub allow_anonymous: bool,

    /// Static bearer tokens.
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
}

/// A static bearer token.
///
/// Tokens are values rather than table keys because the layered loader
/// lowercases keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEntry {
    /// The token, matched exactly.
    pub token: String,

    /// User id the token authenticates as.
    pub user: String,
}

impl TokenEntry {
    /// Create a token entry.
    pub fn new(token: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            user: user.into(),
        }
    }
}

/// Document directory configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentsConfig {
    /// Any well-formed id resolves to itself and is readable by everyone.
    #[serde(default)]
    pub open: bool,

    /// Known documents.
    #[serde(default)]
    pub entries: Vec<DocumentEntry>,
}

/// A known document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentEntry {
    /// Canonical id.
    pub id: String,

    /// Alternative names resolving to `id`.
    #[serde(default)]
    pub aliases: Vec<String>,

    /// Users allowed to read the document.
    #[serde(default)]
    pub readers: Vec<String>,

    /// Readable by every user, including anonymous ones.
    #[serde(default)]
    pub public: bool,
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

fn default_document_param() -> String {
    "noteId".to_string()
}

fn default_max_documents() -> usize {
    10_000
}

fn default_max_message_size() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_outbound_queue_capacity() -> usize {
    1024
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_heartbeat_timeout() -> u64 {
    60_000 // 60 seconds
}

fn default_awareness_timeout() -> u64 {
    30_000
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
            metrics: MetricsConfig::default(),
            auth: AuthConfig::default(),
            documents: DocumentsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            document_param: default_document_param(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_documents: default_max_documents(),
            max_message_size: default_max_message_size(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
            awareness_timeout_ms: default_awareness_timeout(),
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
    /// Load configuration from the first config file found, overlaid with
    /// `TANDEM_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment override has the wrong type.
    pub fn load() -> Result<Self> {
        for path in CONFIG_PATHS {
            let expanded = shellexpand::tilde(path);
            let path = Path::new(expanded.as_ref());
            if path.exists() {
                tracing::info!("Loading config from {}", path.display());
                return Self::layered(Some(path));
            }
        }
        Self::layered(None)
    }

    /// Load configuration from `path`, overlaid with `TANDEM_*` environment
    /// variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or cannot be parsed, or an
    /// environment override has the wrong type.
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::layered(Some(path.as_ref()))
    }

    fn layered(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder
            .add_source(
                config::Environment::with_prefix("TANDEM")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")
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
    /// Returns an error if `host:port` is not a valid socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.transport.websocket_path, "/ws");
        assert_eq!(config.transport.document_param, "noteId");
        assert_eq!(config.limits.outbound_queue_capacity, 1024);
        assert!(!config.auth.allow_anonymous);
        assert!(config.documents.entries.is_empty());
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 8080);

        let bad = Config {
            host: "not a host".to_string(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [limits]
            max_message_size = 65536

            [auth]
            allow_anonymous = true

            [[auth.tokens]]
            token = "Secret-A"
            user = "alice"

            [[documents.entries]]
            id = "abc"
            aliases = ["welcome"]
            readers = ["alice"]
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.limits.max_message_size, 65536);
        assert_eq!(config.limits.outbound_queue_capacity, 1024);
        assert!(config.auth.allow_anonymous);
        assert_eq!(config.auth.tokens, vec![TokenEntry::new("Secret-A", "alice")]);
        assert_eq!(config.documents.entries[0].aliases, vec!["welcome"]);
        assert!(!config.documents.entries[0].public);
    }

    #[test]
    fn test_config_from_file() {
        let path = std::env::temp_dir().join(format!("tandem-test-{}.toml", std::process::id()));
        std::fs::write(&path, "port = 7001\n[heartbeat]\ninterval_ms = 500\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.port, 7001);
        assert_eq!(config.heartbeat.interval_ms, 500);
        assert_eq!(config.heartbeat.timeout_ms, 60_000);
        assert!(Config::from_file(&path).is_err());
    }

    #[test]
    fn test_layered_load_keeps_token_case() {
        let path =
            std::env::temp_dir().join(format!("tandem-layered-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            r#"
                port = 7002

                [heartbeat]
                interval_ms = 500

                [[auth.tokens]]
                token = "Secret-ABC"
                user = "Alice"
            "#,
        )
        .unwrap();

        std::env::set_var("TANDEM_HEARTBEAT__TIMEOUT_MS", "1500");
        let loaded = Config::load_file(&path);
        std::env::remove_var("TANDEM_HEARTBEAT__TIMEOUT_MS");
        std::fs::remove_file(&path).unwrap();

        let config = loaded.unwrap();
        assert_eq!(config.port, 7002);
        assert_eq!(config.heartbeat.interval_ms, 500);
        assert_eq!(config.heartbeat.timeout_ms, 1500);
        assert_eq!(config.auth.tokens, vec![TokenEntry::new("Secret-ABC", "Alice")]);

        assert!(Config::load_file(&path).is_err());
    }
}
