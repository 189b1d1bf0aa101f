//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (JIM_HOST, JIM_PORT, JIM_CONFIG)
//! - TOML configuration file

use anyhow::{Context, Result};
use jim_core::router::MAX_ACCOUNT_NAME_LENGTH;
use jim_core::RouterConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "JIM_CONFIG";

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Event loop configuration.
    #[serde(default)]
    pub event_loop: EventLoopConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Snapshot storage.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Read operator commands from stdin.
    #[serde(default = "default_true")]
    pub console: bool,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Event loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLoopConfig {
    /// Upper bound on one readiness wait, in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum number of queued chat messages per destination.
    #[serde(default = "default_max_pending_messages")]
    pub max_pending_messages: usize,

    /// Maximum account name length.
    #[serde(default = "default_max_account_name_length")]
    pub max_account_name_length: usize,
}

/// Snapshot storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Snapshot file. Without one, nothing survives a restart.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default)]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_host() -> String {
    std::env::var("JIM_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("JIM_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(7777)
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    200
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_pending_messages() -> usize {
    1_000
}

fn default_max_account_name_length() -> usize {
    MAX_ACCOUNT_NAME_LENGTH
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            event_loop: EventLoopConfig::default(),
            limits: LimitsConfig::default(),
            storage: StorageConfig::default(),
            console: true,
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_pending_messages: default_max_pending_messages(),
            max_account_name_length: default_max_account_name_length(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from `JIM_CONFIG`, the search path, or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            let expanded = shellexpand::tilde(&path);
            return Self::from_file(expanded.as_ref());
        }

        let config_paths = ["jim.toml", "/etc/jim/jim.toml", "~/.config/jim/jim.toml"];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        Ok(Self::default())
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

        let mut config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        if let Some(storage) = config.storage.path.take() {
            let expanded = shellexpand::tilde(&storage.to_string_lossy()).into_owned();
            config.storage.path = Some(PathBuf::from(expanded));
        }

        Ok(config)
    }

    /// Address to bind to, as `host:port`.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Upper bound on one readiness wait.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.event_loop.poll_interval_ms)
    }

    /// Router settings derived from the limits.
    #[must_use]
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            max_account_name_length: self.limits.max_account_name_length,
            max_pending_messages: self.limits.max_pending_messages,
        }
    }
}
