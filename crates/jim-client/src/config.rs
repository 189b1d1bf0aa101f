//! Client configuration.
//!
//! Values come from a TOML file (`JIM_CONFIG` or the search path), with
//! `JIM_HOST`, `JIM_PORT` and `JIM_NAME` as defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read.
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File is not valid TOML for this schema.
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server host.
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Account name; prompted for when absent.
    #[serde(default = "default_name")]
    pub name: Option<String>,

    /// How long a request waits for its reply, in milliseconds.
    #[serde(default = "default_reply_timeout")]
    pub reply_timeout_ms: u64,

    /// How long connecting may take, in milliseconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
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

fn default_name() -> Option<String> {
    std::env::var("JIM_NAME").ok().filter(|n| !n.trim().is_empty())
}

fn default_reply_timeout() -> u64 {
    5_000
}

fn default_connect_timeout() -> u64 {
    5_000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            name: default_name(),
            reply_timeout_ms: default_reply_timeout(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from `JIM_CONFIG`, the search path, or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var("JIM_CONFIG") {
            let expanded = shellexpand::tilde(&path);
            return Self::from_file(expanded.as_ref());
        }

        for path in ["jim-client.toml", "~/.config/jim/client.toml"] {
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
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Server address as `host:port`.
    #[must_use]
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reply timeout.
    #[must_use]
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    /// Connect timeout.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_toml() {
        let config: ClientConfig = toml::from_str(
            r#"
            host = "10.0.0.5"
            port = 8079
            name = "alice"
            reply_timeout_ms = 250
        "#,
        )
        .unwrap();

        assert_eq!(config.server_addr(), "10.0.0.5:8079");
        assert_eq!(config.name.as_deref(), Some("alice"));
        assert_eq!(config.reply_timeout(), Duration::from_millis(250));
        assert_eq!(config.connect_timeout(), Duration::from_millis(5_000));
    }

    #[test]
    fn test_missing_file() {
        let err = ClientConfig::from_file("/nonexistent/jim-client.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
