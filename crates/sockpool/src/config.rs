//! Configuration for servers and registries.
//!
//! Loaded from TOML; every section and field is optional and falls back to
//! its default:
//!
//! ```toml
//! [server]
//! listen = "unix:/run/sockpool.sock"
//! backlog = 128
//! accept_poll_interval_ms = 100
//!
//! [pool]
//! capacity = 1024
//! poll_timeout_ms = 1000
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! ```

use crate::address::Address;
use crate::logging::LogConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

// =============================================================================
// Log format
// =============================================================================

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable output for terminals
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "unknown log format: {s}. Expected one of: pretty, json"
            )),
        }
    }
}

// =============================================================================
// Sections
// =============================================================================

/// Listening side of a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind (`unix:<path>` or `<ip>:<port>`)
    pub listen: Address,
    /// `listen(2)` backlog
    pub backlog: i32,
    /// How often the accept loop wakes up to check for a stop request
    pub accept_poll_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: Address::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 7878)),
            backlog: 128,
            accept_poll_interval_ms: 100,
        }
    }
}

impl ServerConfig {
    pub fn accept_poll_interval(&self) -> Duration {
        Duration::from_millis(self.accept_poll_interval_ms)
    }
}

/// Sizing and timing of a connection registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of registered connections
    pub capacity: usize,
    /// Upper bound on a single readiness wait; `0` means return immediately
    pub poll_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            poll_timeout_ms: 1000,
        }
    }
}

impl PoolConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

// =============================================================================
// Top level
// =============================================================================

/// Whole configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub pool: PoolConfig,
    pub logging: LogConfig,
}

impl Config {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate the file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.capacity == 0 {
            return Err(ConfigError::Invalid(
                "pool.capacity must be at least 1".to_string(),
            ));
        }
        if self.server.backlog < 1 {
            return Err(ConfigError::Invalid(format!(
                "server.backlog must be at least 1, got {}",
                self.server.backlog
            )));
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string(self).map_err(|err| ConfigError::Invalid(err.to_string()))
    }
}
