//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `RELAY_CONSOLE_URL`, `RELAY_CONSOLE_STORE`
//! 2. **Config file** — path via `--config <path>` or `RELAY_CONSOLE_CONFIG`,
//!    otherwise `relay-console.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! url = "ws://localhost:8080/ws"
//! auto_connect = true
//! max_reconnect_attempts = 5     # 1..=10
//! reconnect_interval_secs = 5    # 1..=60, base of the exponential backoff
//! heartbeat_interval_secs = 10   # 5..=60
//! connect_timeout_secs = 10
//! request_timeout_secs = 60
//!
//! [logging]
//! level = "info"
//! traffic_log_size = 1000
//!
//! [notifications]
//! desktop = true
//! connection_status = true
//! command_complete = true
//!
//! [storage]
//! path = "~/.relay-console/store.json"   # omit or set persist = false for memory only
//! persist = true
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::connection::validate_url;
use crate::error::ConfigError;
use crate::util::expand_tilde;

const DEFAULT_CONFIG_FILE: &str = "relay-console.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Relay connection settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Relay WebSocket URL (default `ws://localhost:8080/ws`). Override with
    /// `RELAY_CONSOLE_URL`.
    #[serde(default = "default_url")]
    pub url: String,
    /// Connect on startup (default true).
    #[serde(default = "default_true")]
    pub auto_connect: bool,
    /// Reconnect attempts after an unexpected close (default 5, range 1-10).
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Backoff base in seconds (default 5, range 1-60).
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,
    /// Seconds between heartbeats (default 10, range 5-60).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Limit for a single open attempt (default 10).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Pending CHAT/COMMAND requests older than this resolve as timed out
    /// (default 60).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Entries kept by the in-memory traffic log (default 1000).
    #[serde(default = "default_traffic_log_size")]
    pub traffic_log_size: usize,
}

/// Which events reach the host notifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct NotificationConfig {
    #[serde(default = "default_true")]
    pub desktop: bool,
    #[serde(default = "default_true")]
    pub connection_status: bool,
    #[serde(default = "default_true")]
    pub command_complete: bool,
}

/// Durable store location.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// JSON store file. `~` is expanded. Override with `RELAY_CONSOLE_STORE`.
    #[serde(default = "default_store_path")]
    pub path: String,
    /// Keep history on disk (default true). When false an in-memory store is used.
    #[serde(default = "default_true")]
    pub persist: bool,
}

fn default_url() -> String {
    "ws://localhost:8080/ws".to_string()
}
fn default_true() -> bool {
    true
}
fn default_max_reconnect_attempts() -> u32 {
    5
}
fn default_reconnect_interval() -> u64 {
    5
}
fn default_heartbeat_interval() -> u64 {
    10
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_request_timeout() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_traffic_log_size() -> usize {
    1000
}
fn default_store_path() -> String {
    "~/.relay-console/store.json".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            auto_connect: default_true(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_interval_secs: default_reconnect_interval(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            traffic_log_size: default_traffic_log_size(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            desktop: true,
            connection_status: true,
            command_complete: true,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            persist: default_true(),
        }
    }
}

impl StorageConfig {
    /// `path` with a leading `~` expanded.
    pub fn resolved_path(&self) -> String {
        expand_tilde(&self.path).into_owned()
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some` (or `RELAY_CONSOLE_CONFIG` is set) that file must
    /// exist. Otherwise `relay-console.toml` in the current directory is used
    /// when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let explicit = path
            .map(ToString::to_string)
            .or_else(|| std::env::var("RELAY_CONSOLE_CONFIG").ok());

        let mut config = match explicit {
            Some(p) => Self::from_file(&expand_tilde(&p))?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(DEFAULT_CONFIG_FILE)?
            }
            None => Self::default(),
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("RELAY_CONSOLE_URL") {
            self.server.url = url;
        }
        if let Some(store) = lookup("RELAY_CONSOLE_STORE") {
            self.storage.path = store;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.server;
        if !validate_url(&s.url) {
            return Err(ConfigError::Invalid {
                field: "server.url",
                reason: format!("`{}` must start with ws:// or wss://", s.url),
            });
        }
        check_range("server.max_reconnect_attempts", u64::from(s.max_reconnect_attempts), 1, 10)?;
        check_range("server.reconnect_interval_secs", s.reconnect_interval_secs, 1, 60)?;
        check_range("server.heartbeat_interval_secs", s.heartbeat_interval_secs, 5, 60)?;
        check_range("server.connect_timeout_secs", s.connect_timeout_secs, 1, 300)?;
        check_range("server.request_timeout_secs", s.request_timeout_secs, 1, 3600)?;
        if self.logging.traffic_log_size == 0 {
            return Err(ConfigError::Invalid {
                field: "logging.traffic_log_size",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

fn check_range(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            field,
            reason: format!("{value} is outside {min}..={max}"),
        })
    }
}
