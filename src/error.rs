//! Error taxonomy.
//!
//! Nothing here is fatal to the process. Protocol errors drop a single frame,
//! connection errors drive the state machine, application errors are data
//! carried by RESPONSE/ERROR envelopes and end up in the execution tracker.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A frame could not be decoded into an envelope.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("envelope missing required field `{0}`")]
    MissingField(&'static str),
    #[error("binary frames are not part of the protocol")]
    Binary,
}

/// Transport-level failure of the connection client or the probe.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("invalid server URL `{0}`: must start with ws:// or wss://")]
    InvalidUrl(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("connection timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("connection attempt cancelled")]
    Cancelled,
}

impl ConnectionError {
    /// True when retrying cannot help (bad URL or exhausted retries).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::InvalidUrl(_) | Self::ReconnectExhausted { .. } | Self::Cancelled
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ConnectionError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

/// Error codes reported by the relay or the extension.
pub mod codes {
    pub const ELEMENT_NOT_FOUND: &str = "ELEMENT_NOT_FOUND";
    pub const PERMISSION_DENIED: &str = "PERMISSION_DENIED";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const INVALID_SELECTOR: &str = "INVALID_SELECTOR";
    pub const INVALID_COMMAND: &str = "INVALID_COMMAND";
    pub const INVALID_MESSAGE: &str = "INVALID_MESSAGE";
    pub const CONNECTION_LOST: &str = "CONNECTION_LOST";
    pub const SESSION_EXPIRED: &str = "SESSION_EXPIRED";
    pub const NO_EXTENSION_CONNECTED: &str = "NO_EXTENSION_CONNECTED";
    pub const NO_AGENT_CONNECTED: &str = "NO_AGENT_CONNECTED";
    pub const NOT_PAIRED: &str = "NOT_PAIRED";
    pub const AI_ERROR: &str = "AI_ERROR";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
    /// Used when a failed RESPONSE carries no code of its own.
    pub const UNKNOWN_ERROR: &str = "UNKNOWN_ERROR";
}

/// Application-level failure: `{code, message}` from an ERROR envelope or a
/// RESPONSE with `success: false`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Failure of the durable store collaborator.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store data corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("{kind} `{id}` not found")]
    NotFound { kind: &'static str, id: String },
    #[error("store write failed: {0}")]
    Write(String),
    #[error("store writer is not running")]
    WriterStopped,
}

/// Invalid or unreadable configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid config value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// A console-level send was refused before reaching the socket.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("not connected to the relay")]
    NotConnected,
    #[error("message is empty")]
    Empty,
    #[error("template `{0}` not found")]
    UnknownTemplate(String),
}
