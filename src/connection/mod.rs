//! Reconnecting WebSocket client for the relay.
//!
//! ```text
//! mod.rs        — ConnectionState, Session, ClientOptions, close-code text
//! client.rs     — ConnectionClient handle: connect/disconnect/send, observers
//! driver.rs     — per-connection task: open, session loop, backoff
//! heartbeat.rs  — HeartbeatTracker (latency, ping/ack disambiguation)
//! backoff.rs    — ReconnectPolicy (base * 2^(n-1), bounded attempts)
//! probe.rs      — one-shot connection test, isolated from any client
//! ```
//!
//! State machine driven by the client:
//!
//! ```text
//! disconnected ──connect()──▶ connecting ──open──▶ connected
//!                                 │                    │ abnormal close
//!                               error ◀──fail──┐       ▼
//!                                 ▲            └─ reconnecting (attempt n, delay)
//!                                 │                    │ attempts exhausted
//!                           (initial attempt)          ▼
//!                                                 disconnected + terminal error
//! ```
//!
//! `disconnect()` moves any state to `disconnected` and never reconnects.

pub mod backoff;
pub mod client;
mod driver;
pub mod heartbeat;
pub mod probe;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::ServerConfig;
pub use backoff::ReconnectPolicy;
pub use client::ConnectionClient;
pub use probe::{test_connection, ConnectionTestResult};

/// Lifecycle state of a [`ConnectionClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting {
        attempt: u32,
        #[serde(rename = "delay_ms", serialize_with = "as_millis")]
        delay: Duration,
    },
    Error,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Error => "error",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// States in which outstanding requests can no longer be answered.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            Self::Disconnected | Self::Reconnecting { .. } | Self::Error
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reconnecting { attempt, delay } => {
                write!(f, "reconnecting (attempt {attempt}, in {}ms)", delay.as_millis())
            }
            other => f.write_str(other.as_str()),
        }
    }
}

/// Relay session, established by CONNECT_ACK.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub session_id: String,
    pub established_at: DateTime<Utc>,
}

/// Timing knobs for a [`ConnectionClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions {
    /// How long a single open attempt may take.
    pub open_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            open_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ClientOptions {
    pub fn from_config(server: &ServerConfig) -> Self {
        Self {
            open_timeout: Duration::from_secs(server.connect_timeout_secs),
            heartbeat_interval: Duration::from_secs(server.heartbeat_interval_secs),
            reconnect: ReconnectPolicy::new(
                Duration::from_secs(server.reconnect_interval_secs),
                server.max_reconnect_attempts,
            ),
        }
    }
}

/// Accepts only `ws://` and `wss://` URLs with something after the scheme.
pub fn validate_url(url: &str) -> bool {
    let rest = url
        .strip_prefix("ws://")
        .or_else(|| url.strip_prefix("wss://"));
    rest.is_some_and(|r| !r.is_empty())
}

/// Human-readable text for a WebSocket close code. A non-empty `reason`
/// sent by the peer wins.
pub fn describe_close(code: u16, reason: &str) -> String {
    if !reason.is_empty() {
        return reason.to_string();
    }
    let text = match code {
        1000 => "Normal closure",
        1001 => "Server going away",
        1002 => "Protocol error",
        1003 => "Unsupported data",
        1005 => "No status received",
        1006 => "Connection failed - server may be unreachable",
        1007 => "Invalid message data",
        1008 => "Policy violation",
        1009 => "Message too large",
        1010 => "Missing extension",
        1011 => "Internal server error",
        1015 => "TLS handshake failed",
        _ => return format!("Connection closed (code {code})"),
    };
    text.to_string()
}
