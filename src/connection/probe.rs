//! One-shot connection test.
//!
//! Opens its own short-lived socket, measures time-to-open and closes it with
//! a normal close. Shares nothing with any [`ConnectionClient`], so it can run
//! while the main connection is up.
//!
//! [`ConnectionClient`]: super::ConnectionClient

use std::io::ErrorKind;
use std::time::{Duration, Instant};

use futures_util::SinkExt;
use serde::Serialize;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message, Utf8Bytes};
use tracing::{debug, info};

use super::validate_url;

pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of [`test_connection`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionTestResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

impl ConnectionTestResult {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            latency_ms: None,
        }
    }
}

/// Try to open `url` within `timeout` and report how it went.
pub async fn test_connection(url: &str, timeout: Duration) -> ConnectionTestResult {
    if !validate_url(url) {
        return ConnectionTestResult::failed("Invalid URL: must start with ws:// or wss://");
    }

    let started = Instant::now();
    let result = match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url)).await {
        Err(_) => ConnectionTestResult::failed(format!(
            "Connection timed out after {}s",
            timeout.as_secs_f32()
        )),
        Ok(Err(e)) => ConnectionTestResult::failed(describe_error(&e)),
        Ok(Ok((mut ws, _response))) => {
            let latency = started.elapsed();
            let close = Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: Utf8Bytes::from_static("Connection test"),
            }));
            if let Err(e) = tokio::time::timeout(Duration::from_secs(1), ws.send(close)).await {
                debug!("Probe close did not complete: {e}");
            }
            ConnectionTestResult {
                success: true,
                message: format!("Connected successfully ({}ms)", latency.as_millis()),
                latency_ms: Some(u64::try_from(latency.as_millis()).unwrap_or(u64::MAX)),
            }
        }
    };
    info!(url, success = result.success, "Connection test: {}", result.message);
    result
}

fn describe_error(e: &WsError) -> String {
    match e {
        WsError::Io(io) if io.kind() == ErrorKind::ConnectionRefused => {
            "Connection refused - is the relay server running?".to_string()
        }
        WsError::Io(io) => format!("Network error: {io}"),
        WsError::Tls(tls) => format!("TLS handshake failed: {tls}"),
        WsError::Http(resp) => format!("Server rejected the upgrade (HTTP {})", resp.status()),
        WsError::Url(u) => format!("Invalid URL: {u}"),
        WsError::Protocol(p) => format!("Protocol error: {p}"),
        other => format!("Connection failed: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, MockRelay};

    #[tokio::test]
    async fn test_probe_invalid_url() {
        let r = test_connection("localhost:8080", DEFAULT_TEST_TIMEOUT).await;
        assert!(!r.success);
        assert!(r.message.starts_with("Invalid URL"));
        assert!(r.latency_ms.is_none());
    }

    #[tokio::test]
    async fn test_probe_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let r = test_connection(&format!("ws://{addr}"), DEFAULT_TEST_TIMEOUT).await;
        assert!(!r.success);
        assert!(r.message.contains("refused"), "{}", r.message);
    }

    #[tokio::test]
    async fn test_probe_timeout() {
        let addr = testing::silent_listener().await;
        let r = test_connection(&format!("ws://{addr}"), Duration::from_millis(100)).await;
        assert!(!r.success);
        assert!(r.message.contains("timed out"));
    }

    #[tokio::test]
    async fn test_probe_success_closes_normally() {
        let relay = MockRelay::start().await;
        let r = test_connection(&relay.url(), DEFAULT_TEST_TIMEOUT).await;
        assert!(r.success, "{}", r.message);
        assert!(r.latency_ms.is_some());
        let code = testing::wait_for(|| relay.close_code()).await;
        assert_eq!(code, 1000);
    }
}
