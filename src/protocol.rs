//! Wire protocol shared by the console, the relay and the extension.
//!
//! Every frame is a JSON text message carrying one [`Envelope`]:
//!
//! ```json
//! {
//!   "messageId": "6f0c…",
//!   "timestamp": "2024-05-01T12:00:00.000Z",
//!   "type": "COMMAND",
//!   "source": "agent",
//!   "target": "extension",
//!   "targetClientId": "ext-42",
//!   "payload": { "command": "get_page_info", "params": {} },
//!   "requestId": null
//! }
//! ```
//!
//! On the Rust side the `type` + `payload` pair is folded into the tagged
//! [`Body`] enum so consumers match on a variant instead of probing a loose
//! map. Unknown top-level fields (the relay adds `sessionId`) are ignored, and
//! a missing `target` defaults to `agent` since the relay omits it on frames
//! addressed to us.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{codes, ErrorInfo, ProtocolError};

/// Envelope `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Connect,
    ConnectAck,
    Chat,
    Command,
    Response,
    Status,
    Heartbeat,
    Error,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::ConnectAck => "CONNECT_ACK",
            Self::Chat => "CHAT",
            Self::Command => "COMMAND",
            Self::Response => "RESPONSE",
            Self::Status => "STATUS",
            Self::Heartbeat => "HEARTBEAT",
            Self::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol participant, used for `source` and `target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Peer {
    Agent,
    Extension,
    Server,
}

/// CONNECT payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// CONNECT_ACK payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectAckPayload {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// CHAT payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatPayload {
    pub text: String,
}

/// COMMAND payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// RESPONSE payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Time the extension spent executing, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<u64>,
}

impl ResponsePayload {
    /// The failure described by an unsuccessful response, `None` on success.
    pub fn error_info(&self) -> Option<ErrorInfo> {
        if self.success {
            return None;
        }
        Some(ErrorInfo::new(
            self.error_code.as_deref().unwrap_or(codes::UNKNOWN_ERROR),
            self.error.as_deref().unwrap_or("Command failed"),
        ))
    }
}

/// Pairing status reported by the relay in STATUS envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    Paired,
    PeerDisconnected,
    PeerReconnected,
    Unpaired,
    /// Anything else (`server_shutdown`, `waiting`, ...). Carried through but
    /// ignored by the registry.
    #[serde(other)]
    Other,
}

/// STATUS payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    pub status: PeerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paired_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl StatusPayload {
    pub fn new(status: PeerStatus) -> Self {
        Self {
            status,
            paired_session_id: None,
            extension_session_id: None,
            current_url: None,
            current_title: None,
            browser: None,
            description: None,
        }
    }

    /// Id of the remote peer this status is about, if the relay named one.
    pub fn peer_id(&self) -> Option<&str> {
        self.paired_session_id
            .as_deref()
            .or(self.extension_session_id.as_deref())
    }
}

/// ERROR payload. The relay spells the code field `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    #[serde(alias = "error", default = "default_error_code")]
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

fn default_error_code() -> String {
    codes::UNKNOWN_ERROR.to_string()
}

impl ErrorPayload {
    pub fn info(&self) -> ErrorInfo {
        ErrorInfo::new(self.code.clone(), self.message.clone())
    }
}

/// Typed envelope body, one variant per [`MessageType`].
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Connect(ConnectPayload),
    ConnectAck(ConnectAckPayload),
    Chat(ChatPayload),
    Command(CommandPayload),
    Response(ResponsePayload),
    Status(StatusPayload),
    Heartbeat,
    Error(ErrorPayload),
}

impl Body {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Connect(_) => MessageType::Connect,
            Self::ConnectAck(_) => MessageType::ConnectAck,
            Self::Chat(_) => MessageType::Chat,
            Self::Command(_) => MessageType::Command,
            Self::Response(_) => MessageType::Response,
            Self::Status(_) => MessageType::Status,
            Self::Heartbeat => MessageType::Heartbeat,
            Self::Error(_) => MessageType::Error,
        }
    }
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireEnvelope", into = "WireEnvelope")]
pub struct Envelope {
    pub message_id: String,
    pub timestamp: Option<String>,
    pub source: Peer,
    pub target: Peer,
    pub target_client_id: Option<String>,
    pub request_id: Option<String>,
    pub body: Body,
}

/// Current time as an ISO-8601 string with millisecond precision.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl Envelope {
    /// A fresh outbound envelope from the console with a random id.
    pub fn new(target: Peer, body: Body) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), target, body)
    }

    fn with_id(message_id: String, target: Peer, body: Body) -> Self {
        Self {
            message_id,
            timestamp: Some(now_iso()),
            source: Peer::Agent,
            target,
            target_client_id: None,
            request_id: None,
            body,
        }
    }

    /// Handshake sent as soon as the socket opens.
    pub fn connect() -> Self {
        Self::new(
            Peer::Server,
            Body::Connect(ConnectPayload {
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
        )
    }

    pub fn chat(text: impl Into<String>) -> Self {
        Self::new(Peer::Extension, Body::Chat(ChatPayload { text: text.into() }))
    }

    pub fn command(command: impl Into<String>, params: Option<Value>) -> Self {
        Self::new(
            Peer::Extension,
            Body::Command(CommandPayload {
                command: command.into(),
                params,
            }),
        )
    }

    /// Outbound heartbeat (`hb-` prefixed id).
    pub fn heartbeat() -> Self {
        Self::with_id(
            format!("hb-{}", uuid::Uuid::new_v4()),
            Peer::Server,
            Body::Heartbeat,
        )
    }

    /// Reply to a relay-initiated heartbeat.
    pub fn heartbeat_ack(ping_id: &str) -> Self {
        Self::with_id(
            format!("hb-ack-{}", uuid::Uuid::new_v4()),
            Peer::Server,
            Body::Heartbeat,
        )
        .with_request_id(ping_id)
    }

    #[must_use]
    pub fn with_target_client(mut self, client_id: impl Into<String>) -> Self {
        self.target_client_id = Some(client_id.into());
        self
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }

    /// Id of the outbound request this envelope answers.
    ///
    /// ERROR frames may carry it in the payload instead of the header.
    pub fn correlation_id(&self) -> Option<&str> {
        self.request_id.as_deref().or(match &self.body {
            Body::Error(e) => e.request_id.as_deref(),
            _ => None,
        })
    }

    /// Decode a text frame.
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let wire: WireEnvelope = serde_json::from_str(text)?;
        Self::try_from(wire)
    }

    /// Encode as a text frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// On-the-wire shape; [`Envelope`] converts through it.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    #[serde(default)]
    message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<String>,
    #[serde(rename = "type")]
    kind: MessageType,
    source: Peer,
    #[serde(default = "default_target")]
    target: Peer,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target_client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
}

fn default_target() -> Peer {
    Peer::Agent
}

fn decode<T: serde::de::DeserializeOwned>(payload: Option<Value>) -> Result<T, ProtocolError> {
    let value = match payload {
        Some(Value::Null) | None => Value::Object(serde_json::Map::new()),
        Some(v) => v,
    };
    Ok(serde_json::from_value(value)?)
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = ProtocolError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        if wire.message_id.is_empty() {
            return Err(ProtocolError::MissingField("messageId"));
        }
        let body = match wire.kind {
            MessageType::Connect => Body::Connect(decode(wire.payload)?),
            MessageType::ConnectAck => Body::ConnectAck(decode(wire.payload)?),
            MessageType::Chat => Body::Chat(decode(wire.payload)?),
            MessageType::Command => Body::Command(decode(wire.payload)?),
            MessageType::Response => Body::Response(decode(wire.payload)?),
            MessageType::Status => Body::Status(decode(wire.payload)?),
            MessageType::Heartbeat => Body::Heartbeat,
            MessageType::Error => Body::Error(decode(wire.payload)?),
        };
        Ok(Self {
            message_id: wire.message_id,
            timestamp: wire.timestamp,
            source: wire.source,
            target: wire.target,
            target_client_id: wire.target_client_id,
            request_id: wire.request_id,
            body,
        })
    }
}

impl From<Envelope> for WireEnvelope {
    fn from(env: Envelope) -> Self {
        let kind = env.body.message_type();
        let payload = match env.body {
            Body::Connect(p) => serde_json::to_value(p).ok(),
            Body::ConnectAck(p) => serde_json::to_value(p).ok(),
            Body::Chat(p) => serde_json::to_value(p).ok(),
            Body::Command(p) => serde_json::to_value(p).ok(),
            Body::Response(p) => serde_json::to_value(p).ok(),
            Body::Status(p) => serde_json::to_value(p).ok(),
            Body::Heartbeat => None,
            Body::Error(p) => serde_json::to_value(p).ok(),
        };
        Self {
            message_id: env.message_id,
            timestamp: env.timestamp,
            kind,
            source: env.source,
            target: env.target,
            target_client_id: env.target_client_id,
            payload,
            request_id: env.request_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_connect_ack_without_target_defaults_to_agent() {
        let text = r#"{"type":"CONNECT_ACK","source":"server","messageId":"m1",
            "timestamp":"2024-01-01T00:00:00.000Z","sessionId":"s-9",
            "payload":{"sessionId":"s-9","status":"connected"}}"#;
        let env = Envelope::from_json(text).unwrap();
        assert_eq!(env.target, Peer::Agent);
        assert_eq!(env.source, Peer::Server);
        match env.body {
            Body::ConnectAck(ack) => assert_eq!(ack.session_id, "s-9"),
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn test_error_payload_accepts_error_alias() {
        let text = json!({
            "type": "ERROR", "source": "server", "target": "agent", "messageId": "e1",
            "payload": {"error": "NOT_PAIRED", "message": "no peer", "requestId": "req-1"}
        })
        .to_string();
        let env = Envelope::from_json(&text).unwrap();
        assert_eq!(env.correlation_id(), Some("req-1"));
        match env.body {
            Body::Error(e) => {
                assert_eq!(e.code, "NOT_PAIRED");
                assert_eq!(e.message, "no peer");
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn test_header_request_id_wins_over_payload() {
        let text = json!({
            "type": "ERROR", "source": "server", "messageId": "e2", "requestId": "hdr",
            "payload": {"code": "TIMEOUT", "message": "slow", "requestId": "body"}
        })
        .to_string();
        let env = Envelope::from_json(&text).unwrap();
        assert_eq!(env.correlation_id(), Some("hdr"));
    }

    #[test]
    fn test_unknown_status_is_other() {
        let text = json!({
            "type": "STATUS", "source": "server", "messageId": "s1",
            "payload": {"status": "server_shutdown", "message": "bye"}
        })
        .to_string();
        let env = Envelope::from_json(&text).unwrap();
        match env.body {
            Body::Status(s) => assert_eq!(s.status, PeerStatus::Other),
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn test_status_peer_id_prefers_paired_session() {
        let mut status = StatusPayload::new(PeerStatus::Paired);
        status.extension_session_id = Some("ext".into());
        assert_eq!(status.peer_id(), Some("ext"));
        status.paired_session_id = Some("paired".into());
        assert_eq!(status.peer_id(), Some("paired"));
    }

    #[test]
    fn test_missing_message_id_rejected() {
        let text = r#"{"type":"HEARTBEAT","source":"server"}"#;
        assert!(matches!(
            Envelope::from_json(text),
            Err(ProtocolError::MissingField("messageId"))
        ));
    }

    #[test]
    fn test_malformed_json_rejected() {
        assert!(matches!(
            Envelope::from_json("{not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(Envelope::from_json(r#"{"type":"BOGUS","source":"server","messageId":"x"}"#).is_err());
    }

    #[test]
    fn test_command_serializes_camel_case() {
        let env = Envelope::command("get_page_info", Some(json!({"full": true})))
            .with_target_client("ext-1");
        let value: Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "COMMAND");
        assert_eq!(value["source"], "agent");
        assert_eq!(value["target"], "extension");
        assert_eq!(value["targetClientId"], "ext-1");
        assert_eq!(value["payload"]["command"], "get_page_info");
        assert_eq!(value["payload"]["params"]["full"], true);
        assert!(value.get("requestId").is_none());
    }

    #[test]
    fn test_heartbeat_ack_references_ping() {
        let ack = Envelope::heartbeat_ack("hb-123");
        assert!(ack.message_id.starts_with("hb-ack-"));
        assert_eq!(ack.request_id.as_deref(), Some("hb-123"));
        let value: Value = serde_json::from_str(&ack.to_json().unwrap()).unwrap();
        assert!(value.get("payload").is_none());
    }

    #[test]
    fn test_failed_response_error_info() {
        let resp = ResponsePayload {
            success: false,
            data: None,
            error: Some("no such element".into()),
            error_code: Some("ELEMENT_NOT_FOUND".into()),
            execution_time: Some(12),
        };
        let info = resp.error_info().unwrap();
        assert_eq!(info.code, "ELEMENT_NOT_FOUND");
        assert_eq!(info.message, "no such element");

        let bare = ResponsePayload {
            success: false,
            data: None,
            error: None,
            error_code: None,
            execution_time: None,
        };
        assert_eq!(bare.error_info().unwrap().code, codes::UNKNOWN_ERROR);
    }
}
