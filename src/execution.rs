//! Tracking of in-flight CHAT/COMMAND requests.
//!
//! Every outbound request gets a user message in its conversation (keyed by
//! target client id, or [`DEFAULT_CONVERSATION`] for untargeted traffic) and,
//! once it is on the wire, a pending entry keyed by the envelope's
//! `messageId`. Results are matched through `requestId`:
//!
//! ```text
//! begin ──▶ sending ──mark_sent──▶ processing ──COMMAND──▶ executing
//!              │                        │                      │
//!       mark_send_failed         RESPONSE / ERROR / timeout / connection lost
//!              ▼                        ▼                      ▼
//!            error              success | error | timeout
//! ```
//!
//! A pending entry is removed exactly once, so a duplicated RESPONSE changes
//! nothing. Nothing is retried.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{codes, ErrorInfo};
use crate::protocol::{Body, Envelope, ResponsePayload};
use crate::store::{MessageQuery, Store};

/// Conversation used when a request has no target client.
pub const DEFAULT_CONVERSATION: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Ai,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Idle,
    Sending,
    Processing,
    Executing,
    Success,
    Error,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Sending | Self::Processing | Self::Executing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Sending => "sending",
            Self::Processing => "processing",
            Self::Executing => "executing",
            Self::Success => "success",
            Self::Error => "error",
            Self::Timeout => "timeout",
        }
    }
}

/// One line of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub sender: Sender,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ExecutionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl ChatMessage {
    fn new(sender: Sender, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender,
            content: content.into(),
            timestamp: Utc::now(),
            status: None,
            data: None,
            error: None,
        }
    }
}

/// Execution state of a conversation; reflects its most recent request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionState {
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl Default for ExecutionState {
    fn default() -> Self {
        Self {
            status: ExecutionStatus::Idle,
            current_step: None,
            started_at: None,
            request_id: None,
            error: None,
        }
    }
}

#[derive(Debug, Default)]
struct Conversation {
    messages: Vec<ChatMessage>,
    execution: ExecutionState,
}

#[derive(Debug, Clone)]
struct PendingRequest {
    conversation: String,
    sent_at: Instant,
}

/// What an inbound envelope (or the timeout sweep) did.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// A pending request finished.
    Completed {
        conversation: String,
        request_id: String,
        status: ExecutionStatus,
        elapsed: Duration,
        error: Option<ErrorInfo>,
    },
    /// The peer reported progress on a pending request.
    Progress {
        conversation: String,
        request_id: String,
        step: String,
    },
    /// An ERROR that matches no pending request.
    UnmatchedError(ErrorInfo),
    /// Anything that did not touch a pending request.
    Ignored,
}

pub struct ExecutionTracker {
    conversations: HashMap<String, Conversation>,
    pending: HashMap<String, PendingRequest>,
    last_response_time: Option<Duration>,
    request_timeout: Duration,
    store: Arc<dyn Store>,
}

impl ExecutionTracker {
    pub fn new(store: Arc<dyn Store>, request_timeout: Duration) -> Self {
        Self {
            conversations: HashMap::new(),
            pending: HashMap::new(),
            last_response_time: None,
            request_timeout,
            store,
        }
    }

    /// Optimistically record the user side of `envelope` before it is sent.
    pub fn begin(&mut self, conversation: &str, envelope: &Envelope, text: &str) -> ChatMessage {
        let mut message = ChatMessage::new(Sender::User, text);
        message.id.clone_from(&envelope.message_id);
        message.status = Some(ExecutionStatus::Sending);
        if let Body::Command(cmd) = &envelope.body {
            message.data = cmd.params.clone();
        }

        let conv = self.conversations.entry(conversation.to_string()).or_default();
        conv.messages.push(message.clone());
        conv.execution = ExecutionState {
            status: ExecutionStatus::Sending,
            current_step: None,
            started_at: Some(message.timestamp),
            request_id: Some(envelope.message_id.clone()),
            error: None,
        };
        self.persist_new(conversation, &message);
        message
    }

    /// The envelope is on the wire; wait for its result.
    pub fn mark_sent(&mut self, message_id: &str, now: Instant) {
        let Some(conversation) = self.find_conversation_of(message_id) else {
            warn!(message_id, "mark_sent for unknown message");
            return;
        };
        self.pending.insert(
            message_id.to_string(),
            PendingRequest {
                conversation: conversation.clone(),
                sent_at: now,
            },
        );
        self.set_message_status(&conversation, message_id, ExecutionStatus::Processing, None, None);
        self.set_execution(&conversation, message_id, ExecutionStatus::Processing, None);
    }

    /// The send was refused; no result will ever arrive.
    pub fn mark_send_failed(&mut self, message_id: &str, error: ErrorInfo) {
        let Some(conversation) = self.find_conversation_of(message_id) else {
            return;
        };
        self.set_message_status(
            &conversation,
            message_id,
            ExecutionStatus::Error,
            None,
            Some(&error),
        );
        self.set_execution(&conversation, message_id, ExecutionStatus::Error, Some(error));
    }

    /// Route an inbound envelope.
    pub fn handle_envelope(&mut self, envelope: &Envelope, now: Instant) -> Resolution {
        match &envelope.body {
            Body::Response(resp) => match envelope.correlation_id() {
                Some(id) => self.complete(id, resp, now),
                None => Resolution::Ignored,
            },
            Body::Error(err) => match envelope.correlation_id() {
                Some(id) if self.pending.contains_key(id) => {
                    self.fail(id, err.info(), ExecutionStatus::Error, now)
                }
                Some(id) if self.find_conversation_of(id).is_some() => {
                    debug!(request_id = id, code = %err.code, "ERROR for finished request");
                    Resolution::Ignored
                }
                _ => Resolution::UnmatchedError(err.info()),
            },
            Body::Command(cmd) => match envelope.correlation_id() {
                Some(id) => self.progress(id, &cmd.command),
                None => Resolution::Ignored,
            },
            _ => Resolution::Ignored,
        }
    }

    fn complete(&mut self, request_id: &str, resp: &ResponsePayload, now: Instant) -> Resolution {
        if let Some(error) = resp.error_info() {
            return self.fail(request_id, error, ExecutionStatus::Error, now);
        }
        let Some(pending) = self.pending.remove(request_id) else {
            debug!(request_id, "RESPONSE for unknown or finished request");
            return Resolution::Ignored;
        };
        let elapsed = now.saturating_duration_since(pending.sent_at);
        self.last_response_time = Some(elapsed);
        let conversation = pending.conversation;

        self.set_message_status(
            &conversation,
            request_id,
            ExecutionStatus::Success,
            resp.data.as_ref(),
            None,
        );
        self.set_execution(&conversation, request_id, ExecutionStatus::Success, None);

        let mut reply = ChatMessage::new(Sender::Ai, render_result(resp.data.as_ref()));
        reply.status = Some(ExecutionStatus::Success);
        reply.data.clone_from(&resp.data);
        self.append(&conversation, reply);
        info!(request_id, elapsed_ms = elapsed.as_millis(), "Request succeeded");

        Resolution::Completed {
            conversation,
            request_id: request_id.to_string(),
            status: ExecutionStatus::Success,
            elapsed,
            error: None,
        }
    }

    fn fail(
        &mut self,
        request_id: &str,
        error: ErrorInfo,
        status: ExecutionStatus,
        now: Instant,
    ) -> Resolution {
        let Some(pending) = self.pending.remove(request_id) else {
            debug!(request_id, "failure for unknown or finished request");
            return Resolution::Ignored;
        };
        let elapsed = now.saturating_duration_since(pending.sent_at);
        self.last_response_time = Some(elapsed);
        let conversation = pending.conversation;

        self.set_message_status(&conversation, request_id, status, None, Some(&error));
        self.set_execution(&conversation, request_id, status, Some(error.clone()));

        let mut notice = ChatMessage::new(
            Sender::System,
            format!("Error [{}]: {}", error.code, error.message),
        );
        notice.status = Some(status);
        notice.error = Some(error.clone());
        self.append(&conversation, notice);
        warn!(request_id, code = %error.code, "Request failed");

        Resolution::Completed {
            conversation,
            request_id: request_id.to_string(),
            status,
            elapsed,
            error: Some(error),
        }
    }

    fn progress(&mut self, request_id: &str, step: &str) -> Resolution {
        let Some(pending) = self.pending.get(request_id) else {
            return Resolution::Ignored;
        };
        let conversation = pending.conversation.clone();
        if let Some(conv) = self.conversations.get_mut(&conversation) {
            if conv.execution.request_id.as_deref() == Some(request_id) {
                conv.execution.status = ExecutionStatus::Executing;
                conv.execution.current_step = Some(step.to_string());
            }
        }
        self.set_message_status(&conversation, request_id, ExecutionStatus::Executing, None, None);
        Resolution::Progress {
            conversation,
            request_id: request_id.to_string(),
            step: step.to_string(),
        }
    }

    /// Resolve requests that have waited longer than the request timeout.
    pub fn expire_stale(&mut self, now: Instant) -> Vec<Resolution> {
        let stale: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.sent_at) >= self.request_timeout)
            .map(|(id, _)| id.clone())
            .collect();
        stale
            .into_iter()
            .map(|id| {
                let error = ErrorInfo::new(
                    codes::TIMEOUT,
                    format!(
                        "No response within {}s",
                        self.request_timeout.as_secs()
                    ),
                );
                self.fail(&id, error, ExecutionStatus::Timeout, now)
            })
            .collect()
    }

    /// Connection lost: every pending request fails with `CONNECTION_LOST`.
    /// Returns the affected conversations.
    pub fn abandon_all(&mut self) -> Vec<String> {
        let pending: Vec<(String, PendingRequest)> = self.pending.drain().collect();
        let error = ErrorInfo::new(
            codes::CONNECTION_LOST,
            "Connection lost before a response arrived",
        );
        let mut affected: Vec<String> = Vec::new();
        for (id, p) in &pending {
            self.set_message_status(&p.conversation, id, ExecutionStatus::Error, None, Some(&error));
            self.set_execution(&p.conversation, id, ExecutionStatus::Error, Some(error.clone()));
            if !affected.contains(&p.conversation) {
                affected.push(p.conversation.clone());
            }
        }
        for conversation in &affected {
            let mut notice = ChatMessage::new(Sender::System, error.message.clone());
            notice.error = Some(error.clone());
            self.append(conversation, notice);
        }
        if !pending.is_empty() {
            warn!(count = pending.len(), "Abandoned pending requests");
        }
        affected
    }

    /// Append a system line (relay notices, unmatched errors).
    pub fn append_system(&mut self, conversation: &str, content: &str, error: Option<ErrorInfo>) {
        let mut message = ChatMessage::new(Sender::System, content);
        message.error = error;
        self.append(conversation, message);
    }

    /// Append an inbound message from the peer that is not a result.
    pub fn append_incoming(&mut self, conversation: &str, content: &str) {
        self.append(conversation, ChatMessage::new(Sender::Ai, content));
    }

    /// Load the latest `limit` messages of `conversation` from the store,
    /// merged in front of what is already in memory.
    pub fn restore_history(
        &mut self,
        conversation: &str,
        limit: usize,
    ) -> Result<usize, crate::error::StoreError> {
        let page = self
            .store
            .get_messages(conversation, &MessageQuery::latest(limit))?;
        Ok(self.prepend(conversation, page))
    }

    /// Load up to `limit` messages older than the oldest one in memory.
    pub fn load_older(
        &mut self,
        conversation: &str,
        limit: usize,
    ) -> Result<usize, crate::error::StoreError> {
        let Some(oldest) = self
            .conversations
            .get(conversation)
            .and_then(|c| c.messages.first())
            .map(|m| m.timestamp)
        else {
            return self.restore_history(conversation, limit);
        };
        let page = self
            .store
            .get_messages(conversation, &MessageQuery::before(limit, oldest))?;
        Ok(self.prepend(conversation, page))
    }

    fn prepend(&mut self, conversation: &str, page: Vec<ChatMessage>) -> usize {
        let conv = self.conversations.entry(conversation.to_string()).or_default();
        let mut fresh: Vec<ChatMessage> = page
            .into_iter()
            .filter(|m| !conv.messages.iter().any(|e| e.id == m.id))
            .collect();
        let added = fresh.len();
        fresh.append(&mut conv.messages);
        conv.messages = fresh;
        added
    }

    /// Forget a conversation locally and in the store.
    pub fn clear(&mut self, conversation: &str) {
        self.conversations.remove(conversation);
        self.pending.retain(|_, p| p.conversation != conversation);
        if let Err(e) = self.store.delete_messages(conversation) {
            warn!(conversation, "Failed to clear history: {e}");
        }
    }

    pub fn messages(&self, conversation: &str) -> Vec<ChatMessage> {
        self.conversations
            .get(conversation)
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }

    pub fn execution(&self, conversation: &str) -> ExecutionState {
        self.conversations
            .get(conversation)
            .map(|c| c.execution.clone())
            .unwrap_or_default()
    }

    pub fn is_pending(&self, message_id: &str) -> bool {
        self.pending.contains_key(message_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn last_response_time(&self) -> Option<Duration> {
        self.last_response_time
    }

    fn find_conversation_of(&self, message_id: &str) -> Option<String> {
        self.conversations
            .iter()
            .find(|(_, c)| c.messages.iter().any(|m| m.id == message_id))
            .map(|(k, _)| k.clone())
    }

    fn append(&mut self, conversation: &str, message: ChatMessage) {
        self.persist_new(conversation, &message);
        self.conversations
            .entry(conversation.to_string())
            .or_default()
            .messages
            .push(message);
    }

    fn set_message_status(
        &mut self,
        conversation: &str,
        message_id: &str,
        status: ExecutionStatus,
        data: Option<&Value>,
        error: Option<&ErrorInfo>,
    ) {
        let Some(message) = self
            .conversations
            .get_mut(conversation)
            .and_then(|c| c.messages.iter_mut().find(|m| m.id == message_id))
        else {
            return;
        };
        message.status = Some(status);
        if let Some(d) = data {
            message.data = Some(d.clone());
        }
        if let Some(e) = error {
            message.error = Some(e.clone());
        }
        if let Err(e) = self
            .store
            .update_message_status(message_id, status, data, error)
        {
            warn!(message_id, "Failed to update message status: {e}");
        }
    }

    /// Update the conversation's execution only if `request_id` is its
    /// current request.
    fn set_execution(
        &mut self,
        conversation: &str,
        request_id: &str,
        status: ExecutionStatus,
        error: Option<ErrorInfo>,
    ) {
        let Some(conv) = self.conversations.get_mut(conversation) else {
            return;
        };
        if conv.execution.request_id.as_deref() != Some(request_id) {
            return;
        }
        conv.execution.status = status;
        if !status.is_in_flight() {
            conv.execution.current_step = None;
        }
        conv.execution.error = error;
    }

    fn persist_new(&self, conversation: &str, message: &ChatMessage) {
        if let Err(e) = self.store.insert_message(conversation, message) {
            warn!(conversation, "Failed to save message: {e}");
        }
    }
}

/// Text shown for a successful result.
fn render_result(data: Option<&Value>) -> String {
    match data {
        None | Some(Value::Null) => "Done".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Object(map)) => ["text", "message", "content", "summary"]
            .iter()
            .find_map(|k| map.get(*k).and_then(Value::as_str))
            .map_or_else(
                || serde_json::to_string_pretty(&Value::Object(map.clone())).unwrap_or_default(),
                ToString::to_string,
            ),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ErrorPayload, Peer};
    use crate::store::MemoryStore;
    use serde_json::json;

    fn tracker() -> (ExecutionTracker, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (
            ExecutionTracker::new(store.clone(), Duration::from_secs(60)),
            store,
        )
    }

    fn response(request_id: &str, success: bool) -> Envelope {
        let body = Body::Response(ResponsePayload {
            success,
            data: success.then(|| json!({"text": "title is Example"})),
            error: (!success).then(|| "selector matched nothing".to_string()),
            error_code: (!success).then(|| "ELEMENT_NOT_FOUND".to_string()),
            execution_time: Some(5),
        });
        Envelope::new(Peer::Agent, body).with_request_id(request_id)
    }

    fn sent_chat(t: &mut ExecutionTracker, conv: &str, now: Instant) -> String {
        let env = Envelope::chat("what is the title?");
        t.begin(conv, &env, "what is the title?");
        t.mark_sent(&env.message_id, now);
        env.message_id
    }

    #[test]
    fn test_success_flow() {
        let (mut t, store) = tracker();
        let t0 = Instant::now();
        let id = sent_chat(&mut t, "ext-1", t0);
        assert_eq!(t.execution("ext-1").status, ExecutionStatus::Processing);
        assert!(t.is_pending(&id));

        let res = t.handle_envelope(&response(&id, true), t0 + Duration::from_millis(120));
        match res {
            Resolution::Completed { status, elapsed, .. } => {
                assert_eq!(status, ExecutionStatus::Success);
                assert_eq!(elapsed, Duration::from_millis(120));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(t.pending_count(), 0);
        assert_eq!(t.last_response_time(), Some(Duration::from_millis(120)));
        let msgs = t.messages("ext-1");
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].status, Some(ExecutionStatus::Success));
        assert_eq!(msgs[1].sender, Sender::Ai);
        assert_eq!(msgs[1].content, "title is Example");

        let stored = store.get_messages("ext-1", &MessageQuery::default()).unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].status, Some(ExecutionStatus::Success));
    }

    #[test]
    fn test_duplicate_response_resolves_once() {
        let (mut t, _) = tracker();
        let now = Instant::now();
        let id = sent_chat(&mut t, "c", now);
        assert!(matches!(
            t.handle_envelope(&response(&id, true), now),
            Resolution::Completed { .. }
        ));
        assert_eq!(t.handle_envelope(&response(&id, true), now), Resolution::Ignored);
        assert_eq!(t.messages("c").len(), 2);
        assert_eq!(t.pending_count(), 0);
    }

    #[test]
    fn test_failed_response_carries_code() {
        let (mut t, _) = tracker();
        let now = Instant::now();
        let id = sent_chat(&mut t, "c", now);
        t.handle_envelope(&response(&id, false), now);
        let exec = t.execution("c");
        assert_eq!(exec.status, ExecutionStatus::Error);
        assert_eq!(exec.error.unwrap().code, "ELEMENT_NOT_FOUND");
        let last = t.messages("c").pop().unwrap();
        assert_eq!(last.sender, Sender::System);
        assert_eq!(last.content, "Error [ELEMENT_NOT_FOUND]: selector matched nothing");
    }

    #[test]
    fn test_error_envelope_by_payload_request_id() {
        let (mut t, _) = tracker();
        let now = Instant::now();
        let id = sent_chat(&mut t, "c", now);
        let err = Envelope::new(
            Peer::Agent,
            Body::Error(ErrorPayload {
                code: "NOT_PAIRED".into(),
                message: "no extension".into(),
                request_id: Some(id.clone()),
            }),
        );
        assert!(matches!(
            t.handle_envelope(&err, now),
            Resolution::Completed { status: ExecutionStatus::Error, .. }
        ));

        let stray = Envelope::new(
            Peer::Agent,
            Body::Error(ErrorPayload {
                code: "INVALID_MESSAGE".into(),
                message: "bad".into(),
                request_id: None,
            }),
        );
        assert_eq!(
            t.handle_envelope(&stray, now),
            Resolution::UnmatchedError(ErrorInfo::new("INVALID_MESSAGE", "bad"))
        );
    }

    #[test]
    fn test_error_for_finished_request_is_dropped() {
        let (mut t, _) = tracker();
        let now = Instant::now();
        let id = sent_chat(&mut t, "c", now);
        t.handle_envelope(&response(&id, true), now);
        let late = Envelope::new(
            Peer::Agent,
            Body::Error(ErrorPayload {
                code: "TIMEOUT".into(),
                message: "extension gave up".into(),
                request_id: Some(id.clone()),
            }),
        );
        assert_eq!(t.handle_envelope(&late, now), Resolution::Ignored);
        assert_eq!(t.messages("c").len(), 2);
        assert_eq!(t.execution("c").status, ExecutionStatus::Success);

        let unknown = Envelope::new(
            Peer::Agent,
            Body::Error(ErrorPayload {
                code: "TIMEOUT".into(),
                message: "who?".into(),
                request_id: Some("never-sent".into()),
            }),
        );
        assert!(matches!(t.handle_envelope(&unknown, now), Resolution::UnmatchedError(_)));
    }

    #[test]
    fn test_abandon_only_touches_pending_requests() {
        let (mut t, store) = tracker();
        let now = Instant::now();
        let done = sent_chat(&mut t, "done", now);
        t.handle_envelope(&response(&done, true), now);
        let refused = Envelope::chat("offline");
        t.begin("refused", &refused, "offline");
        t.mark_send_failed(&refused.message_id, ErrorInfo::new(codes::CONNECTION_LOST, "offline"));
        let waiting = sent_chat(&mut t, "waiting", now);

        assert_eq!(t.abandon_all(), vec!["waiting"]);
        assert_eq!(t.execution("done").status, ExecutionStatus::Success);
        assert_eq!(t.messages("refused").len(), 1);
        let stored = store.get_messages("waiting", &MessageQuery::default()).unwrap();
        let original = stored.iter().find(|m| m.id == waiting).unwrap();
        assert_eq!(original.status, Some(ExecutionStatus::Error));
        assert_eq!(original.error.as_ref().unwrap().code, codes::CONNECTION_LOST);
    }

    #[test]
    fn test_command_progress_sets_executing() {
        let (mut t, _) = tracker();
        let now = Instant::now();
        let id = sent_chat(&mut t, "c", now);
        let progress = Envelope::command("click", None).with_request_id(&id);
        assert!(matches!(t.handle_envelope(&progress, now), Resolution::Progress { .. }));
        let exec = t.execution("c");
        assert_eq!(exec.status, ExecutionStatus::Executing);
        assert_eq!(exec.current_step.as_deref(), Some("click"));

        t.handle_envelope(&response(&id, true), now);
        assert_eq!(t.execution("c").current_step, None);
    }

    #[test]
    fn test_abandon_all_on_disconnect() {
        let (mut t, _) = tracker();
        let now = Instant::now();
        let a = sent_chat(&mut t, "a", now);
        sent_chat(&mut t, "b", now);
        let mut affected = t.abandon_all();
        affected.sort();
        assert_eq!(affected, vec!["a", "b"]);
        assert_eq!(t.pending_count(), 0);
        let exec = t.execution("a");
        assert_eq!(exec.status, ExecutionStatus::Error);
        assert_eq!(exec.error.unwrap().code, codes::CONNECTION_LOST);
        let msgs = t.messages("a");
        assert_eq!(msgs[0].status, Some(ExecutionStatus::Error));
        assert_eq!(msgs.last().unwrap().sender, Sender::System);

        // A late response after the loss changes nothing.
        assert_eq!(t.handle_envelope(&response(&a, true), now), Resolution::Ignored);
        assert!(t.abandon_all().is_empty());
    }

    #[test]
    fn test_expire_stale() {
        let store = Arc::new(MemoryStore::new());
        let mut t = ExecutionTracker::new(store, Duration::from_secs(30));
        let t0 = Instant::now();
        let old = sent_chat(&mut t, "c", t0);
        let fresh = sent_chat(&mut t, "c", t0 + Duration::from_secs(20));
        let expired = t.expire_stale(t0 + Duration::from_secs(31));
        assert_eq!(expired.len(), 1);
        assert!(matches!(
            &expired[0],
            Resolution::Completed { status: ExecutionStatus::Timeout, request_id, .. } if *request_id == old
        ));
        assert!(t.is_pending(&fresh));
    }

    #[test]
    fn test_send_failure() {
        let (mut t, _) = tracker();
        let env = Envelope::command("scroll", Some(json!({"y": 10})));
        t.begin(DEFAULT_CONVERSATION, &env, "/scroll");
        t.mark_send_failed(&env.message_id, ErrorInfo::new(codes::CONNECTION_LOST, "offline"));
        assert_eq!(t.pending_count(), 0);
        let msg = &t.messages(DEFAULT_CONVERSATION)[0];
        assert_eq!(msg.status, Some(ExecutionStatus::Error));
        assert_eq!(msg.data, Some(json!({"y": 10})));
    }

    #[test]
    fn test_history_restore_and_load_older() {
        let store = Arc::new(MemoryStore::new());
        let base = Utc::now() - chrono::Duration::hours(1);
        for i in 0..5 {
            let mut m = ChatMessage::new(Sender::User, format!("old {i}"));
            m.timestamp = base + chrono::Duration::seconds(i);
            store.insert_message("c", &m).unwrap();
        }
        let mut t = ExecutionTracker::new(store, Duration::from_secs(60));
        assert_eq!(t.restore_history("c", 2).unwrap(), 2);
        assert_eq!(t.load_older("c", 2).unwrap(), 2);
        assert_eq!(t.load_older("c", 2).unwrap(), 1);
        assert_eq!(t.load_older("c", 2).unwrap(), 0);
        let contents: Vec<String> = t.messages("c").into_iter().map(|m| m.content).collect();
        assert_eq!(contents, vec!["old 0", "old 1", "old 2", "old 3", "old 4"]);
        // Reloading the latest page does not duplicate.
        assert_eq!(t.restore_history("c", 2).unwrap(), 0);
    }

    #[test]
    fn test_render_result() {
        assert_eq!(render_result(None), "Done");
        assert_eq!(render_result(Some(&json!("plain"))), "plain");
        assert_eq!(render_result(Some(&json!({"message": "hi"}))), "hi");
        assert!(render_result(Some(&json!({"count": 3}))).contains("\"count\": 3"));
    }
}
