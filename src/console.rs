//! The console: one relay connection plus everything fed by it.
//!
//! ```text
//!                 ┌──────────────────────── Console ────────────────────────┐
//! send_chat ────▶ │ tracker.begin ─▶ client.send ─▶ tracker.mark_sent       │
//!                 │                       │                                 │
//!                 │ on_message ◀──────────┘  STATUS  ─▶ registry             │
//!                 │                          RESPONSE/ERROR/COMMAND ─▶ tracker│
//!                 │                          every envelope ─▶ traffic log    │
//!                 │ on_status_change: connection lost ─▶ abandon + mark all  │
//!                 └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Observer callbacks run on the client's dispatcher task and take the state
//! lock briefly; no lock is held across an `.await`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::connection::{ClientOptions, ConnectionClient, ConnectionState, Session};
use crate::error::{codes, ConnectionError, ErrorInfo, SendError, StoreError};
use crate::execution::{
    ChatMessage, ExecutionState, ExecutionTracker, Resolution, DEFAULT_CONVERSATION,
};
use crate::notify::{Notifications, Notifier};
use crate::observer::Subscription;
use crate::protocol::{Body, Envelope};
use crate::registry::{ClientRegistry, RegistryChange, RemoteClient};
use crate::store::{Store, Template, DEFAULT_PAGE_SIZE};
use crate::traffic::{Direction, TrafficEntry, TrafficFilter, TrafficLog};

struct ConsoleState {
    registry: ClientRegistry,
    tracker: ExecutionTracker,
    history_page: usize,
}

impl ConsoleState {
    fn conversation(&self) -> String {
        self.registry
            .selected_id()
            .unwrap_or(DEFAULT_CONVERSATION)
            .to_string()
    }

    /// Load stored history for `id` the first time it is shown.
    fn ensure_history(&mut self, id: &str) {
        if !self.registry.needs_history(id) {
            return;
        }
        self.registry.mark_history_loaded(id);
        match self.tracker.restore_history(id, self.history_page) {
            Ok(n) => debug!(id, loaded = n, "Restored history"),
            Err(e) => {
                warn!(id, "Failed to load history: {e}");
                self.registry.forget_history(id);
            }
        }
    }
}

/// Point-in-time view of the connection and request state.
#[derive(Debug, Clone, Serialize)]
pub struct ConsoleSnapshot {
    pub state: ConnectionState,
    pub url: Option<String>,
    pub session: Option<Session>,
    pub latency_ms: Option<u64>,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
    pub last_response_ms: Option<u64>,
    pub selected_client: Option<String>,
    pub clients: usize,
    pub pending_requests: usize,
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

pub struct Console {
    client: ConnectionClient,
    state: Arc<Mutex<ConsoleState>>,
    traffic: Arc<TrafficLog>,
    store: Arc<dyn Store>,
    notifications: Notifications,
    default_url: String,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl Console {
    /// Build a console from settings. Must be called inside a Tokio runtime.
    pub fn new(config: &Config, store: Arc<dyn Store>, notifier: Arc<dyn Notifier>) -> Self {
        let mut registry = ClientRegistry::new(Arc::clone(&store));
        registry.load_from_store();
        let tracker = ExecutionTracker::new(
            Arc::clone(&store),
            Duration::from_secs(config.server.request_timeout_secs),
        );

        let console = Self {
            client: ConnectionClient::new(ClientOptions::from_config(&config.server)),
            state: Arc::new(Mutex::new(ConsoleState {
                registry,
                tracker,
                history_page: DEFAULT_PAGE_SIZE,
            })),
            traffic: Arc::new(TrafficLog::new(config.logging.traffic_log_size)),
            store,
            notifications: Notifications::new(config.notifications, notifier),
            default_url: config.server.url.clone(),
            subscriptions: Mutex::new(Vec::new()),
        };
        console.wire();
        console
    }

    fn wire(&self) {
        let mut subs = self.subscriptions.lock();

        let state = Arc::clone(&self.state);
        let notifications = self.notifications.clone();
        subs.push(self.client.on_status_change(move |s| {
            if s.is_connection_lost() {
                let mut st = state.lock();
                let abandoned = st.tracker.abandon_all();
                let marked = st.registry.mark_all_disconnected();
                if !abandoned.is_empty() || marked > 0 {
                    info!(
                        conversations = abandoned.len(),
                        clients = marked,
                        "Connection lost; requests abandoned"
                    );
                }
            }
            notifications.connection(*s);
        }));

        subs.push(self.client.on_error(|e| {
            if e.is_terminal() {
                warn!("Connection stopped: {e}");
            } else {
                debug!("Connection error event: {e}");
            }
        }));

        let state = Arc::clone(&self.state);
        let traffic = Arc::clone(&self.traffic);
        let notifications = self.notifications.clone();
        subs.push(self.client.on_message(move |env| {
            traffic.record(Direction::Inbound, env);
            handle_inbound(&mut state.lock(), &notifications, env);
        }));
    }

    /// Connect to `url`, or to the configured server when `None`.
    pub async fn connect(&self, url: Option<&str>) -> Result<(), ConnectionError> {
        let url = url.unwrap_or(&self.default_url).to_string();
        self.client.connect(&url).await
    }

    pub fn disconnect(&self) {
        self.client.disconnect();
    }

    /// Send a CHAT to the selected client (or untargeted when none is selected).
    pub fn send_chat(&self, text: &str) -> Result<ChatMessage, SendError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SendError::Empty);
        }
        self.dispatch(Envelope::chat(text), text)
    }

    pub fn send_command(&self, command: &str, params: Option<Value>) -> Result<ChatMessage, SendError> {
        let command = command.trim();
        if command.is_empty() {
            return Err(SendError::Empty);
        }
        let shown = match &params {
            Some(p) => format!("/{command} {p}"),
            None => format!("/{command}"),
        };
        self.dispatch(Envelope::command(command, params), &shown)
    }

    /// Send a stored template's content as a CHAT and bump its usage count.
    pub fn use_template(&self, id: &str) -> Result<ChatMessage, SendError> {
        let template = match self.store.get_template(id) {
            Ok(Some(t)) => t,
            Ok(None) => return Err(SendError::UnknownTemplate(id.to_string())),
            Err(e) => {
                warn!(id, "Failed to read template: {e}");
                return Err(SendError::UnknownTemplate(id.to_string()));
            }
        };
        let sent = self.send_chat(&template.content)?;
        if let Err(e) = self.store.increment_template_usage(id) {
            warn!(id, "Failed to record template use: {e}");
        }
        Ok(sent)
    }

    fn dispatch(&self, envelope: Envelope, shown: &str) -> Result<ChatMessage, SendError> {
        let mut st = self.state.lock();
        let envelope = match st.registry.selected_id() {
            Some(id) => envelope.with_target_client(id),
            None => envelope,
        };
        let conversation = st.conversation();
        let message = st.tracker.begin(&conversation, &envelope, shown);

        if self.client.send(&envelope) {
            st.tracker.mark_sent(&envelope.message_id, Instant::now());
            drop(st);
            self.traffic.record(Direction::Outbound, &envelope);
            Ok(message)
        } else {
            let err = SendError::NotConnected;
            st.tracker.mark_send_failed(
                &envelope.message_id,
                ErrorInfo::new(codes::CONNECTION_LOST, err.to_string()),
            );
            drop(st);
            self.notifications.send_failed(&err.to_string());
            Err(err)
        }
    }

    /// Change the selection; `false` for an unknown id.
    pub fn select_client(&self, id: Option<&str>) -> bool {
        let mut st = self.state.lock();
        if !st.registry.select(id) {
            return false;
        }
        if let Some(id) = id {
            st.ensure_history(id);
        }
        true
    }

    pub fn rename_client(&self, id: &str, name: &str) -> bool {
        self.state.lock().registry.rename(id, name)
    }

    /// Forget a client and its conversation.
    pub fn remove_client(&self, id: &str) -> bool {
        let mut st = self.state.lock();
        if st.registry.remove(id).is_none() {
            return false;
        }
        st.tracker.clear(id);
        true
    }

    /// Clear a conversation; `None` means the current one.
    pub fn clear_conversation(&self, id: Option<&str>) {
        let mut st = self.state.lock();
        let key = id.map_or_else(|| st.conversation(), ToString::to_string);
        st.tracker.clear(&key);
        if key != DEFAULT_CONVERSATION {
            // Nothing left to restore; a reselect should not reload what was just cleared.
            st.registry.mark_history_loaded(&key);
        }
    }

    /// Page older history into a conversation.
    pub fn load_older(&self, id: Option<&str>) -> Result<usize, StoreError> {
        let mut st = self.state.lock();
        let key = id.map_or_else(|| st.conversation(), ToString::to_string);
        let page = st.history_page;
        st.tracker.load_older(&key, page)
    }

    pub fn clients(&self) -> Vec<RemoteClient> {
        self.state.lock().registry.list_all()
    }

    pub fn selected_client(&self) -> Option<RemoteClient> {
        self.state.lock().registry.selected().cloned()
    }

    /// Messages of a conversation; `None` means the current one.
    pub fn messages(&self, id: Option<&str>) -> Vec<ChatMessage> {
        let st = self.state.lock();
        let key = id.map_or_else(|| st.conversation(), ToString::to_string);
        st.tracker.messages(&key)
    }

    pub fn execution(&self, id: Option<&str>) -> ExecutionState {
        let st = self.state.lock();
        let key = id.map_or_else(|| st.conversation(), ToString::to_string);
        st.tracker.execution(&key)
    }

    pub fn pending_requests(&self) -> usize {
        self.state.lock().tracker.pending_count()
    }

    pub fn snapshot(&self) -> ConsoleSnapshot {
        let st = self.state.lock();
        ConsoleSnapshot {
            state: self.client.state(),
            url: self.client.url(),
            session: self.client.session(),
            latency_ms: self.client.latency().map(millis),
            reconnect_attempts: self.client.reconnect_attempts(),
            last_error: self.client.last_error().map(|e| e.to_string()),
            last_response_ms: st.tracker.last_response_time().map(millis),
            selected_client: st.registry.selected_id().map(ToString::to_string),
            clients: st.registry.len(),
            pending_requests: st.tracker.pending_count(),
        }
    }

    pub fn traffic(&self, filter: &TrafficFilter) -> Vec<TrafficEntry> {
        self.traffic.filtered(filter)
    }

    pub fn traffic_log(&self) -> &TrafficLog {
        &self.traffic
    }

    pub fn templates(&self) -> Result<Vec<Template>, StoreError> {
        self.store.get_templates()
    }

    pub fn save_template(&self, template: &Template) -> Result<(), StoreError> {
        self.store.upsert_template(template)
    }

    pub fn delete_template(&self, id: &str) -> Result<(), StoreError> {
        self.store.delete_template(id)
    }

    /// Time out requests that waited too long. Returns how many expired.
    pub fn expire_stale(&self) -> usize {
        let expired = self.state.lock().tracker.expire_stale(Instant::now());
        for r in &expired {
            if let Resolution::Completed { status, elapsed, .. } = r {
                self.notifications.command_complete(*status, *elapsed, None);
            }
        }
        expired.len()
    }

    /// Detach from the client and shut it down.
    pub fn dispose(&self) {
        for sub in self.subscriptions.lock().drain(..) {
            sub.unsubscribe();
        }
        self.client.dispose();
    }
}

fn handle_inbound(st: &mut ConsoleState, notifications: &Notifications, env: &Envelope) {
    match &env.body {
        Body::Status(status) => match st.registry.apply_status(status) {
            Some(RegistryChange::Paired {
                client,
                auto_selected: true,
                ..
            }) => st.ensure_history(&client.id),
            Some(RegistryChange::Removed { id }) => st.tracker.clear(&id),
            _ => {}
        },
        Body::Response(_) | Body::Error(_) | Body::Command(_) => {
            match st.tracker.handle_envelope(env, Instant::now()) {
                Resolution::Completed {
                    status,
                    elapsed,
                    error,
                    ..
                } => {
                    let detail = error.as_ref().map(|e| e.code.as_str());
                    notifications.command_complete(status, elapsed, detail);
                }
                Resolution::UnmatchedError(error) => {
                    let conversation = st.conversation();
                    let text = format!("Error [{}]: {}", error.code, error.message);
                    st.tracker.append_system(&conversation, &text, Some(error));
                }
                Resolution::Progress { .. } | Resolution::Ignored => {}
            }
        }
        Body::Chat(chat) => {
            let conversation = st.conversation();
            st.tracker.append_incoming(&conversation, &chat.text);
        }
        Body::ConnectAck(ack) => debug!(session = %ack.session_id, "Session established"),
        Body::Connect(_) | Body::Heartbeat => {}
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        self.dispose();
    }
}
