//! [`ConnectionClient`]: the handle consumers hold.
//!
//! The socket itself lives in a driver task (see `driver.rs`). The client
//! and the driver share one `parking_lot` mutex holding the state, the
//! outbound channel and a generation counter. Every event is queued while that
//! lock is held and only if the driver's generation is still current, then a
//! single dispatcher task hands events to observers in queue order. Once
//! `disconnect()` returns, the `Disconnected` event is the last thing a
//! subscriber will ever see from the old connection.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{driver, validate_url, ClientOptions, ConnectionState, Session};
use crate::error::ConnectionError;
use crate::observer::{Observers, Subscription};
use crate::protocol::Envelope;

/// Events queued for the dispatcher.
#[derive(Debug)]
pub(super) enum Event {
    Status(ConnectionState),
    Error(ConnectionError),
    Message(Envelope),
    Latency(Duration),
}

/// State shared between the handle and the driver.
pub(super) struct Shared {
    pub(super) state: ConnectionState,
    pub(super) generation: u64,
    pub(super) outbound: Option<mpsc::UnboundedSender<Message>>,
    pub(super) session: Option<Session>,
    pub(super) attempts: u32,
    pub(super) latency: Option<Duration>,
    pub(super) last_error: Option<ConnectionError>,
    cancel: Option<CancellationToken>,
    url: Option<String>,
    events: mpsc::UnboundedSender<Event>,
}

impl Shared {
    /// Queue an event. Caller holds the lock.
    pub(super) fn push(&mut self, event: Event) {
        match &event {
            Event::Status(s) => self.state = *s,
            Event::Error(e) => self.last_error = Some(e.clone()),
            Event::Latency(d) => self.latency = Some(*d),
            Event::Message(_) => {}
        }
        let _ = self.events.send(event);
    }

    /// Transition and notify, skipping no-op transitions.
    pub(super) fn transition(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "Connection state change");
            if !state.is_connected() {
                self.latency = None;
            }
            self.push(Event::Status(state));
        }
    }

    /// Stop the current driver (if any) and forget its socket.
    fn stop_driver(&mut self) {
        self.generation += 1;
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
        self.outbound = None;
        self.session = None;
        self.latency = None;
        self.attempts = 0;
    }
}

struct Channels {
    status: Observers<ConnectionState>,
    error: Observers<ConnectionError>,
    message: Observers<Envelope>,
    latency: Observers<Duration>,
}

/// Reconnecting WebSocket client for the relay.
///
/// Must be created inside a Tokio runtime: construction spawns the event
/// dispatcher.
pub struct ConnectionClient {
    shared: Arc<Mutex<Shared>>,
    channels: Arc<Channels>,
    options: ClientOptions,
}

impl ConnectionClient {
    pub fn new(options: ClientOptions) -> Self {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<Event>();
        let channels = Arc::new(Channels {
            status: Observers::new("status"),
            error: Observers::new("error"),
            message: Observers::new("message"),
            latency: Observers::new("latency"),
        });

        let dispatch = Arc::clone(&channels);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    Event::Status(s) => dispatch.status.emit(&s),
                    Event::Error(e) => dispatch.error.emit(&e),
                    Event::Message(m) => dispatch.message.emit(&m),
                    Event::Latency(d) => dispatch.latency.emit(&d),
                };
            }
        });

        Self {
            shared: Arc::new(Mutex::new(Shared {
                state: ConnectionState::Disconnected,
                generation: 0,
                outbound: None,
                session: None,
                attempts: 0,
                latency: None,
                last_error: None,
                cancel: None,
                url: None,
                events: events_tx,
            })),
            channels,
            options,
        }
    }

    /// Open a connection to `url`, replacing any existing one.
    ///
    /// Resolves once the socket is open (`Ok`), the first attempt failed or
    /// timed out, or `disconnect()` was called in the meantime (`Cancelled`).
    /// A failed first attempt leaves the client in `Error` without retrying;
    /// automatic reconnects only follow a connection that was once open.
    pub async fn connect(&self, url: &str) -> Result<(), ConnectionError> {
        let open_rx = {
            let mut shared = self.shared.lock();
            shared.stop_driver();

            if !validate_url(url) {
                let err = ConnectionError::InvalidUrl(url.to_string());
                warn!(url, "Refusing to connect: invalid URL");
                shared.transition(ConnectionState::Error);
                shared.push(Event::Error(err.clone()));
                return Err(err);
            }

            info!(url, "Connecting to relay");
            let token = CancellationToken::new();
            shared.cancel = Some(token.clone());
            shared.url = Some(url.to_string());
            shared.transition(ConnectionState::Connecting);

            let (open_tx, open_rx) = oneshot::channel();
            let ctx = driver::DriverCtx {
                shared: Arc::clone(&self.shared),
                generation: shared.generation,
                cancel: token,
                url: url.to_string(),
                options: self.options,
            };
            tokio::spawn(driver::run(ctx, open_tx));
            open_rx
        };

        open_rx.await.unwrap_or(Err(ConnectionError::Cancelled))
    }

    /// Close the connection and stop reconnecting. Safe to call in any state.
    pub fn disconnect(&self) {
        let mut shared = self.shared.lock();
        if shared.cancel.is_some() || shared.state != ConnectionState::Disconnected {
            info!("Disconnecting from relay");
        }
        shared.stop_driver();
        shared.transition(ConnectionState::Disconnected);
    }

    /// Queue `envelope` for sending. Returns `false` unless connected.
    pub fn send(&self, envelope: &Envelope) -> bool {
        let shared = self.shared.lock();
        if !shared.state.is_connected() {
            debug!(kind = %envelope.message_type(), "Send refused: not connected");
            return false;
        }
        let Some(tx) = shared.outbound.as_ref() else {
            return false;
        };
        let text = match envelope.to_json() {
            Ok(t) => t,
            Err(e) => {
                warn!("Failed to encode envelope: {e}");
                return false;
            }
        };
        tx.send(Message::Text(text.into())).is_ok()
    }

    pub fn on_status_change(
        &self,
        handler: impl Fn(&ConnectionState) + Send + Sync + 'static,
    ) -> Subscription {
        self.channels.status.subscribe(handler)
    }

    pub fn on_error(
        &self,
        handler: impl Fn(&ConnectionError) + Send + Sync + 'static,
    ) -> Subscription {
        self.channels.error.subscribe(handler)
    }

    /// Every inbound envelope except HEARTBEAT, in arrival order.
    pub fn on_message(&self, handler: impl Fn(&Envelope) + Send + Sync + 'static) -> Subscription {
        self.channels.message.subscribe(handler)
    }

    /// Heartbeat round-trip measurements.
    pub fn on_latency(&self, handler: impl Fn(&Duration) + Send + Sync + 'static) -> Subscription {
        self.channels.latency.subscribe(handler)
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub fn session(&self) -> Option<Session> {
        self.shared.lock().session.clone()
    }

    pub fn latency(&self) -> Option<Duration> {
        self.shared.lock().latency
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.lock().attempts
    }

    pub fn last_error(&self) -> Option<ConnectionError> {
        self.shared.lock().last_error.clone()
    }

    /// URL of the most recent `connect()`.
    pub fn url(&self) -> Option<String> {
        self.shared.lock().url.clone()
    }

    pub fn options(&self) -> ClientOptions {
        self.options
    }

    /// Disconnect and drop every subscriber.
    pub fn dispose(&self) {
        self.disconnect();
        self.channels.status.clear();
        self.channels.error.clear();
        self.channels.message.clear();
        self.channels.latency.clear();
    }
}

impl Drop for ConnectionClient {
    fn drop(&mut self) {
        self.shared.lock().stop_driver();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ReconnectPolicy;
    use crate::protocol::Body;
    use crate::testing::{self, MockRelay};
    use std::time::Instant;

    fn fast_options(max_attempts: u32) -> ClientOptions {
        ClientOptions {
            open_timeout: Duration::from_millis(500),
            heartbeat_interval: Duration::from_millis(50),
            reconnect: ReconnectPolicy::new(Duration::from_millis(20), max_attempts),
        }
    }

    /// Collects every status/error event in delivery order.
    fn record(client: &ConnectionClient) -> Arc<Mutex<Vec<String>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = Arc::clone(&log);
        let _ = client.on_status_change(move |s| l.lock().push(format!("status:{s}")));
        let l = Arc::clone(&log);
        let _ = client.on_error(move |e| l.lock().push(format!("error:{e}")));
        log
    }

    #[tokio::test]
    async fn test_send_while_disconnected_returns_false() {
        let client = ConnectionClient::new(fast_options(3));
        assert!(!client.send(&Envelope::chat("hello")));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_invalid_url_fails_fast() {
        let client = ConnectionClient::new(fast_options(3));
        let log = record(&client);
        let err = client.connect("http://localhost:8080").await.unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidUrl(_)));
        assert_eq!(client.state(), ConnectionState::Error);
        testing::settle().await;
        let log = log.lock().clone();
        assert_eq!(log[0], "status:error");
        assert!(log[1].starts_with("error:invalid server URL"));
    }

    #[tokio::test]
    async fn test_unreachable_server_ends_in_error() {
        let client = ConnectionClient::new(fast_options(3));
        let log = record(&client);
        let result = client.connect("ws://localhost:9").await;
        assert!(result.is_err());
        assert_eq!(client.state(), ConnectionState::Error);
        testing::settle().await;
        let log = log.lock().clone();
        assert_eq!(log[0], "status:connecting");
        assert_eq!(log[1], "status:error");
        assert!(!log.iter().any(|l| l == "status:connected"));
        assert!(!log.iter().any(|l| l.starts_with("status:reconnecting")));
    }

    #[tokio::test]
    async fn test_open_timeout() {
        let addr = testing::silent_listener().await;
        let client = ConnectionClient::new(ClientOptions {
            open_timeout: Duration::from_millis(100),
            ..fast_options(3)
        });
        let started = Instant::now();
        let err = client.connect(&format!("ws://{addr}")).await.unwrap_err();
        assert_eq!(err, ConnectionError::Timeout(Duration::from_millis(100)));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(client.state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn test_handshake_session_and_latency() {
        let relay = MockRelay::start().await;
        let client = ConnectionClient::new(fast_options(3));
        let latencies = Arc::new(Mutex::new(Vec::new()));
        let l = Arc::clone(&latencies);
        let _ = client.on_latency(move |d| l.lock().push(*d));
        let acks = Arc::new(Mutex::new(Vec::new()));
        let a = Arc::clone(&acks);
        let _ = client.on_message(move |m| a.lock().push(m.message_type()));

        client.connect(&relay.url()).await.unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);

        let session = testing::wait_for(|| client.session()).await;
        assert_eq!(session.session_id, "mock-session");
        testing::wait_for(|| client.latency()).await;
        testing::wait_for(|| (!latencies.lock().is_empty()).then_some(())).await;

        // CONNECT reached the relay first; heartbeats never reach subscribers.
        let received = relay.received();
        assert!(matches!(received[0].body, Body::Connect(_)));
        assert!(acks.lock().iter().all(|t| *t != crate::protocol::MessageType::Heartbeat));

        assert!(client.send(&Envelope::chat("ping")));
        testing::wait_for(|| {
            relay
                .received()
                .into_iter()
                .find(|e| matches!(&e.body, Body::Chat(c) if c.text == "ping"))
        })
        .await;
        client.disconnect();
    }

    #[tokio::test]
    async fn test_latency_cleared_when_connection_ends() {
        let relay = MockRelay::start_once().await;
        let client = ConnectionClient::new(ClientOptions {
            reconnect: ReconnectPolicy::new(Duration::from_secs(30), 5),
            ..fast_options(5)
        });
        client.connect(&relay.url()).await.unwrap();
        testing::wait_for(|| client.latency()).await;

        relay.drop_connection();
        testing::wait_for(|| {
            matches!(client.state(), ConnectionState::Reconnecting { .. }).then_some(())
        })
        .await;
        assert!(client.latency().is_none());

        client.disconnect();
        assert!(client.latency().is_none());
    }

    #[tokio::test]
    async fn test_relay_ping_gets_acked() {
        let relay = MockRelay::start().await;
        let client = ConnectionClient::new(ClientOptions {
            heartbeat_interval: Duration::from_secs(60),
            ..fast_options(3)
        });
        client.connect(&relay.url()).await.unwrap();
        testing::wait_for(|| client.session()).await;

        let ping = Envelope::heartbeat();
        let ping_id = ping.message_id.clone();
        relay.push(&ping);
        let ack = testing::wait_for(|| {
            relay
                .received()
                .into_iter()
                .find(|e| e.request_id.as_deref() == Some(ping_id.as_str()))
        })
        .await;
        assert!(ack.message_id.starts_with("hb-ack-"));
        client.disconnect();
    }

    #[tokio::test]
    async fn test_disconnect_from_connected_stops_everything() {
        let relay = MockRelay::start().await;
        let client = ConnectionClient::new(fast_options(3));
        let log = record(&client);
        client.connect(&relay.url()).await.unwrap();
        testing::wait_for(|| client.session()).await;

        client.disconnect();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.session().is_none());
        assert!(!client.send(&Envelope::chat("late")));

        testing::settle().await;
        let snapshot = log.lock().clone();
        assert_eq!(snapshot.last().map(String::as_str), Some("status:disconnected"));

        // The relay sees a normal close, and nothing else arrives afterwards.
        let code = testing::wait_for(|| relay.close_code()).await;
        assert_eq!(code, 1000);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*log.lock(), snapshot);
    }

    #[tokio::test]
    async fn test_reconnect_exhaustion() {
        let relay = MockRelay::start_once().await;
        let client = ConnectionClient::new(fast_options(3));
        let log = record(&client);
        let delays = Arc::new(Mutex::new(Vec::new()));
        let d = Arc::clone(&delays);
        let _ = client.on_status_change(move |s| {
            if let ConnectionState::Reconnecting { attempt, delay } = s {
                d.lock().push((*attempt, *delay));
            }
        });

        client.connect(&relay.url()).await.unwrap();
        relay.drop_connection();

        testing::wait_for(|| {
            log.lock()
                .iter()
                .any(|l| l.starts_with("error:gave up"))
                .then_some(())
        })
        .await;

        assert_eq!(
            *delays.lock(),
            vec![
                (1, Duration::from_millis(20)),
                (2, Duration::from_millis(40)),
                (3, Duration::from_millis(80)),
            ]
        );
        assert_eq!(client.state(), ConnectionState::Disconnected);
        let log = log.lock().clone();
        let statuses: Vec<&str> = log
            .iter()
            .filter(|l| l.starts_with("status:"))
            .map(String::as_str)
            .collect();
        assert_eq!(statuses.last(), Some(&"status:disconnected"));
        assert_eq!(
            statuses.iter().filter(|s| s.starts_with("status:reconnecting")).count(),
            3
        );
        assert_eq!(log.last().map(String::as_str), Some("error:gave up reconnecting after 3 attempts"));
    }

    #[tokio::test]
    async fn test_disconnect_during_reconnect_wait() {
        let relay = MockRelay::start_once().await;
        let client = ConnectionClient::new(ClientOptions {
            reconnect: ReconnectPolicy::new(Duration::from_secs(30), 5),
            ..fast_options(5)
        });
        let log = record(&client);
        client.connect(&relay.url()).await.unwrap();
        relay.drop_connection();

        testing::wait_for(|| {
            matches!(client.state(), ConnectionState::Reconnecting { .. }).then_some(())
        })
        .await;
        client.disconnect();
        assert_eq!(client.reconnect_attempts(), 0);

        testing::settle().await;
        let snapshot = log.lock().clone();
        assert_eq!(snapshot.last().map(String::as_str), Some("status:disconnected"));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*log.lock(), snapshot);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_pending_connect() {
        let addr = testing::silent_listener().await;
        let client = Arc::new(ConnectionClient::new(ClientOptions {
            open_timeout: Duration::from_secs(30),
            ..fast_options(3)
        }));
        let c = Arc::clone(&client);
        let pending = tokio::spawn(async move { c.connect(&format!("ws://{addr}")).await });
        testing::wait_for(|| (client.state() == ConnectionState::Connecting).then_some(())).await;
        client.disconnect();
        let result = pending.await.unwrap();
        assert_eq!(result, Err(ConnectionError::Cancelled));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_clean_server_close_does_not_reconnect() {
        let relay = MockRelay::start().await;
        let client = ConnectionClient::new(fast_options(3));
        let log = record(&client);
        client.connect(&relay.url()).await.unwrap();
        testing::wait_for(|| client.session()).await;
        relay.close_normal();

        testing::wait_for(|| {
            (client.state() == ConnectionState::Disconnected).then_some(())
        })
        .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!log.lock().iter().any(|l| l.starts_with("status:reconnecting")));
    }

    #[tokio::test]
    async fn test_malformed_frame_is_dropped() {
        let relay = MockRelay::start().await;
        let client = ConnectionClient::new(fast_options(3));
        let messages = Arc::new(Mutex::new(Vec::new()));
        let m = Arc::clone(&messages);
        let _ = client.on_message(move |e| m.lock().push(e.message_type()));
        client.connect(&relay.url()).await.unwrap();
        testing::wait_for(|| client.session()).await;

        relay.push_raw("{ definitely not json");
        relay.push(&Envelope::chat("after"));
        testing::wait_for(|| {
            messages
                .lock()
                .contains(&crate::protocol::MessageType::Chat)
                .then_some(())
        })
        .await;
        assert_eq!(client.state(), ConnectionState::Connected);
        client.disconnect();
    }
}
