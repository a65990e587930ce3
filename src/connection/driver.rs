//! Per-connection task.
//!
//! One `run` future owns the socket for a single `connect()` call, including
//! every automatic reconnect that follows it. Timers (open timeout, heartbeat
//! interval, backoff sleep) are locals of this future and go away with it.
//! All state changes go through [`DriverCtx`], which silently discards them
//! once the client has moved on to a newer generation.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::{Event, Shared};
use super::heartbeat::{HeartbeatInbound, HeartbeatTracker};
use super::{describe_close, ClientOptions, ConnectionState, Session};
use crate::error::{ConnectionError, ProtocolError};
use crate::protocol::{Body, Envelope};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// How a connected session ended.
enum SessionEnd {
    /// `disconnect()` or a newer `connect()`.
    Cancelled,
    /// Relay closed with a normal close code.
    Clean,
    /// EOF, transport error, or a non-normal close code.
    Abnormal(String),
}

pub(super) struct DriverCtx {
    pub(super) shared: Arc<Mutex<Shared>>,
    pub(super) generation: u64,
    pub(super) cancel: CancellationToken,
    pub(super) url: String,
    pub(super) options: ClientOptions,
}

impl DriverCtx {
    /// Run `f` against the shared state if this driver is still current.
    fn with_shared<R>(&self, f: impl FnOnce(&mut Shared) -> R) -> Option<R> {
        let mut shared = self.shared.lock();
        (shared.generation == self.generation).then(|| f(&mut shared))
    }

    fn transition(&self, state: ConnectionState) {
        self.with_shared(|s| s.transition(state));
    }

    fn emit(&self, event: Event) {
        self.with_shared(|s| s.push(event));
    }

    /// Socket is open: publish the outbound channel and go `Connected`.
    fn opened(&self, outbound: mpsc::UnboundedSender<Message>) -> bool {
        self.with_shared(|s| {
            s.attempts = 0;
            s.outbound = Some(outbound);
            s.transition(ConnectionState::Connected);
        })
        .is_some()
    }

    fn lost(&self) {
        self.with_shared(|s| {
            s.outbound = None;
            s.session = None;
        });
    }

    fn next_attempt(&self) -> Option<u32> {
        self.with_shared(|s| {
            s.attempts += 1;
            s.attempts
        })
    }
}

pub(super) async fn run(ctx: DriverCtx, open_tx: oneshot::Sender<Result<(), ConnectionError>>) {
    let policy = ctx.options.reconnect;
    let mut first = Some(open_tx);

    loop {
        ctx.transition(ConnectionState::Connecting);

        let opened = tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => return,
            res = open(&ctx.url, ctx.options.open_timeout) => res,
        };

        match opened {
            Ok(ws) => {
                let (out_tx, out_rx) = mpsc::unbounded_channel();
                if !ctx.opened(out_tx) {
                    return;
                }
                info!(url = %ctx.url, "Connected to relay");
                if let Some(tx) = first.take() {
                    let _ = tx.send(Ok(()));
                }

                let end = run_session(&ctx, ws, out_rx).await;
                ctx.lost();
                match end {
                    SessionEnd::Cancelled => return,
                    SessionEnd::Clean => {
                        info!("Relay closed the connection");
                        ctx.transition(ConnectionState::Disconnected);
                        return;
                    }
                    SessionEnd::Abnormal(reason) => {
                        warn!("Connection lost: {reason}");
                    }
                }
            }
            Err(err) => {
                warn!(url = %ctx.url, "Connection attempt failed: {err}");
                ctx.transition(ConnectionState::Error);
                ctx.emit(Event::Error(err.clone()));
                if let Some(tx) = first.take() {
                    let _ = tx.send(Err(err));
                    return;
                }
            }
        }

        let Some(attempt) = ctx.next_attempt() else {
            return;
        };
        if !policy.should_retry(attempt) {
            let attempts = attempt - 1;
            warn!(attempts, "Giving up on reconnecting");
            ctx.transition(ConnectionState::Disconnected);
            ctx.emit(Event::Error(ConnectionError::ReconnectExhausted { attempts }));
            return;
        }

        let delay = policy.next_delay(attempt);
        info!(attempt, delay_ms = delay.as_millis(), "Reconnecting");
        ctx.transition(ConnectionState::Reconnecting { attempt, delay });
        tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

/// Open the socket and send CONNECT, bounded by `open_timeout`.
async fn open(url: &str, open_timeout: Duration) -> Result<WsStream, ConnectionError> {
    let attempt = async {
        let (mut ws, _response) = tokio_tungstenite::connect_async(url).await?;
        let hello = Envelope::connect()
            .to_json()
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;
        ws.send(Message::Text(hello.into())).await?;
        Ok::<_, ConnectionError>(ws)
    };
    match tokio::time::timeout(open_timeout, attempt).await {
        Ok(res) => res,
        Err(_) => Err(ConnectionError::Timeout(open_timeout)),
    }
}

async fn run_session(
    ctx: &DriverCtx,
    ws: WsStream,
    mut out_rx: mpsc::UnboundedReceiver<Message>,
) -> SessionEnd {
    let (mut sink, mut stream) = ws.split();
    let mut heartbeat = HeartbeatTracker::new();
    let period = ctx.options.heartbeat_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => {
                let close = Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: Utf8Bytes::from_static("User disconnect"),
                }));
                let _ = tokio::time::timeout(Duration::from_secs(1), sink.send(close)).await;
                return SessionEnd::Cancelled;
            }
            frame = out_rx.recv() => {
                // Sender is dropped only when the client stopped this driver.
                let Some(frame) = frame else { return SessionEnd::Cancelled };
                if let Err(e) = sink.send(frame).await {
                    return SessionEnd::Abnormal(e.to_string());
                }
            }
            _ = ticker.tick() => {
                let Ok(text) = Envelope::heartbeat().to_json() else { continue };
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    return SessionEnd::Abnormal(e.to_string());
                }
                heartbeat.on_sent(Instant::now().into_std());
            }
            msg = stream.next() => {
                let reply = match msg {
                    None => return SessionEnd::Abnormal(describe_close(1006, "")),
                    Some(Err(e)) => return SessionEnd::Abnormal(e.to_string()),
                    Some(Ok(Message::Close(frame))) => return close_outcome(frame),
                    Some(Ok(Message::Text(text))) => {
                        handle_text(ctx, &mut heartbeat, text.as_str())
                    }
                    Some(Ok(Message::Binary(_))) => {
                        warn!("{}", ProtocolError::Binary);
                        None
                    }
                    Some(Ok(_)) => None,
                };
                if let Some(reply) = reply {
                    let Ok(text) = reply.to_json() else { continue };
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        return SessionEnd::Abnormal(e.to_string());
                    }
                    heartbeat.on_sent(Instant::now().into_std());
                }
            }
        }
    }
}

fn close_outcome(frame: Option<CloseFrame>) -> SessionEnd {
    match frame {
        None => SessionEnd::Clean,
        Some(f) if f.code == CloseCode::Normal => SessionEnd::Clean,
        Some(f) => SessionEnd::Abnormal(describe_close(u16::from(f.code), f.reason.as_str())),
    }
}

/// Dispatch one inbound text frame. Returns a heartbeat ack to send back,
/// if the frame was a relay ping.
fn handle_text(ctx: &DriverCtx, heartbeat: &mut HeartbeatTracker, text: &str) -> Option<Envelope> {
    let envelope = match Envelope::from_json(text) {
        Ok(env) => env,
        Err(e) => {
            warn!("Dropping inbound frame: {e}");
            return None;
        }
    };

    match &envelope.body {
        Body::Heartbeat => match heartbeat.on_inbound(Instant::now().into_std()) {
            HeartbeatInbound::Ack(rtt) => {
                debug!(latency_ms = rtt.as_millis(), "Heartbeat ack");
                ctx.emit(Event::Latency(rtt));
                None
            }
            HeartbeatInbound::Ping => Some(Envelope::heartbeat_ack(&envelope.message_id)),
        },
        Body::ConnectAck(ack) => {
            info!(session_id = %ack.session_id, "Relay session established");
            let session = Session {
                session_id: ack.session_id.clone(),
                established_at: Utc::now(),
            };
            ctx.with_shared(|s| {
                s.session = Some(session);
                s.push(Event::Message(envelope));
            });
            None
        }
        _ => {
            ctx.emit(Event::Message(envelope));
            None
        }
    }
}
