//! In-process relay and polling helpers for socket-level tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};

use crate::protocol::{Body, ConnectAckPayload, Envelope, Peer};

enum Command {
    Send(String),
    Drop,
    CloseNormal,
}

#[derive(Default)]
struct RelayLog {
    received: Vec<Envelope>,
    close_code: Option<u16>,
}

/// Minimal relay: answers CONNECT with CONNECT_ACK, answers every HEARTBEAT
/// with a HEARTBEAT, records what it receives and lets the test push frames.
pub struct MockRelay {
    addr: SocketAddr,
    log: Arc<Mutex<RelayLog>>,
    commands: mpsc::UnboundedSender<Command>,
    task: tokio::task::JoinHandle<()>,
}

impl MockRelay {
    /// Accepts connections one after another for as long as it lives.
    pub async fn start() -> Self {
        Self::spawn(false).await
    }

    /// Accepts a single connection, then stops listening so reconnects are refused.
    pub async fn start_once() -> Self {
        Self::spawn(true).await
    }

    async fn spawn(once: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let log = Arc::new(Mutex::new(RelayLog::default()));
        let (commands, mut rx) = mpsc::unbounded_channel();

        let task_log = Arc::clone(&log);
        let task = tokio::spawn(async move {
            let mut listener = Some(listener);
            while let Some(l) = listener.as_ref() {
                let Ok((tcp, _)) = l.accept().await else { break };
                if once {
                    listener = None;
                }
                serve(tcp, &task_log, &mut rx).await;
            }
        });

        Self {
            addr,
            log,
            commands,
            task,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn received(&self) -> Vec<Envelope> {
        self.log.lock().received.clone()
    }

    pub fn close_code(&self) -> Option<u16> {
        self.log.lock().close_code
    }

    pub fn push(&self, envelope: &Envelope) {
        self.push_raw(&envelope.to_json().unwrap());
    }

    pub fn push_raw(&self, text: &str) {
        let _ = self.commands.send(Command::Send(text.to_string()));
    }

    /// Drop the TCP connection without a close handshake.
    pub fn drop_connection(&self) {
        let _ = self.commands.send(Command::Drop);
    }

    pub fn close_normal(&self) {
        let _ = self.commands.send(Command::CloseNormal);
    }
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn from_relay(body: Body) -> Envelope {
    let mut env = Envelope::new(Peer::Agent, body);
    env.source = Peer::Server;
    env
}

async fn serve(
    tcp: TcpStream,
    log: &Arc<Mutex<RelayLog>>,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) {
    let Ok(mut ws) = tokio_tungstenite::accept_async(tcp).await else {
        return;
    };
    loop {
        tokio::select! {
            msg = ws.next() => {
                let reply = match msg {
                    Some(Ok(Message::Text(text))) => {
                        let Ok(env) = Envelope::from_json(text.as_str()) else { continue };
                        let reply = match env.body {
                            Body::Connect(_) => Some(from_relay(Body::ConnectAck(ConnectAckPayload {
                                session_id: "mock-session".into(),
                                status: Some("connected".into()),
                            }))),
                            Body::Heartbeat => Some(from_relay(Body::Heartbeat)),
                            _ => None,
                        };
                        log.lock().received.push(env);
                        reply
                    }
                    Some(Ok(Message::Close(frame))) => {
                        log.lock().close_code = Some(frame.map_or(1005, |f| u16::from(f.code)));
                        return;
                    }
                    Some(Ok(_)) => None,
                    _ => return,
                };
                if let Some(reply) = reply {
                    let text = reply.to_json().unwrap();
                    if ws.send(Message::Text(text.into())).await.is_err() {
                        return;
                    }
                }
            }
            cmd = commands.recv() => match cmd {
                Some(Command::Send(text)) => {
                    if ws.send(Message::Text(text.into())).await.is_err() {
                        return;
                    }
                }
                Some(Command::CloseNormal) => {
                    let _ = ws
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: Utf8Bytes::from_static("bye"),
                        })))
                        .await;
                    return;
                }
                Some(Command::Drop) | None => return,
            }
        }
    }
}

/// A TCP listener that accepts connections but never answers the WebSocket
/// handshake.
pub async fn silent_listener() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((tcp, _)) = listener.accept().await {
            held.push(tcp);
        }
    });
    addr
}

/// Give the event dispatcher a moment to drain.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Poll `probe` every 10ms until it yields a value; panics after 5s.
pub async fn wait_for<T>(mut probe: impl FnMut() -> Option<T>) -> T {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(value) = probe() {
            return value;
        }
        assert!(Instant::now() < deadline, "condition not met within 5s");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
