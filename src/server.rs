//! WebSocket broadcast and access layer
//!
//! Accepts viewer connections, enforces admission and per-connection abuse
//! limits, relays session output and trigger events to every live client,
//! and feeds operator input back into the session manager.

use crate::auth::Authorizer;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::limits::{AccessControl, AdmissionDenied, MessageThrottle, ThrottleVerdict};
use crate::notify::Notifier;
use crate::protocol::{close_reason, ClientMessage, ServerMessage, TriggerInfo};
use crate::session::{SessionEvent, SessionManager};
use crate::source::{LaunchSpec, TermSource};
use crate::watcher::{Trigger, Watcher};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::{accept_async, tungstenite::Message};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;
type ClientTx = mpsc::UnboundedSender<Message>;
type ClientMap = Arc<RwLock<HashMap<SocketAddr, Client>>>;

/// How long a connection may take to present its credential.
const HELLO_DEADLINE: Duration = Duration::from_secs(10);
/// Cadence of the rate-window / ban-expiry sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// One live connection's outbound queue plus the buffer position at which
/// its last state snapshot was taken. Output chunks at or before
/// `joined_seq` are already inside that snapshot and must not be streamed
/// again.
struct Client {
    tx: ClientTx,
    joined_seq: u64,
}

/// Snapshot requests, handled by the fan-out task so they cannot interleave
/// with event delivery.
enum Admission {
    Join { addr: SocketAddr, tx: ClientTx },
    Refresh { addr: SocketAddr },
}

pub struct EngineServer {
    config: EngineConfig,
    /// The agent command launched by `start`; args come from the client.
    command: String,
    session: Arc<SessionManager>,
    source: Arc<dyn TermSource>,
    watcher: Mutex<Watcher>,
    access: Mutex<AccessControl>,
    authorizer: Arc<dyn Authorizer>,
    notifier: Arc<dyn Notifier>,
    clients: ClientMap,
    admissions: mpsc::UnboundedSender<Admission>,
    admissions_rx: Mutex<Option<mpsc::UnboundedReceiver<Admission>>>,
}

impl EngineServer {
    pub fn new(
        config: EngineConfig,
        command: String,
        source: Arc<dyn TermSource>,
        authorizer: Arc<dyn Authorizer>,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        let session = Arc::new(SessionManager::new(&config));
        let watcher = Watcher::new(
            crate::patterns::PatternSet::with_defaults(),
            config.window_lines,
            config.chunk_cap,
        );
        let access = AccessControl::new(&config);
        let (admissions, admissions_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            config,
            command,
            session,
            source,
            watcher: Mutex::new(watcher),
            access: Mutex::new(access),
            authorizer,
            notifier,
            clients: Arc::new(RwLock::new(HashMap::new())),
            admissions,
            admissions_rx: Mutex::new(Some(admissions_rx)),
        })
    }

    /// Run the accept loop. The listener is bound by the caller so tests can
    /// use an ephemeral port.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        let admissions_rx = self.admissions_rx.lock().await.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "server already running")
        })?;

        let fanout = Arc::clone(&self);
        tokio::spawn(async move {
            fanout.fanout_loop(admissions_rx).await;
        });

        let sweeper = Arc::clone(&self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tick.tick().await;
                sweeper.access.lock().await.sweep(Instant::now());
            }
        });

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, addr).await {
                            tracing::debug!("Client {} error: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Accept error: {}", e);
                }
            }
        }
    }

    /// Relay session and trigger events to every live client. Each event is
    /// serialized once; a connection whose queue is gone is skipped.
    ///
    /// Snapshot requests run inside this task too: the snapshot, the client
    /// map update, and event delivery never interleave, so everything in a
    /// snapshot was delivered to the queue before it and everything newer is
    /// streamed after it, with no chunk duplicated or lost in between.
    async fn fanout_loop(self: Arc<Self>, mut admissions: mpsc::UnboundedReceiver<Admission>) {
        let mut events = self.session.subscribe();
        loop {
            tokio::select! {
                Some(admission) = admissions.recv() => {
                    self.admit_client(admission).await;
                }

                event = events.recv() => match event {
                    Ok(SessionEvent::Data { seq, chunk }) => {
                        // Output first, then the trigger it may have produced,
                        // so clients always see the prompt text before the
                        // options. Clients whose snapshot already contains
                        // this chunk are skipped.
                        match serde_json::to_string(&ServerMessage::Output {
                            data: BASE64.encode(&chunk),
                        }) {
                            Ok(text) => {
                                let clients = self.clients.read().await;
                                for client in clients.values() {
                                    if client.joined_seq < seq {
                                        let _ = client.tx.send(Message::Text(text.clone()));
                                    }
                                }
                            }
                            Err(e) => {
                                tracing::error!("Failed to serialize output: {}", e);
                            }
                        }

                        let trigger = self.watcher.lock().await.process(&chunk);
                        if let Some(trigger) = trigger {
                            tracing::info!(prompt = %trigger.prompt.lines().last().unwrap_or(""), "Input prompt detected");
                            self.broadcast(&ServerMessage::Options {
                                prompt: trigger.prompt.clone(),
                                choices: trigger.choices.clone(),
                            })
                            .await;
                            self.notifier.on_trigger(
                                &trigger.prompt,
                                &trigger.choices,
                                trigger.fingerprint,
                            );
                        }
                    }
                    Ok(SessionEvent::Started {
                        command,
                        args,
                        working_dir,
                    }) => {
                        self.broadcast(&ServerMessage::Started {
                            command,
                            args,
                            working_dir,
                        })
                        .await;
                    }
                    Ok(SessionEvent::Exited { exit_code, signal }) => {
                        let had_trigger = {
                            let mut watcher = self.watcher.lock().await;
                            let had = watcher.current().is_some();
                            watcher.reset();
                            had
                        };
                        if had_trigger {
                            self.broadcast(&ServerMessage::HideOptions).await;
                        }
                        self.broadcast(&ServerMessage::Exit { exit_code, signal }).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Fan-out lagged, {} events skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    /// Take one state snapshot and hand it to the requesting client through
    /// its own queue, recording the buffer position it covers.
    async fn admit_client(&self, admission: Admission) {
        let (state, last_seq) = self.state_message().await;
        let text = match serde_json::to_string(&state) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Failed to serialize snapshot: {}", e);
                return;
            }
        };

        match admission {
            Admission::Join { addr, tx } => {
                let _ = tx.send(Message::Text(text));
                self.clients.write().await.insert(
                    addr,
                    Client {
                        tx,
                        joined_seq: last_seq,
                    },
                );
            }
            Admission::Refresh { addr } => {
                let mut clients = self.clients.write().await;
                if let Some(client) = clients.get_mut(&addr) {
                    client.joined_seq = last_seq;
                    let _ = client.tx.send(Message::Text(text));
                }
            }
        }
    }

    async fn broadcast(&self, msg: &ServerMessage) {
        let text = match serde_json::to_string(msg) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Failed to serialize broadcast: {}", e);
                return;
            }
        };
        let clients = self.clients.read().await;
        for client in clients.values() {
            let _ = client.tx.send(Message::Text(text.clone()));
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = accept_async(stream).await?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let ip = addr.ip();

        // Admission order: ban, connection rate, then credential.
        let admission = self.access.lock().await.admit(ip, Instant::now());
        match admission {
            Err(AdmissionDenied::Banned) => {
                return close_with(&mut ws_tx, close_reason::BANNED).await;
            }
            Err(AdmissionDenied::RateLimited) => {
                return close_with(&mut ws_tx, close_reason::RATE_LIMITED).await;
            }
            Ok(()) => {}
        }

        if !self.await_hello(&mut ws_rx).await {
            return close_with(&mut ws_tx, close_reason::UNAUTHORIZED).await;
        }

        tracing::info!("Client connected: {}", addr);

        // Registration and the full context snapshot go through the fan-out
        // task; the snapshot arrives as the first message on the queue.
        let (client_tx, mut client_rx) = mpsc::unbounded_channel::<Message>();
        if self
            .admissions
            .send(Admission::Join {
                addr,
                tx: client_tx,
            })
            .is_err()
        {
            return Ok(());
        }

        let mut throttle = MessageThrottle::new(&self.config);

        loop {
            tokio::select! {
                // Broadcast queue for this client
                Some(msg) = client_rx.recv() => {
                    if ws_tx.send(msg).await.is_err() {
                        break;
                    }
                }

                // Inbound messages
                result = ws_rx.next() => {
                    match result {
                        Some(Ok(Message::Text(text))) => {
                            // Size ceiling applies before any parsing.
                            if text.len() > self.config.max_message_bytes {
                                let _ = close_with(&mut ws_tx, close_reason::TOO_LARGE).await;
                                break;
                            }
                            match throttle.check(Instant::now()) {
                                ThrottleVerdict::Allow => {}
                                ThrottleVerdict::Drop => {
                                    tracing::debug!("Rate limit: dropping message from {}", addr);
                                    continue;
                                }
                                ThrottleVerdict::CloseAndBan => {
                                    tracing::warn!("Banning {} after repeated rate violations", ip);
                                    self.access.lock().await.ban(ip, Instant::now());
                                    let _ = close_with(&mut ws_tx, close_reason::RATE_LIMITED).await;
                                    break;
                                }
                            }
                            if self.handle_client_message(&text, addr, &mut ws_tx).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Binary(data))) => {
                            if data.len() > self.config.max_message_bytes {
                                let _ = close_with(&mut ws_tx, close_reason::TOO_LARGE).await;
                                break;
                            }
                            // Control messages are JSON text frames only.
                            tracing::debug!("Ignoring binary frame from {}", addr);
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = ws_tx.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            tracing::debug!("WebSocket error from {}: {}", addr, e);
                            break;
                        }
                        _ => {}
                    }
                }
            }
        }

        // Only the connection goes away; address-keyed abuse state persists.
        self.clients.write().await.remove(&addr);
        tracing::info!("Client disconnected: {}", addr);

        Ok(())
    }

    /// First message must be a `hello` with a valid credential, within the
    /// deadline. Anything else fails admission.
    async fn await_hello(&self, ws_rx: &mut WsStream) -> bool {
        let first = tokio::time::timeout(HELLO_DEADLINE, ws_rx.next()).await;
        let Ok(Some(Ok(Message::Text(text)))) = first else {
            return false;
        };
        if text.len() > self.config.max_message_bytes {
            return false;
        }
        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Hello { token }) => self.authorizer.is_authorized(&token),
            _ => false,
        }
    }

    async fn handle_client_message(
        &self,
        text: &str,
        addr: SocketAddr,
        ws_tx: &mut WsSink,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let msg = match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => msg,
            Err(e) => {
                // Malformed payloads are dropped; they never tear down the
                // connection or the session.
                tracing::debug!("Dropping malformed message: {}", e);
                return Ok(());
            }
        };

        match msg {
            ClientMessage::Hello { .. } => {
                // Already authenticated; repeated hellos are harmless.
            }
            ClientMessage::Start { args, working_dir } => {
                let spec = LaunchSpec {
                    command: self.command.clone(),
                    args,
                    working_dir: working_dir.map(PathBuf::from),
                    env: vec![],
                };
                if let Err(e) = self.session.start(self.source.as_ref(), spec).await {
                    tracing::warn!("Start rejected: {}", e);
                    let error = ServerMessage::Error {
                        code: e.code().to_string(),
                        message: e.to_string(),
                    };
                    if matches!(e, EngineError::Spawn(_)) {
                        // Spawn failures concern every viewer.
                        self.broadcast(&error).await;
                    } else {
                        send(ws_tx, &error).await?;
                    }
                }
            }
            ClientMessage::Input { data } => {
                let Ok(bytes) = BASE64.decode(&data) else {
                    tracing::debug!("Dropping input with invalid base64");
                    return Ok(());
                };
                match self.session.write(&bytes).await {
                    Ok(()) => {
                        if bytes.contains(&b'\r') {
                            // The operator answered: re-arm detection and the
                            // notification debounce for the next prompt.
                            let had_trigger = {
                                let mut watcher = self.watcher.lock().await;
                                let had = watcher.current().is_some();
                                watcher.reset();
                                had
                            };
                            self.notifier.reset_debounce();
                            if had_trigger {
                                self.broadcast(&ServerMessage::HideOptions).await;
                            }
                        }
                    }
                    Err(e) => {
                        send(
                            ws_tx,
                            &ServerMessage::Error {
                                code: e.code().to_string(),
                                message: e.to_string(),
                            },
                        )
                        .await?;
                    }
                }
            }
            ClientMessage::Resize { cols, rows } => {
                if let Err(e) = self.session.resize(cols, rows).await {
                    tracing::debug!("Resize failed: {}", e);
                }
            }
            ClientMessage::Stop => {
                if let Err(e) = self.session.kill().await {
                    send(
                        ws_tx,
                        &ServerMessage::Error {
                            code: e.code().to_string(),
                            message: e.to_string(),
                        },
                    )
                    .await?;
                }
            }
            ClientMessage::GetState => {
                // Served by the fan-out task through the client's queue, so
                // the snapshot stays ordered against streamed output.
                let _ = self.admissions.send(Admission::Refresh { addr });
            }
            ClientMessage::Ping => {
                send(ws_tx, &ServerMessage::Pong).await?;
            }
        }

        Ok(())
    }

    async fn state_message(&self) -> (ServerMessage, u64) {
        let snap = self.session.snapshot().await;
        let trigger = self.watcher.lock().await.current().map(trigger_info);
        let msg = ServerMessage::State {
            running: snap.running,
            exit_code: snap.exit_code,
            buffer: BASE64.encode(&snap.buffer),
            trigger,
        };
        (msg, snap.last_seq)
    }
}

fn trigger_info(trigger: &Trigger) -> TriggerInfo {
    TriggerInfo {
        prompt: trigger.prompt.clone(),
        choices: trigger.choices.clone(),
        detected_at: trigger.detected_at.to_rfc3339(),
    }
}

async fn send(
    ws_tx: &mut WsSink,
    msg: &ServerMessage,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    ws_tx
        .send(Message::Text(serde_json::to_string(msg)?))
        .await?;
    Ok(())
}

/// Force-close with a distinct reason code. Send errors are ignored; the
/// peer may already be gone.
async fn close_with(
    ws_tx: &mut WsSink,
    reason: &'static str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let code = if reason == close_reason::TOO_LARGE {
        CloseCode::Size
    } else {
        CloseCode::Policy
    };
    let _ = ws_tx
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
    let _ = ws_tx.close().await;
    Ok(())
}
