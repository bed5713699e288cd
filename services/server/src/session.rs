//! Per-connection session lifecycle.
//!
//! One reader task (`consume`) and one writer task per session.  Outbound
//! traffic goes through a bounded queue; each wire write takes the wire
//! mutex, which the close path also takes, so a concurrent close suppresses
//! further writes.  Cleanup runs at most once, guarded by a compare-and-swap
//! on the stopped flag, and removes the session from every external index
//! before the socket closes.
//!
//! The session is generic over its sink and the read loop over its stream,
//! so the lifecycle is testable without a live socket; production uses the
//! two halves of a split `WebSocket`.

use crate::config::Config;
use crate::error::{ServerError, ServerResult};
use crate::pipeline::Pipeline;
use crate::session_registry::{SessionHandle, SessionRegistry};
use crate::status::StatusRegistry;
use crate::tracker::{PresenceReason, Tracker};
use arena_protocol::Envelope;
use axum::extract::ws::Message as WsMessage;
use futures_util::{Sink, SinkExt, Stream};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, mpsc, watch};
use tokio_stream::StreamExt as _;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Sink half of a session's connection.
pub trait WireSink:
    Sink<WsMessage, Error = axum::Error> + Send + Unpin + 'static
{
}
impl<T> WireSink for T where T: Sink<WsMessage, Error = axum::Error> + Send + Unpin + 'static {}

/// Stream half of a session's connection.
pub trait WireStream:
    Stream<Item = Result<WsMessage, axum::Error>> + Send + Unpin + 'static
{
}
impl<T> WireStream for T where
    T: Stream<Item = Result<WsMessage, axum::Error>> + Send + Unpin + 'static
{
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionFormat {
    Text,
    Binary,
}

impl SessionFormat {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "text" | "json" => Some(Self::Text),
            "binary" => Some(Self::Binary),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub queue_size: usize,
    pub ping_period: Duration,
    pub pong_wait: Duration,
    pub write_wait: Duration,
    pub ping_backoff_threshold: u32,
}

impl From<&Config> for SessionConfig {
    fn from(config: &Config) -> Self {
        Self {
            queue_size: config.session_queue_size,
            ping_period: config.ping_period,
            pong_wait: config.pong_wait,
            write_wait: config.write_wait,
            ping_backoff_threshold: config.ping_backoff_threshold,
        }
    }
}

/// Receiver halves handed to the writer task.
pub struct SessionTasks {
    out_rx: mpsc::Receiver<WsMessage>,
    writer_stop: watch::Receiver<bool>,
    reader_stop: watch::Receiver<bool>,
}

pub struct Session<S: WireSink> {
    id: Uuid,
    user_id: Uuid,
    username: RwLock<String>,
    vars: HashMap<String, String>,
    expiry_unix_sec: i64,
    format: SessionFormat,
    client_ip: String,
    client_port: u16,
    config: SessionConfig,

    stopped: AtomicBool,
    out_tx: mpsc::Sender<WsMessage>,
    stop_tx: watch::Sender<bool>,
    ping_reset: Notify,
    wire: Mutex<S>,

    tracker: Arc<Tracker>,
    status: Arc<StatusRegistry>,
    registry: Arc<SessionRegistry>,
}

impl<S: WireSink> Session<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SessionConfig,
        user_id: Uuid,
        username: String,
        expiry_unix_sec: i64,
        vars: HashMap<String, String>,
        format: SessionFormat,
        client_ip: String,
        client_port: u16,
        sink: S,
        tracker: Arc<Tracker>,
        status: Arc<StatusRegistry>,
        registry: Arc<SessionRegistry>,
    ) -> (Arc<Self>, SessionTasks) {
        let (out_tx, out_rx) = mpsc::channel(config.queue_size);
        let (stop_tx, writer_stop) = watch::channel(false);
        let reader_stop = stop_tx.subscribe();
        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            user_id,
            username: RwLock::new(username),
            vars,
            expiry_unix_sec,
            format,
            client_ip,
            client_port,
            config,
            stopped: AtomicBool::new(false),
            out_tx,
            stop_tx,
            ping_reset: Notify::new(),
            wire: Mutex::new(sink),
            tracker,
            status,
            registry,
        });
        (
            session,
            SessionTasks {
                out_rx,
                writer_stop,
                reader_stop,
            },
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user(&self) -> Uuid {
        self.user_id
    }

    pub fn name(&self) -> String {
        self.username.read().expect("username poisoned").clone()
    }

    pub fn set_name(&self, username: String) {
        *self.username.write().expect("username poisoned") = username;
    }

    pub fn vars(&self) -> &HashMap<String, String> {
        &self.vars
    }

    pub fn expiry(&self) -> i64 {
        self.expiry_unix_sec
    }

    pub fn wire_format(&self) -> SessionFormat {
        self.format
    }

    pub fn client_ip(&self) -> &str {
        &self.client_ip
    }

    pub fn client_port(&self) -> u16 {
        self.client_port
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn frame(&self, payload: Vec<u8>) -> Option<WsMessage> {
        match self.format {
            SessionFormat::Binary => Some(WsMessage::Binary(payload.into())),
            // Envelope payloads come out of the JSON encoder and are always
            // valid UTF-8.
            SessionFormat::Text => String::from_utf8(payload)
                .ok()
                .map(|text| WsMessage::Text(text.into())),
        }
    }

    /// Encode per this session's format and enqueue.
    pub fn send(self: &Arc<Self>, envelope: &Envelope, reliable: bool) -> ServerResult<()> {
        let payload = serde_json::to_vec(envelope)
            .map_err(|e| ServerError::internal(format!("envelope encode: {e}")))?;
        self.send_payload(payload, reliable)
    }

    /// Enqueue a pre-encoded payload.
    ///
    /// Unreliable sends are silently dropped once the queue passes the
    /// priority threshold (two thirds of capacity), keeping headroom for
    /// higher-priority traffic.  A reliable send against a full queue is a
    /// terminal condition: the session starts closing and the caller gets
    /// `resource-exhausted`.
    pub fn send_payload(self: &Arc<Self>, payload: Vec<u8>, reliable: bool) -> ServerResult<()> {
        if self.is_stopped() {
            return Ok(());
        }
        let capacity = self.out_tx.max_capacity();
        if !reliable {
            let used = capacity - self.out_tx.capacity();
            if used * 3 >= capacity * 2 {
                debug!(session_id = %self.id, "dropping unreliable message, queue above priority threshold");
                return Ok(());
            }
        }
        let Some(frame) = self.frame(payload) else {
            return Err(ServerError::internal(
                "payload is not valid utf-8 for text framing",
            ));
        };
        match self.out_tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                if reliable {
                    warn!(session_id = %self.id, user_id = %self.user_id, "outgoing queue full, closing session");
                    let session = self.clone();
                    let _ = tokio::spawn(async move {
                        session.close("outgoing queue full", Vec::new()).await;
                    });
                    Err(ServerError::ResourceExhausted(
                        "session outgoing queue full".to_owned(),
                    ))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Writer task: single owner of ordered wire writes.  Selects over the
    /// stop signal, the ping timer, ping-timer resets from the read loop,
    /// and the outgoing payload queue.
    pub fn spawn_write_loop(self: &Arc<Self>, mut tasks: SessionTasks) -> SessionReader {
        let session = self.clone();
        let reader_stop = tasks.reader_stop.clone();
        let _ = tokio::spawn(async move {
            let mut ping = tokio::time::interval(session.config.ping_period);
            ping.reset(); // first tick a full period from now
            loop {
                tokio::select! {
                    _ = tasks.writer_stop.changed() => break,
                    _ = session.ping_reset.notified() => {
                        ping.reset();
                    }
                    _ = ping.tick() => {
                        if !session.write_frame(WsMessage::Ping(Vec::new().into())).await {
                            session.close("ping write failed", Vec::new()).await;
                            break;
                        }
                    }
                    frame = tasks.out_rx.recv() => {
                        let Some(frame) = frame else { break };
                        if !session.write_frame(frame).await {
                            session.close("message write failed", Vec::new()).await;
                            break;
                        }
                    }
                }
            }
        });
        SessionReader { stop: reader_stop }
    }

    /// One guarded wire write.  Returns false when the session should die.
    async fn write_frame(&self, frame: WsMessage) -> bool {
        let mut wire = self.wire.lock().await;
        if self.is_stopped() {
            // A concurrent close won the race; drop the frame.
            return false;
        }
        match tokio::time::timeout(self.config.write_wait, wire.send(frame)).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                debug!(session_id = %self.id, error = %err, "wire write failed");
                false
            }
            Err(_) => {
                debug!(session_id = %self.id, "wire write deadline exceeded");
                false
            }
        }
    }

    /// Blocking read loop; invoked once after construction.
    ///
    /// Each read is bounded by the pong-wait deadline.  A receive counter
    /// piggybacks liveness on genuine traffic: every
    /// `ping_backoff_threshold` inbound frames push the ping timer back, so
    /// only idle connections get pinged.
    pub async fn consume<R: WireStream>(
        self: &Arc<Self>,
        mut stream: R,
        mut reader: SessionReader,
        pipeline: Arc<Pipeline>,
    ) {
        let mut receive_budget = self.config.ping_backoff_threshold;
        loop {
            let frame = tokio::select! {
                _ = reader.stop.changed() => break,
                frame = tokio::time::timeout(self.config.pong_wait, stream.next()) => frame,
            };
            let message = match frame {
                Err(_) => {
                    self.close("client unresponsive", Vec::new()).await;
                    break;
                }
                Ok(None) => {
                    self.close("connection closed by client", Vec::new()).await;
                    break;
                }
                Ok(Some(Err(err))) => {
                    debug!(session_id = %self.id, error = %err, "read error");
                    self.close("read error", Vec::new()).await;
                    break;
                }
                Ok(Some(Ok(message))) => message,
            };

            receive_budget = receive_budget.saturating_sub(1);
            if receive_budget == 0 {
                self.ping_reset.notify_one();
                receive_budget = self.config.ping_backoff_threshold;
            }

            let payload: Vec<u8> = match (message, self.format) {
                (WsMessage::Text(text), SessionFormat::Text) => text.as_bytes().to_vec(),
                (WsMessage::Binary(bytes), SessionFormat::Binary) => bytes.to_vec(),
                (WsMessage::Ping(_) | WsMessage::Pong(_), _) => continue,
                (WsMessage::Close(_), _) => {
                    self.close("close frame received", Vec::new()).await;
                    break;
                }
                (WsMessage::Text(_) | WsMessage::Binary(_), _) => {
                    self.close("frame type does not match negotiated format", Vec::new())
                        .await;
                    break;
                }
            };

            let envelope: Envelope = match serde_json::from_slice(&payload) {
                Ok(envelope) => envelope,
                Err(err) => {
                    debug!(session_id = %self.id, error = %err, "malformed envelope");
                    self.close("malformed envelope", Vec::new()).await;
                    break;
                }
            };

            let dispatch = AssertUnwindSafe(pipeline.process(self, envelope));
            if futures_util::FutureExt::catch_unwind(dispatch).await.is_err() {
                // A handler panicked.  Surface an opaque internal error and
                // tear the session down through the single cleanup path.
                let final_envelope = Envelope::new(arena_protocol::Message::Error(
                    arena_protocol::ErrorMessage {
                        code: arena_protocol::error_codes::INTERNAL.to_owned(),
                        message: "an internal error occurred".to_owned(),
                    },
                ));
                self.close("handler panic", vec![final_envelope]).await;
                break;
            }
        }
    }

    /// Idempotent teardown.  Removes the session from every external index
    /// (tracker, status followers, session registry), stops the writer, and
    /// delivers any final envelopes best-effort before the close frame.
    pub async fn close(self: &Arc<Self>, reason: &'static str, final_envelopes: Vec<Envelope>) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(session_id = %self.id, user_id = %self.user_id, reason, "session closing");

        self.tracker.untrack_all(self.id, PresenceReason::Disconnect);
        self.status.unfollow_all(self.id);
        self.registry.remove(self.id);
        let _ = self.stop_tx.send(true);

        let mut wire = self.wire.lock().await;
        for envelope in final_envelopes {
            let Ok(payload) = serde_json::to_vec(&envelope) else {
                continue;
            };
            let Some(frame) = self.frame(payload) else {
                continue;
            };
            let _ = tokio::time::timeout(self.config.write_wait, wire.send(frame)).await;
        }
        let _ =
            tokio::time::timeout(self.config.write_wait, wire.send(WsMessage::Close(None))).await;
    }
}

/// Reader-side stop handle, produced by `spawn_write_loop`.
pub struct SessionReader {
    stop: watch::Receiver<bool>,
}

impl<S: WireSink> SessionHandle for Session<S> {
    fn id(&self) -> Uuid {
        self.id
    }

    fn user_id(&self) -> Uuid {
        self.user_id
    }

    fn username(&self) -> String {
        self.name()
    }

    fn send_bytes(self: Arc<Self>, payload: Vec<u8>, reliable: bool) -> ServerResult<()> {
        self.send_payload(payload, reliable)
    }

    fn initiate_close(self: Arc<Self>, reason: &'static str) {
        let _ = tokio::spawn(async move {
            self.close(reason, Vec::new()).await;
        });
    }
}
