//! One persistent socket to a remote audio node.
//!
//! A node is owned by the pool. Its connection task dials, pumps messages,
//! and on loss re-dials with a quadratic backoff. Sends without a live
//! socket are dropped silently; ordering and queuing are the session's job.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use aqueduct_model::{IncomingPayload, NodeStats, OutgoingPayload};

use crate::config::NodeConfig;
use crate::error::NodeError;

type NodeSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection state as reported to callers. `Draining` is terminal-soft:
/// the socket may still be up, but the node accepts no new sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Disconnected,
    Connected,
    Draining,
}

/// Bot identity presented in the node handshake headers.
#[derive(Debug, Clone)]
pub(crate) struct NodeIdentity {
    pub user_id: String,
    pub shard_count: u64,
}

/// What a node reports to the pool's event router.
#[derive(Debug)]
pub(crate) enum NodeEvent {
    Ready,
    Disconnect,
    Message(IncomingPayload),
    Error(String),
}

#[derive(Debug)]
pub(crate) struct NodeMessage {
    pub node: String,
    pub event: NodeEvent,
}

#[derive(Clone)]
pub struct VoiceNode {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    config: NodeConfig,
    address: String,
    identity: NodeIdentity,
    connected: AtomicBool,
    draining: AtomicBool,
    destroyed: AtomicBool,
    retries: AtomicU32,
    stats: Mutex<Option<NodeStats>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    events: mpsc::UnboundedSender<NodeMessage>,
}

/// Delay before reconnect attempt `attempt` (1-based):
/// 25s, 36s, 49s, 64s, 81s, then 100s for every further attempt.
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    let step = attempt.saturating_sub(1).min(5) as u64 + 5;
    Duration::from_millis(step * step * 1000)
}

impl VoiceNode {
    pub(crate) fn new(
        config: NodeConfig,
        identity: NodeIdentity,
        events: mpsc::UnboundedSender<NodeMessage>,
    ) -> Self {
        let address = config.address();
        Self {
            inner: Arc::new(NodeInner {
                config,
                address,
                identity,
                connected: AtomicBool::new(false),
                draining: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                retries: AtomicU32::new(0),
                stats: Mutex::new(None),
                outbound: Mutex::new(None),
                task: Mutex::new(None),
                events,
            }),
        }
    }

    /// `host:port`, the node's identity within the pool.
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn region(&self) -> Option<String> {
        self.inner.config.region.clone()
    }

    pub fn state(&self) -> NodeState {
        if self.inner.draining.load(Ordering::SeqCst) {
            NodeState::Draining
        } else if self.inner.connected.load(Ordering::SeqCst) {
            NodeState::Connected
        } else {
            NodeState::Disconnected
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::SeqCst)
    }

    /// Connected and not draining: eligible for new sessions.
    pub fn is_available(&self) -> bool {
        self.is_connected() && !self.is_draining()
    }

    /// Mark the node as draining. Existing sessions should be evacuated by
    /// the operator; new sessions will not be routed here.
    pub fn set_draining(&self, draining: bool) {
        self.inner.draining.store(draining, Ordering::SeqCst);
    }

    pub fn stats(&self) -> Option<NodeStats> {
        self.inner.stats.lock().expect("stats lock").clone()
    }

    /// Load-selection key; 0.0 until the node has reported stats.
    pub fn penalty(&self) -> f64 {
        self.stats().map(|stats| stats.penalty()).unwrap_or(0.0)
    }

    /// Spawn the connection task. A no-op while one is already running;
    /// use [`reconnect`](Self::reconnect) to force a redial.
    pub(crate) fn connect(&self) {
        let mut task = self.inner.task.lock().expect("task lock");
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *task = Some(tokio::spawn(run(inner)));
    }

    /// Tear down the current socket (if any) and dial again immediately.
    pub fn reconnect(&self) {
        self.halt();
        self.connect();
    }

    /// Serialize and hand the payload to the writer. Serialization failures
    /// surface as a node error event; without a live socket the payload is
    /// dropped silently.
    pub(crate) fn send(&self, payload: &OutgoingPayload) {
        let text = match serde_json::to_string(payload) {
            Ok(text) => text,
            Err(err) => {
                warn!(node = %self.inner.address, error = %err, "failed to encode payload");
                self.inner
                    .emit(NodeEvent::Error(format!("payload encode error: {err}")));
                return;
            }
        };
        let outbound = self.inner.outbound.lock().expect("outbound lock");
        match outbound.as_ref() {
            Some(tx) => {
                let _ = tx.send(Message::text(text));
            }
            None => {
                debug!(node = %self.inner.address, op = payload.op(), "dropping payload: no live socket");
            }
        }
    }

    /// Permanently shut the node down. The connection task is aborted before
    /// the socket handle is dropped, so destruction never feeds back into
    /// the disconnect/reconnect machinery.
    pub(crate) fn destroy(&self) {
        self.inner.destroyed.store(true, Ordering::SeqCst);
        self.halt();
    }

    fn halt(&self) {
        if let Some(handle) = self.inner.task.lock().expect("task lock").take() {
            handle.abort();
        }
        *self.inner.outbound.lock().expect("outbound lock") = None;
        self.inner.connected.store(false, Ordering::SeqCst);
    }
}

impl NodeInner {
    fn emit(&self, event: NodeEvent) {
        let _ = self.events.send(NodeMessage {
            node: self.address.clone(),
            event,
        });
    }

    fn handshake_request(
        &self,
    ) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, NodeError> {
        let mut request = self.config.ws_url().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert("Authorization", HeaderValue::from_str(&self.config.password)?);
        headers.insert("Num-Shards", HeaderValue::from(self.identity.shard_count));
        headers.insert("User-Id", HeaderValue::from_str(&self.identity.user_id)?);
        Ok(request)
    }
}

/// Connection owner: dial, pump, back off, repeat. Exactly one `Disconnect`
/// is emitted per socket loss because loss and backoff run sequentially in
/// this single task.
async fn run(inner: Arc<NodeInner>) {
    loop {
        match dial(&inner).await {
            Ok(socket) => {
                inner.retries.store(0, Ordering::SeqCst);
                inner.connected.store(true, Ordering::SeqCst);
                info!(node = %inner.address, "audio node connected");
                inner.emit(NodeEvent::Ready);

                let (sink, stream) = socket.split();
                let (tx, rx) = mpsc::unbounded_channel();
                *inner.outbound.lock().expect("outbound lock") = Some(tx);
                let writer = tokio::spawn(write_loop(sink, rx));

                read_loop(&inner, stream).await;

                // Dropping the sender ends the writer, which closes the socket.
                *inner.outbound.lock().expect("outbound lock") = None;
                let _ = writer.await;
                inner.connected.store(false, Ordering::SeqCst);
                warn!(node = %inner.address, "audio node disconnected");
                inner.emit(NodeEvent::Disconnect);
            }
            Err(err) => {
                warn!(node = %inner.address, error = %err, "audio node dial failed");
                inner.emit(NodeEvent::Error(err.to_string()));
            }
        }

        if inner.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let attempt = inner.retries.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = backoff_delay(attempt);
        debug!(node = %inner.address, attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        tokio::time::sleep(delay).await;
    }
}

async fn dial(inner: &Arc<NodeInner>) -> Result<NodeSocket, NodeError> {
    let request = inner.handshake_request()?;
    let (socket, _response) = connect_async(request).await?;
    Ok(socket)
}

async fn write_loop(
    mut sink: SplitSink<NodeSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = rx.recv().await {
        if sink.send(message).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(inner: &Arc<NodeInner>, mut stream: SplitStream<NodeSocket>) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<IncomingPayload>(&text) {
                Ok(payload) => {
                    if let IncomingPayload::Stats(stats) = &payload {
                        *inner.stats.lock().expect("stats lock") = Some(stats.clone());
                    }
                    inner.emit(NodeEvent::Message(payload));
                }
                Err(err) => {
                    warn!(node = %inner.address, error = %err, "malformed node message");
                    inner.emit(NodeEvent::Error(format!("malformed node message: {err}")));
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                inner.emit(NodeEvent::Error(err.to_string()));
                break;
            }
        }
    }
}
