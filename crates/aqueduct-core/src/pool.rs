//! The coordinator: owns every node and session, routes node events, and is
//! the only entry point for join/leave/assignment traffic.
//!
//! All map mutations funnel through here; components below it (nodes,
//! sessions, pending joins) never reach back into the maps themselves.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use aqueduct_model::{IncomingPayload, VoiceServerUpdate};

use crate::config::{NodeConfig, PoolConfig};
use crate::error::JoinError;
use crate::failover::FailoverScheduler;
use crate::gateway::Gateway;
use crate::node::{NodeEvent, NodeIdentity, NodeMessage, VoiceNode};
use crate::pending::{PendingJoin, PendingJoinRegistry};
use crate::region;
use crate::session::{PlayOptions, Session, SessionEvent};

/// Per-join options.
#[derive(Debug, Clone, Default)]
pub struct JoinOptions {
    pub self_mute: bool,
    pub self_deaf: bool,
    /// Prefer nodes in this region.
    pub region: Option<String>,
    /// Pin the join to one node by `host:port` address.
    pub node: Option<String>,
}

/// A voice-server assignment delivered by the host's shard layer.
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceServerAssignment {
    pub guild_id: String,
    /// The chat platform's voice session id for our user.
    pub session_id: String,
    pub token: String,
    pub endpoint: Option<String>,
}

#[derive(Clone)]
pub struct NodePool {
    inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    config: PoolConfig,
    regions: std::collections::HashMap<String, Vec<String>>,
    gateway: Arc<dyn Gateway>,
    nodes: DashMap<String, VoiceNode>,
    sessions: DashMap<String, Session>,
    pending: PendingJoinRegistry,
    failover: FailoverScheduler,
    events_tx: mpsc::UnboundedSender<NodeMessage>,
}

impl NodePool {
    /// Build the pool and start connecting to every configured node.
    /// Must be called within a tokio runtime.
    pub fn new(config: PoolConfig, nodes: Vec<NodeConfig>, gateway: Arc<dyn Gateway>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let regions = config.regions.clone().unwrap_or_else(region::default_regions);
        let failover = FailoverScheduler::new(
            config.failover_limit,
            Duration::from_millis(config.failover_rate_ms),
        );
        let inner = Arc::new(PoolInner {
            config,
            regions,
            gateway,
            nodes: DashMap::new(),
            sessions: DashMap::new(),
            pending: PendingJoinRegistry::default(),
            failover,
            events_tx,
        });
        tokio::spawn(route_events(Arc::downgrade(&inner), events_rx));

        let pool = Self { inner };
        for node_config in nodes {
            pool.create_node(node_config);
        }
        pool
    }

    pub(crate) fn from_inner(inner: Arc<PoolInner>) -> Self {
        Self { inner }
    }

    /// Add a node to the pool and start its connection.
    pub fn create_node(&self, config: NodeConfig) -> VoiceNode {
        let identity = NodeIdentity {
            user_id: self.inner.config.user_id.clone(),
            shard_count: self.inner.config.shard_count,
        };
        let node = VoiceNode::new(config, identity, self.inner.events_tx.clone());
        node.connect();
        self.inner.nodes.insert(node.address().to_string(), node.clone());
        node
    }

    /// Destroy and drop a node. Its sessions are migrated exactly as if the
    /// node had died.
    pub fn remove_node(&self, address: &str) {
        let Some((_, node)) = self.inner.nodes.remove(address) else {
            return;
        };
        node.destroy();
        self.handle_node_down(address);
    }

    pub fn node(&self, address: &str) -> Option<VoiceNode> {
        self.inner.nodes.get(address).map(|entry| entry.value().clone())
    }

    pub fn nodes(&self) -> Vec<VoiceNode> {
        self.inner.nodes.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn session(&self, guild_id: &str) -> Option<Session> {
        self.inner.sessions.get(guild_id).map(|entry| entry.value().clone())
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.inner.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Whether a join for this guild is still awaiting its assignment.
    pub fn has_pending_join(&self, guild_id: &str) -> bool {
        self.inner.pending.contains(guild_id)
    }

    /// Join a voice channel. Resolves once the session is ready, or fails
    /// with a [`JoinError`]. A guild with a ready session on the same
    /// channel resolves immediately; a different channel becomes a channel
    /// switch on the existing session.
    pub async fn join(
        &self,
        guild_id: &str,
        channel_id: &str,
        options: JoinOptions,
    ) -> Result<Session, JoinError> {
        self.join_inner(guild_id, channel_id, options, None).await
    }

    async fn join_inner(
        &self,
        guild_id: &str,
        channel_id: &str,
        options: JoinOptions,
        existing: Option<Session>,
    ) -> Result<Session, JoinError> {
        if existing.is_none() {
            if let Some(session) = self.session(guild_id) {
                if session.is_ready() {
                    if session.channel_id() == channel_id {
                        return Ok(session);
                    }
                    session
                        .switch_channel(channel_id, true)
                        .await
                        .map_err(|err| JoinError::Gateway(err.to_string()))?;
                    return Ok(session);
                }
            }
        }

        let node = match &options.node {
            Some(address) => self
                .node(address)
                .filter(VoiceNode::is_available)
                .ok_or(JoinError::NoAvailableNodes)?,
            None => self
                .best_node(options.region.as_deref())
                .ok_or(JoinError::NoAvailableNodes)?,
        };
        let pinned = options.node.is_some() || options.region.is_some();

        let (rx, token) =
            self.register_pending(guild_id, channel_id, node, existing, options.clone(), pinned);

        if let Err(err) = self
            .inner
            .gateway
            .voice_state_update(guild_id, Some(channel_id), options.self_mute, options.self_deaf)
            .await
        {
            // A newer join may have displaced this entry while the gateway
            // call was in flight; only our own entry gets the failure.
            if let Some(pending) = self.inner.pending.take_if(guild_id, token) {
                pending.reject(JoinError::Gateway(err.to_string()));
            }
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(JoinError::Disconnected(None)),
        }
    }

    fn register_pending(
        &self,
        guild_id: &str,
        channel_id: &str,
        node: VoiceNode,
        session: Option<Session>,
        options: JoinOptions,
        pinned: bool,
    ) -> (oneshot::Receiver<Result<Session, JoinError>>, u64) {
        let (tx, rx) = oneshot::channel();
        let token = self.inner.pending.next_token();

        let weak = Arc::downgrade(&self.inner);
        let guild = guild_id.to_string();
        let timeout = Duration::from_millis(self.inner.config.join_timeout_ms);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else { return };
            if let Some(pending) = inner.pending.take_if(&guild, token) {
                warn!(guild = %guild, "voice connection timeout");
                pending.reject(JoinError::Timeout);
            }
        });

        let pending = PendingJoin::new(
            channel_id.to_string(),
            node,
            session,
            options,
            pinned,
            token,
            tx,
            timer,
        );
        if let Some(superseded) = self.inner.pending.insert(guild_id, pending) {
            superseded.reject(JoinError::Disconnected(Some(
                "superseded by a newer join".to_string(),
            )));
        }
        (rx, token)
    }

    /// Leave a guild's voice channel and drop its session. Best effort;
    /// a guild without a session is a no-op.
    pub async fn leave(&self, guild_id: &str) {
        if let Some(pending) = self.inner.pending.take(guild_id) {
            pending.reject(JoinError::Disconnected(Some("left".to_string())));
        }
        let Some((_, session)) = self.inner.sessions.remove(guild_id) else {
            return;
        };
        if let Err(err) = self
            .inner
            .gateway
            .voice_state_update(guild_id, None, false, false)
            .await
        {
            warn!(guild = %guild_id, error = %err, "failed to send voice-state leave");
        }
        session.disconnect(None);
    }

    /// Reconcile a voice-server assignment with the pending join that
    /// requested it (or, absent one, re-handshake a live session whose
    /// voice server moved).
    pub async fn voice_server_update(&self, assignment: VoiceServerAssignment) {
        let guild_id = assignment.guild_id.clone();
        let Some(pending) = self.inner.pending.take(&guild_id) else {
            if let Some(session) = self.session(&guild_id) {
                debug!(guild = %guild_id, "re-handshaking session after voice-server move");
                session.connect(
                    assignment.session_id,
                    VoiceServerUpdate {
                        token: assignment.token,
                        guild_id,
                        endpoint: assignment.endpoint,
                    },
                );
            } else {
                warn!(guild = %guild_id, "voice-server assignment for unknown guild");
            }
            return;
        };
        pending.cancel_timer();

        if pending.channel_id.is_empty() {
            pending.reject(JoinError::InvalidChannel);
            return;
        }

        // Joins without an explicit node or region preference are rebound to
        // the best node for the endpoint's region, now that we know it.
        let mut node = pending.node.clone();
        if !pending.pinned {
            if let Some(endpoint) = assignment.endpoint.as_deref() {
                let endpoint_region = self.classify_endpoint(endpoint);
                if let Some(better) = self.best_node(Some(&endpoint_region)) {
                    node = better;
                }
            }
        }

        let session = match pending.session.clone() {
            Some(existing) => {
                existing.rebind(node, &pending.channel_id);
                existing
            }
            None => Session::new(
                guild_id.clone(),
                pending.channel_id.clone(),
                node,
                self.inner.gateway.shard_id(&guild_id),
                Arc::clone(&self.inner.gateway),
                Arc::downgrade(&self.inner),
                &pending.options,
            ),
        };
        self.inner.sessions.insert(guild_id.clone(), session.clone());

        let mut events = session.subscribe();
        session.connect(
            assignment.session_id,
            VoiceServerUpdate {
                token: assignment.token,
                guild_id,
                endpoint: assignment.endpoint,
            },
        );

        // One-shot arbitration: ready resolves, disconnect rejects,
        // whichever fires first settles the waiter.
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::Ready) => {
                        pending.resolve(session);
                        break;
                    }
                    Ok(SessionEvent::Disconnect { reason }) => {
                        pending.reject(JoinError::Disconnected(reason));
                        break;
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        pending.reject(JoinError::Disconnected(None));
                        break;
                    }
                }
            }
        });
    }

    /// The host signals a shard came (back) up: re-sync every session on
    /// that shard without a visible channel leave.
    pub fn shard_ready(&self, shard_id: u64) {
        let affected: Vec<Session> = self
            .inner
            .sessions
            .iter()
            .filter(|entry| entry.shard_id() == shard_id)
            .map(|entry| entry.value().clone())
            .collect();
        if affected.is_empty() {
            return;
        }
        info!(shard_id, count = affected.len(), "shard ready; re-syncing sessions");
        for session in affected {
            self.queue_migration(session, false);
        }
    }

    pub(crate) fn queue_migration(&self, session: Session, leave_channel: bool) {
        let inner = Arc::clone(&self.inner);
        self.inner
            .failover
            .queue(async move { migrate(inner, session, leave_channel).await });
    }

    fn handle_node_down(&self, address: &str) {
        let affected: Vec<Session> = self
            .inner
            .sessions
            .iter()
            .filter(|entry| entry.node().address() == address)
            .map(|entry| entry.value().clone())
            .collect();
        if affected.is_empty() {
            return;
        }
        info!(node = address, count = affected.len(), "migrating sessions off lost node");
        for session in affected {
            self.queue_migration(session, true);
        }
    }

    /// Lowest-penalty available node, preferring `region` when it has at
    /// least one qualifying node.
    fn best_node(&self, region: Option<&str>) -> Option<VoiceNode> {
        let available: Vec<VoiceNode> = self
            .inner
            .nodes
            .iter()
            .filter(|entry| entry.is_available())
            .map(|entry| entry.value().clone())
            .collect();

        let candidates: Vec<&VoiceNode> = match region {
            Some(region) => {
                let regional: Vec<&VoiceNode> = available
                    .iter()
                    .filter(|node| node.region().as_deref() == Some(region))
                    .collect();
                if regional.is_empty() {
                    available.iter().collect()
                } else {
                    regional
                }
            }
            None => available.iter().collect(),
        };

        candidates
            .into_iter()
            .min_by(|a, b| {
                a.penalty()
                    .partial_cmp(&b.penalty())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
    }

    fn classify_endpoint(&self, endpoint: &str) -> String {
        region::classify(
            endpoint,
            &self.inner.regions,
            self.inner.config.default_region.as_deref(),
            |key| {
                self.inner.nodes.iter().any(|entry| {
                    entry.is_available() && entry.region().as_deref() == Some(key)
                })
            },
        )
    }
}

/// Re-home one session onto a freshly selected node, restoring playback
/// from just past where the outage cut it off.
async fn migrate(inner: Arc<PoolInner>, session: Session, leave_channel: bool) {
    let pool = NodePool::from_inner(Arc::clone(&inner));
    let guild_id = session.guild_id().to_string();
    let channel_id = session.channel_id();
    let (track, position) = session.playback_snapshot();

    session.set_suppress_end(true);
    inner.sessions.remove(&guild_id);
    session.set_not_playing();
    if leave_channel {
        if let Err(err) = inner
            .gateway
            .voice_state_update(&guild_id, None, false, false)
            .await
        {
            warn!(guild = %guild_id, error = %err, "failed to leave channel before migration");
        }
    }
    tokio::task::yield_now().await;

    let options = JoinOptions {
        self_mute: session.self_mute(),
        self_deaf: session.self_deaf(),
        region: session.node().region(),
        node: None,
    };
    match pool
        .join_inner(&guild_id, &channel_id, options, Some(session.clone()))
        .await
    {
        Ok(rejoined) => {
            if let Some(track) = track {
                rejoined.play(
                    track,
                    PlayOptions {
                        start_time: Some(position + inner.config.reconnect_threshold_ms),
                        ..PlayOptions::default()
                    },
                );
            }
            rejoined.set_suppress_end(false);
            rejoined.emit_reconnect();
            inner.sessions.insert(guild_id.clone(), rejoined);
            info!(guild = %guild_id, "session re-homed");
        }
        Err(err) => {
            warn!(guild = %guild_id, error = %err, "failed to re-home session; tearing down");
            session.set_suppress_end(false);
            session.disconnect(Some(err.to_string()));
        }
    }
}

/// Fan-in of node events. Holds only a weak pool reference so dropping the
/// last pool handle shuts the router down.
async fn route_events(inner: Weak<PoolInner>, mut rx: mpsc::UnboundedReceiver<NodeMessage>) {
    while let Some(message) = rx.recv().await {
        let Some(inner) = inner.upgrade() else { return };
        let pool = NodePool::from_inner(inner);
        match message.event {
            NodeEvent::Ready => {
                debug!(node = %message.node, "node ready");
            }
            NodeEvent::Disconnect => {
                pool.handle_node_down(&message.node);
            }
            NodeEvent::Error(error) => {
                warn!(node = %message.node, error = %error, "node error");
            }
            NodeEvent::Message(payload) => pool.route_payload(&message.node, payload),
        }
    }
}

impl NodePool {
    fn route_payload(&self, node: &str, payload: IncomingPayload) {
        match payload {
            // Load stats are cached by the node itself on receipt.
            IncomingPayload::Stats(_) => {}
            IncomingPayload::PlayerUpdate { guild_id, state } => {
                if let Some(session) = self.session(&guild_id) {
                    session.handle_player_update(state);
                }
            }
            IncomingPayload::Event(envelope) => {
                let Some(session) = self.session(&envelope.guild_id) else {
                    debug!(node, guild = %envelope.guild_id, "player event for unknown session");
                    return;
                };
                match envelope.decode() {
                    Ok(event) => session.handle_player_event(event),
                    Err(_) => warn!(
                        node,
                        guild = %envelope.guild_id,
                        kind = envelope.event_type().unwrap_or("unknown"),
                        "unhandled player event type"
                    ),
                }
            }
        }
    }
}
