//! One guild's voice connection.
//!
//! A session serializes its control commands into a FIFO so the node
//! observes them in exactly the order the caller issued them; the remote
//! side processes commands in receipt order, and an out-of-order `play`
//! versus `stop` would corrupt playback state. Recovery is never attempted
//! here — the pool migrates sessions, sessions just play.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use tokio::sync::broadcast;
use tracing::debug;

use aqueduct_model::{OutgoingPayload, PlayerEvent, PlayerState, VoiceServerUpdate, TRACK_END_REPLACED};

use crate::gateway::Gateway;
use crate::node::VoiceNode;
use crate::pool::{JoinOptions, NodePool, PoolInner};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle events a session broadcasts to its subscribers.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A voice-server assignment arrived and the handshake was sent.
    Connect { channel_id: String },
    /// The session is usable; joins resolve on this.
    Ready,
    Disconnect { reason: Option<String> },
    TrackEnd { track: Option<String>, reason: String },
    TrackError { track: Option<String>, error: String },
    TrackStuck { track: Option<String>, threshold_ms: Option<u64> },
    /// The session was re-homed onto a new node after a failure.
    Reconnect,
}

/// Options for [`Session::play`].
#[derive(Debug, Clone, Default)]
pub struct PlayOptions {
    /// Start position in milliseconds.
    pub start_time: Option<u64>,
    /// Stop position in milliseconds.
    pub end_time: Option<u64>,
    /// Ask the node to keep the current track if one is playing.
    pub no_replace: bool,
}

#[derive(Debug, Default)]
struct Playback {
    track: Option<String>,
    last_track: Option<String>,
    playing: bool,
    paused: bool,
    volume: Option<i64>,
    /// Last known position, advanced by `position_at` while playing.
    position: u64,
    position_at: Option<Instant>,
    /// Node-reported clock from the latest playerUpdate.
    time: i64,
}

#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    guild_id: String,
    shard_id: u64,
    self_mute: bool,
    self_deaf: bool,
    channel_id: Mutex<String>,
    node: Mutex<VoiceNode>,
    gateway: Arc<dyn Gateway>,
    pool: Weak<PoolInner>,
    playback: Mutex<Playback>,
    queue: Mutex<VecDeque<OutgoingPayload>>,
    voice: Mutex<Option<(String, VoiceServerUpdate)>>,
    ready: AtomicBool,
    /// Gates `TrackEnd` while the pool migrates this session, so callers do
    /// not observe a spurious end for a track that will resume.
    suppress_end: AtomicBool,
    events: broadcast::Sender<SessionEvent>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        guild_id: String,
        channel_id: String,
        node: VoiceNode,
        shard_id: u64,
        gateway: Arc<dyn Gateway>,
        pool: Weak<PoolInner>,
        options: &JoinOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(SessionInner {
                guild_id,
                shard_id,
                self_mute: options.self_mute,
                self_deaf: options.self_deaf,
                channel_id: Mutex::new(channel_id),
                node: Mutex::new(node),
                gateway,
                pool,
                playback: Mutex::new(Playback::default()),
                queue: Mutex::new(VecDeque::new()),
                voice: Mutex::new(None),
                ready: AtomicBool::new(false),
                suppress_end: AtomicBool::new(false),
                events,
            }),
        }
    }

    pub fn guild_id(&self) -> &str {
        &self.inner.guild_id
    }

    pub fn shard_id(&self) -> u64 {
        self.inner.shard_id
    }

    pub fn channel_id(&self) -> String {
        self.inner.channel_id.lock().expect("channel lock").clone()
    }

    /// The node currently serving this session. The pool is the owner of
    /// record; this is a working reference, rebound on migration.
    pub fn node(&self) -> VoiceNode {
        self.inner.node.lock().expect("node lock").clone()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    pub fn is_playing(&self) -> bool {
        self.inner.playback.lock().expect("playback lock").playing
    }

    pub fn is_paused(&self) -> bool {
        self.inner.playback.lock().expect("playback lock").paused
    }

    pub fn track(&self) -> Option<String> {
        self.inner.playback.lock().expect("playback lock").track.clone()
    }

    pub fn last_track(&self) -> Option<String> {
        self.inner
            .playback
            .lock()
            .expect("playback lock")
            .last_track
            .clone()
    }

    /// Current playback position in milliseconds: the last known position
    /// plus elapsed wall time while playing.
    pub fn position(&self) -> u64 {
        let playback = self.inner.playback.lock().expect("playback lock");
        match (playback.playing, playback.position_at) {
            (true, Some(at)) => playback.position + at.elapsed().as_millis() as u64,
            _ => playback.position,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Start a track. On a draining node this does not send anything; the
    /// session is handed to the pool's migration path and the track resumes
    /// on the replacement node.
    pub fn play(&self, track: impl Into<String>, options: PlayOptions) {
        let track = track.into();
        let node = self.node();
        if node.is_draining() {
            {
                let mut playback = self.inner.playback.lock().expect("playback lock");
                playback.track = Some(track);
                playback.position = 0;
                playback.position_at = None;
            }
            if let Some(pool) = self.inner.pool.upgrade() {
                debug!(guild = %self.inner.guild_id, node = node.address(), "play on draining node; migrating");
                NodePool::from_inner(pool).queue_migration(self.clone(), false);
            }
            return;
        }

        {
            let mut playback = self.inner.playback.lock().expect("playback lock");
            playback.track = Some(track.clone());
            playback.playing = !playback.paused;
            playback.position = options.start_time.unwrap_or(0);
            playback.position_at = Some(Instant::now());
        }
        self.enqueue(OutgoingPayload::Play {
            guild_id: self.inner.guild_id.clone(),
            track,
            start_time: options.start_time,
            end_time: options.end_time,
            no_replace: options.no_replace.then_some(true),
            pause: None,
        });
    }

    /// Stop playback, retaining the stopped track as `last_track`.
    pub fn stop(&self) {
        {
            let mut playback = self.inner.playback.lock().expect("playback lock");
            playback.last_track = playback.track.take();
            playback.playing = false;
            playback.position_at = None;
        }
        self.enqueue(OutgoingPayload::Stop {
            guild_id: self.inner.guild_id.clone(),
        });
    }

    pub fn set_pause(&self, pause: bool) {
        {
            let mut playback = self.inner.playback.lock().expect("playback lock");
            playback.paused = pause;
            playback.playing = !pause && playback.track.is_some();
            if pause {
                // Freeze the position while paused.
                if let Some(at) = playback.position_at.take() {
                    playback.position += at.elapsed().as_millis() as u64;
                }
            } else if playback.playing {
                playback.position_at = Some(Instant::now());
            }
        }
        self.enqueue(OutgoingPayload::Pause {
            guild_id: self.inner.guild_id.clone(),
            pause,
        });
    }

    /// No-op when already paused.
    pub fn pause(&self) {
        if !self.is_paused() {
            self.set_pause(true);
        }
    }

    /// No-op when not paused.
    pub fn resume(&self) {
        if self.is_paused() {
            self.set_pause(false);
        }
    }

    pub fn seek(&self, position: u64) {
        {
            let mut playback = self.inner.playback.lock().expect("playback lock");
            playback.position = position;
            if playback.playing {
                playback.position_at = Some(Instant::now());
            }
        }
        self.enqueue(OutgoingPayload::Seek {
            guild_id: self.inner.guild_id.clone(),
            position,
        });
    }

    pub fn set_volume(&self, volume: i64) {
        self.inner.playback.lock().expect("playback lock").volume = Some(volume);
        self.enqueue(OutgoingPayload::Volume {
            guild_id: self.inner.guild_id.clone(),
            volume,
        });
    }

    pub fn set_equalizer(&self, bands: Vec<aqueduct_model::EqualizerBand>) {
        self.enqueue(OutgoingPayload::Equalizer {
            guild_id: self.inner.guild_id.clone(),
            bands,
        });
    }

    /// Tear the session down on the node side and notify subscribers. A
    /// paused session is resumed first so the remote player is not left
    /// paused across teardown.
    pub fn disconnect(&self, reason: Option<String>) {
        self.resume();
        self.enqueue(OutgoingPayload::Destroy {
            guild_id: self.inner.guild_id.clone(),
        });
        self.enqueue(OutgoingPayload::Stop {
            guild_id: self.inner.guild_id.clone(),
        });
        {
            let mut playback = self.inner.playback.lock().expect("playback lock");
            playback.last_track = playback.track.take();
            playback.playing = false;
            playback.position_at = None;
        }
        self.inner.ready.store(false, Ordering::SeqCst);
        let _ = self.inner.events.send(SessionEvent::Disconnect { reason });
    }

    /// Move to another voice channel. `reactive` asks the shard layer to
    /// send the voice-state update; a non-reactive switch only records the
    /// new channel (used when the update originated elsewhere).
    pub async fn switch_channel(&self, channel_id: &str, reactive: bool) -> anyhow::Result<()> {
        {
            let mut current = self.inner.channel_id.lock().expect("channel lock");
            if *current == channel_id {
                return Ok(());
            }
            *current = channel_id.to_string();
        }
        if reactive {
            self.inner
                .gateway
                .voice_state_update(
                    &self.inner.guild_id,
                    Some(channel_id),
                    self.inner.self_mute,
                    self.inner.self_deaf,
                )
                .await?;
        }
        Ok(())
    }

    /// Complete the voice handshake with the bound node. Emits `Connect`
    /// synchronously; `Ready` fires once the event loop has yielded, so the
    /// triggering call settles before its effect is observable.
    pub(crate) fn connect(&self, session_id: String, event: VoiceServerUpdate) {
        *self.inner.voice.lock().expect("voice lock") = Some((session_id.clone(), event.clone()));
        let _ = self.inner.events.send(SessionEvent::Connect {
            channel_id: self.channel_id(),
        });
        self.enqueue(OutgoingPayload::VoiceUpdate {
            guild_id: self.inner.guild_id.clone(),
            session_id,
            event,
        });
        let session = self.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            session.inner.ready.store(true, Ordering::SeqCst);
            let _ = session.inner.events.send(SessionEvent::Ready);
        });
    }

    /// Rebind to a replacement node during migration.
    pub(crate) fn rebind(&self, node: VoiceNode, channel_id: &str) {
        *self.inner.node.lock().expect("node lock") = node;
        *self.inner.channel_id.lock().expect("channel lock") = channel_id.to_string();
        self.inner.ready.store(false, Ordering::SeqCst);
    }

    pub(crate) fn handle_player_update(&self, state: PlayerState) {
        let mut playback = self.inner.playback.lock().expect("playback lock");
        playback.time = state.time;
        if let Some(position) = state.position {
            playback.position = position;
            playback.position_at = playback.playing.then(Instant::now);
        }
    }

    pub(crate) fn handle_player_event(&self, event: PlayerEvent) {
        match event {
            PlayerEvent::TrackEndEvent { track, reason } => {
                let reason = reason.unwrap_or_default();
                {
                    let mut playback = self.inner.playback.lock().expect("playback lock");
                    // A replace is not a real end: the new play is already
                    // in flight, keep its track and position clock.
                    if reason != TRACK_END_REPLACED {
                        playback.playing = false;
                        playback.position_at = None;
                        playback.last_track = playback.track.take();
                    }
                }
                if !self.inner.suppress_end.load(Ordering::SeqCst) {
                    let _ = self.inner.events.send(SessionEvent::TrackEnd { track, reason });
                }
            }
            PlayerEvent::TrackExceptionEvent { track, error } => {
                let _ = self.inner.events.send(SessionEvent::TrackError {
                    track,
                    error: error.unwrap_or_else(|| "unknown track error".to_string()),
                });
            }
            PlayerEvent::TrackStuckEvent { track, threshold_ms } => {
                // Stuck tracks are treated as ended, not errored.
                self.stop();
                let _ = self
                    .inner
                    .events
                    .send(SessionEvent::TrackStuck { track: track.clone(), threshold_ms });
                let session = self.clone();
                tokio::spawn(async move {
                    tokio::task::yield_now().await;
                    if !session.inner.suppress_end.load(Ordering::SeqCst) {
                        let _ = session.inner.events.send(SessionEvent::TrackEnd {
                            track,
                            reason: "STUCK".to_string(),
                        });
                    }
                });
            }
        }
    }

    /// Track and position to restore after a migration.
    pub(crate) fn playback_snapshot(&self) -> (Option<String>, u64) {
        let track = self.track();
        (track, self.position())
    }

    pub(crate) fn set_suppress_end(&self, suppress: bool) {
        self.inner.suppress_end.store(suppress, Ordering::SeqCst);
    }

    pub(crate) fn set_not_playing(&self) {
        let mut playback = self.inner.playback.lock().expect("playback lock");
        if let Some(at) = playback.position_at.take() {
            playback.position += at.elapsed().as_millis() as u64;
        }
        playback.playing = false;
    }

    pub(crate) fn emit_reconnect(&self) {
        let _ = self.inner.events.send(SessionEvent::Reconnect);
    }

    pub(crate) fn self_mute(&self) -> bool {
        self.inner.self_mute
    }

    pub(crate) fn self_deaf(&self) -> bool {
        self.inner.self_deaf
    }

    /// Append to the command FIFO and drain it. The lock scope is the
    /// in-flight window: exactly one command is handed to the node at a
    /// time, in issue order, even under concurrent callers.
    fn enqueue(&self, payload: OutgoingPayload) {
        let node = self.node();
        let mut queue = self.inner.queue.lock().expect("queue lock");
        queue.push_back(payload);
        while let Some(front) = queue.front().cloned() {
            node.send(&front);
            queue.pop_front();
        }
    }
}
