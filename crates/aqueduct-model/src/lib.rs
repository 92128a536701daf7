//! Wire-protocol types for the audio-node socket.
//!
//! One persistent websocket per node carries JSON payloads tagged with an
//! `op` field. Field names on the wire are camelCase, except the raw
//! voice-server event forwarded inside `voiceUpdate`, which keeps the
//! snake_case shape it arrived with from the chat platform.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Commands sent to an audio node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum OutgoingPayload {
    VoiceUpdate {
        guild_id: String,
        session_id: String,
        event: VoiceServerUpdate,
    },
    Play {
        guild_id: String,
        track: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        start_time: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        end_time: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        no_replace: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pause: Option<bool>,
    },
    Stop {
        guild_id: String,
    },
    Pause {
        guild_id: String,
        pause: bool,
    },
    Seek {
        guild_id: String,
        position: u64,
    },
    Volume {
        guild_id: String,
        volume: i64,
    },
    Destroy {
        guild_id: String,
    },
    Equalizer {
        guild_id: String,
        bands: Vec<EqualizerBand>,
    },
}

impl OutgoingPayload {
    /// The wire value of the `op` tag, mostly useful in logs and tests.
    pub fn op(&self) -> &'static str {
        match self {
            OutgoingPayload::VoiceUpdate { .. } => "voiceUpdate",
            OutgoingPayload::Play { .. } => "play",
            OutgoingPayload::Stop { .. } => "stop",
            OutgoingPayload::Pause { .. } => "pause",
            OutgoingPayload::Seek { .. } => "seek",
            OutgoingPayload::Volume { .. } => "volume",
            OutgoingPayload::Destroy { .. } => "destroy",
            OutgoingPayload::Equalizer { .. } => "equalizer",
        }
    }
}

/// One equalizer band adjustment. `gain` ranges -0.25..=1.0.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EqualizerBand {
    pub band: u8,
    pub gain: f64,
}

/// The raw voice-server payload handed over by the chat platform, forwarded
/// verbatim so the node can complete the voice handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VoiceServerUpdate {
    pub token: String,
    pub guild_id: String,
    pub endpoint: Option<String>,
}

/// Messages received from an audio node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum IncomingPayload {
    Stats(NodeStats),
    PlayerUpdate {
        guild_id: String,
        state: PlayerState,
    },
    Event(EventEnvelope),
}

/// Periodic load report from a node. The cpu block is what region/load
/// selection keys on; the rest is carried for operator visibility.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStats {
    #[serde(default)]
    pub players: u32,
    #[serde(default)]
    pub playing_players: u32,
    #[serde(default)]
    pub uptime: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_stats: Option<FrameStats>,
}

impl NodeStats {
    /// Load penalty used for node selection: system load per core as a
    /// percentage. Absent cpu stats count as an unloaded node.
    pub fn penalty(&self) -> f64 {
        match &self.cpu {
            Some(cpu) if cpu.cores > 0 => (cpu.system_load / cpu.cores as f64) * 100.0,
            _ => 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub free: u64,
    pub used: u64,
    pub allocated: u64,
    pub reservable: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuStats {
    pub cores: u32,
    pub system_load: f64,
    pub lavalink_load: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameStats {
    #[serde(default)]
    pub sent: i64,
    #[serde(default)]
    pub nulled: i64,
    #[serde(default)]
    pub deficit: i64,
}

/// Playback position report attached to `playerUpdate`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerState {
    #[serde(default)]
    pub time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected: Option<bool>,
}

/// An `op: event` message with its `type` and payload kept raw, so that
/// event kinds this library does not know about surface as warnings at the
/// coordinator instead of parse failures at the socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub guild_id: String,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl EventEnvelope {
    /// The raw `type` discriminator, if present.
    pub fn event_type(&self) -> Option<&str> {
        self.data.get("type").and_then(Value::as_str)
    }

    /// Decode into a known player event. Unknown `type` values error here
    /// and are reported as warnings by the caller.
    pub fn decode(&self) -> Result<PlayerEvent, serde_json::Error> {
        serde_json::from_value(Value::Object(self.data.clone()))
    }
}

/// Player lifecycle events a node reports for one guild's session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum PlayerEvent {
    TrackEndEvent {
        track: Option<String>,
        reason: Option<String>,
    },
    TrackExceptionEvent {
        track: Option<String>,
        error: Option<String>,
    },
    TrackStuckEvent {
        track: Option<String>,
        threshold_ms: Option<u64>,
    },
}

/// Track end reason that marks a replacement rather than a real end. A new
/// `play` is already in flight when a node reports it.
pub const TRACK_END_REPLACED: &str = "REPLACED";
