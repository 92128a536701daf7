//! Client-side orchestration for a pool of remote audio-playback nodes.
//!
//! A [`NodePool`] maintains websocket connections to every configured node,
//! tracks per-guild [`Session`]s, resolves voice-channel joins against the
//! voice-server assignments delivered by the host's [`Gateway`], and
//! migrates sessions off nodes that fail or drain.

pub mod config;
pub mod error;
mod failover;
pub mod gateway;
mod node;
mod pending;
mod pool;
mod region;
mod session;

pub use aqueduct_model as model;

pub use config::{NodeConfig, PoolConfig};
pub use error::{JoinError, NodeError};
pub use gateway::Gateway;
pub use node::{NodeState, VoiceNode};
pub use pool::{JoinOptions, NodePool, VoiceServerAssignment};
pub use region::default_regions;
pub use session::{PlayOptions, Session, SessionEvent};
