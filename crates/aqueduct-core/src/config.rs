use std::collections::HashMap;

use serde::Deserialize;

/// Connection details for one audio node. Hosts typically deserialize a list
/// of these from their own config file.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
    /// Region key this node serves, matched against `PoolConfig::regions`.
    #[serde(default)]
    pub region: Option<String>,
    /// Connect with `wss://` instead of `ws://`.
    #[serde(default)]
    pub secure: bool,
}

impl NodeConfig {
    /// Node identity within the pool.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub(crate) fn ws_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}:{}/", scheme, self.host, self.port)
    }
}

/// Pool-wide tuning. Every field but `user_id` has a workable default.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Bot identity sent in the node handshake.
    pub user_id: String,
    /// Shard count sent in the node handshake.
    #[serde(default = "default_shard_count")]
    pub shard_count: u64,
    /// Operator override for the endpoint-region table; `None` uses
    /// [`crate::region::default_regions`].
    #[serde(default)]
    pub regions: Option<HashMap<String, Vec<String>>>,
    /// Region assumed when an endpoint matches nothing.
    #[serde(default)]
    pub default_region: Option<String>,
    /// Migrations executed per `failover_rate_ms` window.
    #[serde(default = "default_failover_limit")]
    pub failover_limit: usize,
    #[serde(default = "default_failover_rate_ms")]
    pub failover_rate_ms: u64,
    /// Added to the pre-outage position when resuming a migrated session,
    /// to skip over the gap incurred by the outage.
    #[serde(default = "default_reconnect_threshold_ms")]
    pub reconnect_threshold_ms: u64,
    /// How long a join waits for its voice-server assignment.
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
}

fn default_shard_count() -> u64 {
    1
}

fn default_failover_limit() -> usize {
    1
}

fn default_failover_rate_ms() -> u64 {
    250
}

fn default_reconnect_threshold_ms() -> u64 {
    2_000
}

fn default_join_timeout_ms() -> u64 {
    10_000
}

impl PoolConfig {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            shard_count: default_shard_count(),
            regions: None,
            default_region: None,
            failover_limit: default_failover_limit(),
            failover_rate_ms: default_failover_rate_ms(),
            reconnect_threshold_ms: default_reconnect_threshold_ms(),
            join_timeout_ms: default_join_timeout_ms(),
        }
    }
}
