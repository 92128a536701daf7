use async_trait::async_trait;

/// The host bot framework's shard layer, as seen from the pool.
///
/// The pool never talks to the chat platform itself; it asks the gateway to
/// move the bot in and out of voice channels, and the host feeds
/// [`NodePool::voice_server_update`](crate::NodePool::voice_server_update)
/// and [`NodePool::shard_ready`](crate::NodePool::shard_ready) back in.
#[async_trait]
pub trait Gateway: Send + Sync + 'static {
    /// Which shard owns this guild.
    fn shard_id(&self, guild_id: &str) -> u64;

    /// Request an outbound voice-state update. `channel_id: None` leaves the
    /// current voice channel.
    async fn voice_state_update(
        &self,
        guild_id: &str,
        channel_id: Option<&str>,
        self_mute: bool,
        self_deaf: bool,
    ) -> anyhow::Result<()>;
}
