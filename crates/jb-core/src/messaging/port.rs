use async_trait::async_trait;

use crate::{
    domain::{ChannelId, FeedEvent, MemberId, UserId},
    messaging::types::{HistoryMessage, HistoryQuery, RosterMember},
    Result,
};

/// Everything the core needs from the chat platform.
///
/// Implementations map platform throttling to `Error::RateLimited` so callers
/// can back off.
#[async_trait]
pub trait PlatformPort: Send + Sync {
    async fn send_message(&self, channel: ChannelId, text: &str) -> Result<()>;
    async fn send_dm(&self, user: UserId, text: &str) -> Result<()>;

    async fn post_feed_event(&self, channel: ChannelId, event: &FeedEvent) -> Result<()>;
    /// Mirror a feed event into the platform's native event list.
    async fn create_scheduled_event(&self, event: &FeedEvent) -> Result<()>;

    async fn set_voice_mute(&self, channel: ChannelId, member: MemberId, muted: bool)
        -> Result<()>;
    /// Authoritative occupancy of a voice channel.
    async fn voice_roster(&self, channel: ChannelId) -> Result<Vec<RosterMember>>;

    async fn find_channel(&self, name: &str) -> Result<ChannelId>;
    async fn channel_name(&self, channel: ChannelId) -> Result<String>;
    async fn user_name(&self, user: UserId) -> Result<String>;

    async fn fetch_history(
        &self,
        channel: ChannelId,
        query: HistoryQuery,
    ) -> Result<Vec<HistoryMessage>>;
}
