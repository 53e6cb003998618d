//! Cached lookups of platform objects by name or id.
//!
//! Platform lookups are slow and rate limited while the answers rarely change,
//! so everything goes through [`ObjectCache`].

use std::{sync::Arc, time::Duration};

use crate::{
    cache::ObjectCache,
    domain::{ChannelId, UserId},
    messaging::port::PlatformPort,
    Result,
};

pub struct Directory {
    platform: Arc<dyn PlatformPort>,
    channels_by_name: ObjectCache<String, ChannelId>,
    channel_names: ObjectCache<ChannelId, String>,
    user_names: ObjectCache<UserId, String>,
}

impl Directory {
    pub fn new(platform: Arc<dyn PlatformPort>, ttl: Duration) -> Self {
        Self {
            platform,
            channels_by_name: ObjectCache::new(ttl),
            channel_names: ObjectCache::new(ttl),
            user_names: ObjectCache::new(ttl),
        }
    }

    pub async fn channel_by_name(&self, name: &str) -> Result<ChannelId> {
        let platform = self.platform.clone();
        let lookup = name.to_string();
        self.channels_by_name
            .get_or_fetch(name.to_string(), move || async move {
                platform.find_channel(&lookup).await
            })
            .await
    }

    pub async fn channel_name(&self, channel: ChannelId) -> Result<String> {
        let platform = self.platform.clone();
        self.channel_names
            .get_or_fetch(channel, move || async move { platform.channel_name(channel).await })
            .await
    }

    pub async fn user_name(&self, user: UserId) -> Result<String> {
        let platform = self.platform.clone();
        self.user_names
            .get_or_fetch(user, move || async move { platform.user_name(user).await })
            .await
    }

    /// Forget a channel whose name or existence may have changed.
    pub fn forget_channel(&self, name: &str) {
        self.channels_by_name.invalidate(&name.to_string());
    }

    pub fn sweep(&self) -> usize {
        self.channels_by_name.sweep() + self.channel_names.sweep() + self.user_names.sweep()
    }
}

/// Posts operator-facing notices to the moderators channel.
pub struct Moderators {
    platform: Arc<dyn PlatformPort>,
    directory: Arc<Directory>,
    channel_name: String,
}

impl Moderators {
    pub fn new(
        platform: Arc<dyn PlatformPort>,
        directory: Arc<Directory>,
        channel_name: impl Into<String>,
    ) -> Self {
        Self {
            platform,
            directory,
            channel_name: channel_name.into(),
        }
    }

    pub async fn try_notify(&self, text: &str) -> Result<()> {
        let channel = self.directory.channel_by_name(&self.channel_name).await?;
        if let Err(e) = self.platform.send_message(channel, text).await {
            // The channel may have been deleted or renamed; look it up again next time.
            self.directory.forget_channel(&self.channel_name);
            return Err(e);
        }
        Ok(())
    }

    /// Best effort: failures are logged, never propagated.
    pub async fn notify(&self, text: &str) {
        if let Err(e) = self.try_notify(text).await {
            tracing::error!(
                channel = %self.channel_name,
                error = %e,
                "failed to notify moderators"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakePlatform;

    #[tokio::test]
    async fn moderators_channel_is_resolved_once() {
        let fake = Arc::new(FakePlatform::default());
        fake.add_channel("moderators_only", ChannelId(99));
        let directory = Arc::new(Directory::new(fake.clone(), Duration::from_secs(60)));
        let mods = Moderators::new(fake.clone(), directory, "moderators_only");

        mods.notify("first").await;
        mods.notify("second").await;

        assert_eq!(fake.sent_texts(ChannelId(99)), vec!["first", "second"]);
        assert_eq!(fake.lookup_count(), 1);
    }

    #[tokio::test]
    async fn missing_moderators_channel_is_not_fatal() {
        let fake = Arc::new(FakePlatform::default());
        let directory = Arc::new(Directory::new(fake.clone(), Duration::from_secs(60)));
        let mods = Moderators::new(fake.clone(), directory, "moderators_only");

        assert!(mods.try_notify("hello").await.is_err());
        mods.notify("hello").await;
        assert!(fake.all_sent().is_empty());
    }

    #[tokio::test]
    async fn names_are_cached() {
        let fake = Arc::new(FakePlatform::default());
        fake.add_channel("general", ChannelId(5));
        let directory = Directory::new(fake.clone(), Duration::from_secs(60));

        assert_eq!(directory.channel_name(ChannelId(5)).await.unwrap(), "general");
        assert_eq!(directory.channel_name(ChannelId(5)).await.unwrap(), "general");
        assert_eq!(directory.user_name(UserId(8)).await.unwrap(), "user8");
        assert_eq!(fake.lookup_count(), 2);
    }
}
