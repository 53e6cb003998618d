use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::{
    domain::{ChannelId, FeedEvent, MemberId, UserId},
    messaging::{
        port::PlatformPort,
        types::{HistoryMessage, HistoryQuery, RosterMember},
    },
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// Minimum spacing between any two platform calls.
    pub global_min_interval: Duration,
    /// Minimum spacing between writes into one channel.
    pub per_channel_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(25), // ~40/sec
            per_channel_min_interval: Duration::from_millis(250), // ~4/sec
        }
    }
}

#[derive(Debug)]
struct IntervalLimiter {
    interval: Duration,
    next: Instant,
}

impl IntervalLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now(),
        }
    }

    /// Reserve the next slot and return how long to wait before using it.
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let start = self.next.max(now);
        self.next = start + self.interval;
        start.saturating_duration_since(now)
    }
}

/// `PlatformPort` decorator that spaces outbound calls.
///
/// Best effort: it keeps bursts (feed batches, mute pairs, alert fan-out) under
/// the platform's limits, while `Error::RateLimited` still reaches callers.
pub struct ThrottledPlatform {
    inner: Arc<dyn PlatformPort>,
    cfg: ThrottleConfig,
    global: Mutex<IntervalLimiter>,
    per_channel: Mutex<HashMap<ChannelId, Arc<Mutex<IntervalLimiter>>>>,
}

impl ThrottledPlatform {
    pub fn new(inner: Arc<dyn PlatformPort>, cfg: ThrottleConfig) -> Self {
        Self {
            inner,
            cfg,
            global: Mutex::new(IntervalLimiter::new(cfg.global_min_interval)),
            per_channel: Mutex::new(HashMap::new()),
        }
    }

    async fn limiter_for(&self, channel: ChannelId) -> Arc<Mutex<IntervalLimiter>> {
        let mut map = self.per_channel.lock().await;
        map.entry(channel)
            .or_insert_with(|| {
                Arc::new(Mutex::new(IntervalLimiter::new(
                    self.cfg.per_channel_min_interval,
                )))
            })
            .clone()
    }

    async fn throttle_channel(&self, channel: ChannelId) {
        let global_wait = { self.global.lock().await.reserve() };
        let channel_wait = {
            let limiter = self.limiter_for(channel).await;
            let mut guard = limiter.lock().await;
            guard.reserve()
        };

        let wait = global_wait.max(channel_wait);
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }

    async fn throttle_global(&self) {
        let wait = { self.global.lock().await.reserve() };
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }
}

#[async_trait]
impl PlatformPort for ThrottledPlatform {
    async fn send_message(&self, channel: ChannelId, text: &str) -> Result<()> {
        self.throttle_channel(channel).await;
        self.inner.send_message(channel, text).await
    }

    async fn send_dm(&self, user: UserId, text: &str) -> Result<()> {
        self.throttle_global().await;
        self.inner.send_dm(user, text).await
    }

    async fn post_feed_event(&self, channel: ChannelId, event: &FeedEvent) -> Result<()> {
        self.throttle_channel(channel).await;
        self.inner.post_feed_event(channel, event).await
    }

    async fn create_scheduled_event(&self, event: &FeedEvent) -> Result<()> {
        self.throttle_global().await;
        self.inner.create_scheduled_event(event).await
    }

    async fn set_voice_mute(
        &self,
        channel: ChannelId,
        member: MemberId,
        muted: bool,
    ) -> Result<()> {
        self.throttle_channel(channel).await;
        self.inner.set_voice_mute(channel, member, muted).await
    }

    // Reads are not throttled: they are rare and the host answers them locally.
    async fn voice_roster(&self, channel: ChannelId) -> Result<Vec<RosterMember>> {
        self.inner.voice_roster(channel).await
    }

    async fn find_channel(&self, name: &str) -> Result<ChannelId> {
        self.inner.find_channel(name).await
    }

    async fn channel_name(&self, channel: ChannelId) -> Result<String> {
        self.inner.channel_name(channel).await
    }

    async fn user_name(&self, user: UserId) -> Result<String> {
        self.inner.user_name(user).await
    }

    async fn fetch_history(
        &self,
        channel: ChannelId,
        query: HistoryQuery,
    ) -> Result<Vec<HistoryMessage>> {
        self.throttle_global().await;
        self.inner.fetch_history(channel, query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakePlatform;

    #[test]
    fn limiter_spaces_reservations() {
        let mut lim = IntervalLimiter::new(Duration::from_millis(100));
        assert!(lim.reserve().is_zero());
        let second = lim.reserve();
        assert!(second > Duration::from_millis(90));
        let third = lim.reserve();
        assert!(third > Duration::from_millis(190));
    }

    #[tokio::test]
    async fn per_channel_writes_are_spaced() {
        let fake = Arc::new(FakePlatform::default());
        let throttled = ThrottledPlatform::new(
            fake.clone(),
            ThrottleConfig {
                global_min_interval: Duration::from_millis(1),
                per_channel_min_interval: Duration::from_millis(40),
            },
        );

        let started = Instant::now();
        for i in 0..3 {
            throttled
                .send_message(ChannelId(1), &format!("m{i}"))
                .await
                .unwrap();
        }
        assert!(started.elapsed() >= Duration::from_millis(80));
        assert_eq!(fake.sent_texts(ChannelId(1)), vec!["m0", "m1", "m2"]);
    }

    #[tokio::test]
    async fn different_channels_do_not_wait_on_each_other() {
        let fake = Arc::new(FakePlatform::default());
        let throttled = ThrottledPlatform::new(
            fake.clone(),
            ThrottleConfig {
                global_min_interval: Duration::from_millis(1),
                per_channel_min_interval: Duration::from_secs(5),
            },
        );

        let started = Instant::now();
        throttled.send_message(ChannelId(1), "a").await.unwrap();
        throttled.send_message(ChannelId(2), "b").await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
