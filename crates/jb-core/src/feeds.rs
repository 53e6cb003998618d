//! Calendar feed subscriptions.
//!
//! Each subscription owns a recurring `FeedPoll` job. A poll fetches on a
//! worker (timeout plus bounded retry) and hands the result back to the event
//! domain, where the seen-set is updated and the new events are posted.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    bridge::DomainBridge,
    config::Config,
    directory::Moderators,
    domain::{ChannelId, FeedEvent, JobId},
    formatting,
    messaging::port::PlatformPort,
    persistence::{PersistenceStore, WriteQueue},
    retry::{with_retry, Backoff},
    scheduler::{JobKind, JobScheduler, ScheduledJob},
    Error, Result,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedSubscription {
    pub url: String,
    pub target_channel: ChannelId,
    #[serde(default)]
    pub last_seen_event_ids: BTreeSet<String>,
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub last_checked: Option<DateTime<Utc>>,
    #[serde(default)]
    pub consecutive_failures: u32,
}

impl FeedSubscription {
    pub fn new(url: String, target_channel: ChannelId, poll_interval: Duration) -> Self {
        Self {
            url,
            target_channel,
            last_seen_event_ids: BTreeSet::new(),
            poll_interval_secs: poll_interval.as_secs().max(1),
            last_checked: None,
            consecutive_failures: 0,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

/// Where calendar events come from (HTTP iCalendar in production).
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<FeedEvent>>;
}

#[derive(Clone, Copy, Debug)]
pub struct FeedSettings {
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub backoff: Backoff,
    /// Consecutive failures before moderators hear about it.
    pub alert_threshold: u32,
    /// Events that started longer ago than this are never posted.
    pub lookback: chrono::Duration,
}

impl FeedSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            poll_interval: cfg.feed_poll_interval,
            timeout: cfg.feed_timeout,
            backoff: Backoff::new(Duration::from_secs(2), cfg.feed_max_attempts),
            alert_threshold: cfg.feed_failure_alert_threshold,
            lookback: chrono::Duration::hours(1),
        }
    }
}

struct FeedEntry {
    sub: FeedSubscription,
    job: JobId,
    in_flight: Option<CancellationToken>,
}

enum PollOutcome {
    Fresh {
        channel: ChannelId,
        events: Vec<FeedEvent>,
    },
    Failed {
        failures: u32,
        error: Error,
    },
}

pub struct FeedService {
    settings: FeedSettings,
    scheduler: JobScheduler,
    bridge: DomainBridge,
    writes: WriteQueue,
    store: Arc<dyn PersistenceStore>,
    source: Arc<dyn FeedSource>,
    platform: Arc<dyn PlatformPort>,
    moderators: Arc<Moderators>,
    feeds: Mutex<HashMap<String, FeedEntry>>,
}

impl FeedService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: FeedSettings,
        scheduler: JobScheduler,
        bridge: DomainBridge,
        writes: WriteQueue,
        store: Arc<dyn PersistenceStore>,
        source: Arc<dyn FeedSource>,
        platform: Arc<dyn PlatformPort>,
        moderators: Arc<Moderators>,
    ) -> Self {
        Self {
            settings,
            scheduler,
            bridge,
            writes,
            store,
            source,
            platform,
            moderators,
            feeds: Mutex::new(HashMap::new()),
        }
    }

    /// Re-register persisted subscriptions; each polls right away.
    pub async fn restore(&self) -> usize {
        let store = self.store.clone();
        let loaded = match self
            .bridge
            .run_in_background(move || store.load_feeds())
            .await
        {
            Ok(feeds) => feeds,
            Err(e) => {
                tracing::error!(error = %e, "failed to load feed subscriptions");
                return 0;
            }
        };
        let count = loaded.len();
        for sub in loaded {
            tracing::info!(url = %sub.url, channel = %sub.target_channel, "restored feed");
            self.register(sub, false);
        }
        count
    }

    /// Subscribe `channel` to `url`. Re-adding a known url moves it to the new
    /// channel and keeps what was already posted.
    pub fn add_feed(&self, url: &str, channel: ChannelId) -> Result<FeedSubscription> {
        let url = validate_feed_url(url)?;
        let sub = self.register(
            FeedSubscription::new(url, channel, self.settings.poll_interval),
            true,
        );
        tracing::info!(url = %sub.url, channel = %channel, "feed added");
        Ok(sub)
    }

    pub fn remove_feed(&self, url: &str) -> bool {
        let url = url.trim();
        let Some(entry) = self.lock().remove(url) else {
            return false;
        };
        self.scheduler.cancel(&entry.job);
        if let Some(poll) = entry.in_flight {
            poll.cancel();
        }
        let key = url.to_string();
        self.writes.submit(format!("delete feed {url}"), move |s| {
            s.delete_feed(&key).map(|_| ())
        });
        tracing::info!(url, "feed removed");
        true
    }

    pub fn list_feeds(&self) -> Vec<FeedSubscription> {
        let mut feeds: Vec<_> = self.lock().values().map(|e| e.sub.clone()).collect();
        feeds.sort_by(|a, b| a.url.cmp(&b.url));
        feeds
    }

    /// Start a poll of `url` unless one is already running.
    pub fn poll(self: &Arc<Self>, url: &str) {
        let mut feeds = self.lock();
        let Some(entry) = feeds.get_mut(url) else {
            tracing::debug!(url, "poll for unknown feed ignored");
            return;
        };
        if entry
            .in_flight
            .as_ref()
            .is_some_and(|poll| !poll.is_cancelled())
        {
            tracing::debug!(url, "poll already in flight");
            return;
        }

        let source = self.source.clone();
        let settings = self.settings;
        let target = url.to_string();
        let work = self.bridge.spawn_worker(async move {
            with_retry(settings.backoff, "feed fetch", || {
                let source = source.clone();
                let target = target.clone();
                async move {
                    tokio::time::timeout(settings.timeout, source.fetch(&target))
                        .await
                        .unwrap_or(Err(Error::Timeout(settings.timeout)))
                }
            })
            .await
        });

        let this = Arc::clone(self);
        let key = url.to_string();
        let poll = self.bridge.then(work, move |result| async move {
            this.apply_poll(&key, result, Utc::now()).await;
        });
        entry.in_flight = Some(poll);
    }

    /// Fold a poll result into the subscription. Runs on the event domain.
    async fn apply_poll(&self, url: &str, result: Result<Vec<FeedEvent>>, now: DateTime<Utc>) {
        let (outcome, snapshot) = {
            let mut feeds = self.lock();
            let Some(entry) = feeds.get_mut(url) else {
                return;
            };
            entry.in_flight = None;
            entry.sub.last_checked = Some(now);
            let outcome = match result {
                Ok(events) => {
                    let fresh = select_new_events(&entry.sub, events, now, self.settings.lookback);
                    entry
                        .sub
                        .last_seen_event_ids
                        .extend(fresh.iter().map(|e| e.uid.clone()));
                    entry.sub.consecutive_failures = 0;
                    PollOutcome::Fresh {
                        channel: entry.sub.target_channel,
                        events: fresh,
                    }
                }
                Err(error) => {
                    entry.sub.consecutive_failures += 1;
                    PollOutcome::Failed {
                        failures: entry.sub.consecutive_failures,
                        error,
                    }
                }
            };
            (outcome, entry.sub.clone())
        };
        self.persist(snapshot);

        match outcome {
            PollOutcome::Fresh { channel, events } => {
                tracing::info!(url, new_events = events.len(), "feed polled");
                if events.is_empty() {
                    return;
                }
                deliver(self.platform.as_ref(), channel, &events).await;
            }
            PollOutcome::Failed { failures, error } => {
                tracing::warn!(url, failures, error = %error, "feed poll failed");
                if failures == self.settings.alert_threshold {
                    let text = formatting::feed_failure_alert(url, failures, &error);
                    self.moderators.notify(&text).await;
                }
            }
        }
    }

    /// Install `sub`, replacing any entry for the same url. A replaced entry
    /// hands over its seen-set and failure count so nothing is posted twice.
    fn register(&self, mut sub: FeedSubscription, persist: bool) -> FeedSubscription {
        let job = ScheduledJob::recurring(
            JobKind::FeedPoll {
                url: sub.url.clone(),
                channel: sub.target_channel,
            },
            sub.poll_interval(),
        )
        .starting_at(Utc::now());

        // Merge and insert under one lock so a poll landing in between cannot
        // be overwritten. The entry must exist before the job can fire.
        let replaced = {
            let mut feeds = self.lock();
            if let Some(old) = feeds.get(&sub.url) {
                sub.last_seen_event_ids
                    .extend(old.sub.last_seen_event_ids.iter().cloned());
                sub.last_checked = sub.last_checked.max(old.sub.last_checked);
                sub.consecutive_failures = old.sub.consecutive_failures;
            }
            feeds.insert(
                sub.url.clone(),
                FeedEntry {
                    sub: sub.clone(),
                    job: job.id.clone(),
                    in_flight: None,
                },
            )
        };
        self.scheduler.schedule(job);
        if let Some(old) = replaced {
            self.scheduler.cancel(&old.job);
            if let Some(poll) = old.in_flight {
                poll.cancel();
            }
        }
        if persist {
            self.persist(sub.clone());
        }
        sub
    }

    fn persist(&self, sub: FeedSubscription) {
        self.writes
            .submit(format!("save feed {}", sub.url), move |s| s.save_feed(&sub));
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, FeedEntry>> {
        self.feeds.lock().unwrap_or_else(|p| p.into_inner())
    }
}

async fn deliver(platform: &dyn PlatformPort, channel: ChannelId, events: &[FeedEvent]) {
    for event in events {
        if let Err(e) = platform.post_feed_event(channel, event).await {
            tracing::error!(uid = %event.uid, channel = %channel, error = %e, "failed to post feed event");
        }
        // Best effort: the channel post is what members rely on.
        if let Err(e) = platform.create_scheduled_event(event).await {
            tracing::warn!(uid = %event.uid, error = %e, "failed to create scheduled event");
        }
    }
}

/// Events not seen before and not long past, deduplicated, oldest first.
pub fn select_new_events(
    sub: &FeedSubscription,
    events: Vec<FeedEvent>,
    now: DateTime<Utc>,
    lookback: chrono::Duration,
) -> Vec<FeedEvent> {
    let cutoff = now - lookback;
    let mut batch = BTreeSet::new();
    let mut fresh: Vec<FeedEvent> = events
        .into_iter()
        .filter(|e| e.start >= cutoff)
        .filter(|e| !sub.last_seen_event_ids.contains(&e.uid))
        .filter(|e| batch.insert(e.uid.clone()))
        .collect();
    fresh.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.uid.cmp(&b.uid)));
    fresh
}

fn validate_feed_url(url: &str) -> Result<String> {
    let url = url.trim();
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or_else(|| Error::Invalid(format!("feed url must be http or https: {url}")))?;
    if rest.is_empty() || rest.starts_with('/') || url.chars().any(char::is_whitespace) {
        return Err(Error::Invalid(format!("malformed feed url: {url}")));
    }
    Ok(url.to_string())
}
