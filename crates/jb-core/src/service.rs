//! The engine as the command layer sees it.
//!
//! `Automation` owns every component and exposes the operations the chat
//! commands and voice events map onto. Errors are logged here and surfaced to
//! moderators where someone has to act; callers get a `Result` to turn into a
//! reply.

use std::{path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    archive::{
        ArchiveOutcome, ArchiveRequest, ArchiveRequests, EphemeralArchiveServer, HistorySettings,
        ServerSettings,
    },
    bridge::DomainBridge,
    config::Config,
    directory::{Directory, Moderators},
    domain::{ChannelId, JobId},
    feeds::{FeedService, FeedSettings, FeedSource, FeedSubscription},
    formatting, logging,
    messaging::port::PlatformPort,
    persistence::{PersistenceStore, WriteQueue},
    reminders::ReminderService,
    scheduler::{JobHandler, JobKind, JobScheduler, ScheduledJob},
    voice::{RosterDelta, SafetyEffects, VoiceSafetyMonitor},
    Error, Result,
};

/// What `start` brought back from disk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StartReport {
    pub jobs: usize,
    pub feeds: usize,
    pub archives: usize,
}

pub struct Automation {
    bridge: DomainBridge,
    scheduler: JobScheduler,
    directory: Arc<Directory>,
    moderators: Arc<Moderators>,
    reminders: Arc<ReminderService>,
    feeds: Arc<FeedService>,
    voice: VoiceSafetyMonitor,
    archives: Arc<ArchiveRequests>,
    server: EphemeralArchiveServer,
    log_file: PathBuf,
    sweep_interval: Duration,
    shutdown: CancellationToken,
}

impl Automation {
    /// Wire the components. Needs a running tokio runtime.
    pub fn new(
        cfg: &Config,
        platform: Arc<dyn PlatformPort>,
        store: Arc<dyn PersistenceStore>,
        source: Arc<dyn FeedSource>,
        bridge: DomainBridge,
    ) -> Self {
        let writes = WriteQueue::spawn(store.clone(), bridge.clone());
        let directory = Arc::new(Directory::new(platform.clone(), cfg.cache_ttl));
        let moderators = Arc::new(Moderators::new(
            platform.clone(),
            directory.clone(),
            cfg.moderators_channel.clone(),
        ));
        let scheduler = JobScheduler::new(store.clone(), bridge.clone(), cfg.missed_fire_policy);
        let reminders = Arc::new(ReminderService::new(
            scheduler.clone(),
            platform.clone(),
            cfg.min_reminder_interval,
        ));
        let feeds = Arc::new(FeedService::new(
            FeedSettings::from_config(cfg),
            scheduler.clone(),
            bridge.clone(),
            writes.clone(),
            store.clone(),
            source,
            platform.clone(),
            moderators.clone(),
        ));
        let voice = VoiceSafetyMonitor::new(platform.clone(), moderators.clone(), cfg.lock_timeout);
        let server = EphemeralArchiveServer::new(
            ServerSettings::from_config(cfg),
            bridge.clone(),
            store,
            writes,
        );
        let archives = Arc::new(ArchiveRequests::new(
            HistorySettings::from_config(cfg),
            bridge.clone(),
            platform,
            directory.clone(),
            server.clone(),
        ));

        Self {
            bridge,
            scheduler,
            directory,
            moderators,
            reminders,
            feeds,
            voice,
            archives,
            server,
            log_file: cfg.log_file(),
            sweep_interval: cfg.cache_ttl.max(Duration::from_secs(1)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn bridge(&self) -> &DomainBridge {
        &self.bridge
    }

    /// Recover archives, rehydrate jobs and feeds, and start the timers.
    pub async fn start(&self) -> Result<StartReport> {
        let archives = match self.server.recover().await {
            Ok(report) => report.restored,
            Err(e) => {
                tracing::error!(error = %e, "archive recovery failed");
                0
            }
        };

        let dispatcher = Arc::new(Dispatcher {
            reminders: self.reminders.clone(),
            feeds: self.feeds.clone(),
            moderators: self.moderators.clone(),
        });
        let jobs = self.scheduler.start(dispatcher).await?;
        let feeds = self.feeds.restore().await;

        let directory = self.directory.clone();
        let every = self.sweep_interval;
        let stop = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let reclaimed = directory.sweep();
                        if reclaimed > 0 {
                            tracing::debug!(reclaimed, "directory cache swept");
                        }
                    }
                }
            }
        });

        let report = StartReport {
            jobs,
            feeds,
            archives,
        };
        tracing::info!(?report, "automation started");
        Ok(report)
    }

    pub fn add_reminder(
        &self,
        title: &str,
        channel: ChannelId,
        body: &str,
        interval: Duration,
        one_shot: bool,
    ) -> Result<JobId> {
        self.reminders.add(title, channel, body, interval, one_shot)
    }

    pub fn delete_reminder(&self, title: &str) -> Result<()> {
        self.reminders.delete(title)
    }

    pub fn list_reminders(&self) -> Vec<ScheduledJob> {
        self.reminders.list()
    }

    pub fn delete_all_reminders(&self) -> usize {
        self.reminders.delete_all()
    }

    pub fn add_feed(&self, url: &str, channel: ChannelId) -> Result<FeedSubscription> {
        self.feeds.add_feed(url, channel)
    }

    pub fn remove_feed(&self, url: &str) -> Result<()> {
        if self.feeds.remove_feed(url) {
            Ok(())
        } else {
            Err(Error::NotFound(format!("feed {}", url.trim())))
        }
    }

    pub fn list_feeds(&self) -> Vec<FeedSubscription> {
        self.feeds.list_feeds()
    }

    pub async fn on_voice_roster_changed(
        &self,
        channel: ChannelId,
        delta: RosterDelta,
    ) -> Result<SafetyEffects> {
        let result = self.voice.on_roster_changed(channel, delta).await;
        match &result {
            Err(Error::LockContention(what)) => {
                tracing::error!(channel = %channel, what = %what, "voice check skipped");
                self.moderators
                    .notify(&formatting::lock_contention_alert(channel))
                    .await;
            }
            Err(e) => tracing::error!(channel = %channel, error = %e, "voice roster update failed"),
            Ok(_) => {}
        }
        result
    }

    /// Returns how many channels changed state.
    pub async fn set_voice_chaperone(&self, enabled: bool) -> usize {
        self.voice.set_enabled(enabled).await
    }

    pub fn voice_chaperone_enabled(&self) -> bool {
        self.voice.is_enabled()
    }

    pub async fn request_archive(&self, req: ArchiveRequest) -> Result<ArchiveOutcome> {
        self.archives.request(req).await
    }

    /// Last `n` lines of the log file.
    pub async fn log_tail(&self, n: usize) -> Result<Vec<String>> {
        let path = self.log_file.clone();
        self.bridge
            .run_in_background(move || logging::log_tail(&path, n))
            .await
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.scheduler.shutdown();
        self.server.shutdown().await;
        tracing::info!("automation stopped");
    }
}

/// Routes fired jobs to their service. Runs on the event domain.
struct Dispatcher {
    reminders: Arc<ReminderService>,
    feeds: Arc<FeedService>,
    moderators: Arc<Moderators>,
}

#[async_trait]
impl JobHandler for Dispatcher {
    async fn on_fire(&self, job: ScheduledJob) {
        match &job.kind {
            JobKind::Reminder { title, channel, .. } => {
                if let Err(e) = self.reminders.deliver(&job).await {
                    tracing::error!(
                        job_id = %job.id,
                        title = %title,
                        channel = %channel,
                        error = %e,
                        "failed to post reminder"
                    );
                }
            }
            JobKind::FeedPoll { url, .. } => self.feeds.poll(url),
        }
    }

    async fn on_persistence_failure(&self, job: ScheduledJob, error: Error) {
        self.moderators
            .notify(&formatting::persistence_failure_alert(&job, &error))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bridge::event_domain,
        domain::{AgeCategory, MemberId},
        persistence::JsonFileStore,
        testing::{feed_event, FakeFeedSource, FakePlatform, MemoryStore},
    };
    use chrono::Utc;

    const MODS: ChannelId = ChannelId(900);

    struct Harness {
        automation: Automation,
        platform: Arc<FakePlatform>,
        source: Arc<FakeFeedSource>,
        _shutdown: tokio_util::sync::DropGuard,
    }

    fn config(dir: &std::path::Path) -> Config {
        let mut cfg = Config::with_data_dir(dir);
        cfg.min_reminder_interval = Duration::from_secs(1);
        cfg.archive_bind_host = "127.0.0.1".into();
        cfg.archive_public_host = "127.0.0.1".into();
        cfg.archive_port = 0;
        cfg.history_page_delay = Duration::from_millis(5);
        cfg
    }

    fn harness(cfg: &Config, store: Arc<dyn PersistenceStore>) -> Harness {
        let (bridge, domain) = event_domain(cfg.domain_queue_capacity);
        let shutdown = CancellationToken::new();
        tokio::spawn(domain.run(shutdown.clone()));
        let platform = Arc::new(FakePlatform::default());
        platform.add_channel("moderators_only", MODS);
        let source = Arc::new(FakeFeedSource::default());
        let automation = Automation::new(cfg, platform.clone(), store, source.clone(), bridge);
        Harness {
            automation,
            platform,
            source,
            _shutdown: shutdown.drop_guard(),
        }
    }

    #[tokio::test]
    async fn reminder_posts_to_its_channel() {
        let tmp = tempfile::tempdir().unwrap();
        let h = harness(&config(tmp.path()), Arc::new(MemoryStore::default()));
        h.automation.start().await.unwrap();

        h.automation
            .add_reminder("Standup", ChannelId(5), "Join now", Duration::from_secs(1), false)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(
            h.platform.sent_texts(ChannelId(5)),
            vec!["**Standup**\nJoin now"]
        );
        assert_eq!(h.automation.list_reminders().len(), 1);
        h.automation.shutdown().await;
    }

    #[tokio::test]
    async fn persisted_reminders_resume_after_restart() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = config(tmp.path());
        let store = Arc::new(JsonFileStore::open(tmp.path()).unwrap());
        let overdue = ScheduledJob::recurring(
            JobKind::Reminder {
                title: "overdue".into(),
                channel: ChannelId(5),
                body: String::new(),
            },
            Duration::from_secs(60),
        )
        .starting_at(Utc::now() - chrono::Duration::seconds(300))
        .persisted();
        let later = ScheduledJob::recurring(
            JobKind::Reminder {
                title: "later".into(),
                channel: ChannelId(5),
                body: String::new(),
            },
            Duration::from_secs(120),
        )
        .persisted();
        store.save_job(&overdue).unwrap();
        store.save_job(&later).unwrap();

        let h = harness(&cfg, store);
        let report = h.automation.start().await.unwrap();
        assert_eq!(report.jobs, 2);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(h.platform.sent_texts(ChannelId(5)), vec!["**overdue**"]);
        h.automation.shutdown().await;
    }

    #[tokio::test]
    async fn delete_reminder_reports_unknown_titles() {
        let tmp = tempfile::tempdir().unwrap();
        let h = harness(&config(tmp.path()), Arc::new(MemoryStore::default()));
        h.automation
            .add_reminder("daily-standup", ChannelId(1), "", Duration::from_secs(60), false)
            .unwrap();
        h.automation
            .add_reminder("retro", ChannelId(1), "", Duration::from_secs(60), false)
            .unwrap();

        h.automation.delete_reminder("daily-standup").unwrap();
        assert!(matches!(
            h.automation.delete_reminder("daily-standup"),
            Err(Error::NotFound(_))
        ));
        assert_eq!(h.automation.list_reminders().len(), 1);
        assert_eq!(h.automation.delete_all_reminders(), 1);
    }

    #[tokio::test]
    async fn failed_reminder_save_alerts_moderators() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        store.fail_writes(true);
        let h = harness(&config(tmp.path()), store);
        h.automation.start().await.unwrap();

        h.automation
            .add_reminder("fragile", ChannelId(1), "", Duration::from_secs(3600), false)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let alerts = h.platform.sent_texts(MODS);
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].contains("reminder \"fragile\""));
        assert_eq!(h.automation.list_reminders().len(), 1);
    }

    #[tokio::test]
    async fn added_feed_posts_upcoming_events() {
        let tmp = tempfile::tempdir().unwrap();
        let h = harness(&config(tmp.path()), Arc::new(MemoryStore::default()));
        h.automation.start().await.unwrap();
        h.source.push_ok(vec![feed_event("meetup", 24)]);

        h.automation
            .add_feed("https://example.org/club.ics", ChannelId(6))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let posts = h.platform.feed_posts();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].0, ChannelId(6));
        assert_eq!(h.automation.list_feeds().len(), 1);
        assert!(h.automation.add_feed("ftp://example.org/x.ics", ChannelId(6)).is_err());
        h.automation
            .remove_feed("https://example.org/club.ics")
            .unwrap();
        assert!(h
            .automation
            .remove_feed("https://example.org/club.ics")
            .is_err());
    }

    #[tokio::test]
    async fn voice_pair_is_muted_and_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let h = harness(&config(tmp.path()), Arc::new(MemoryStore::default()));
        let voice = ChannelId(500);

        h.automation
            .on_voice_roster_changed(
                voice,
                RosterDelta::Joined {
                    member: MemberId(1),
                    category: AgeCategory::Adult,
                },
            )
            .await
            .unwrap();
        let fx = h
            .automation
            .on_voice_roster_changed(
                voice,
                RosterDelta::Joined {
                    member: MemberId(2),
                    category: AgeCategory::Child,
                },
            )
            .await
            .unwrap();
        assert_eq!(fx.mute.len(), 2);
        assert_eq!(h.platform.sent_texts(MODS).len(), 1);

        assert_eq!(h.automation.set_voice_chaperone(false).await, 1);
        assert!(!h.automation.voice_chaperone_enabled());
    }

    #[tokio::test]
    async fn log_tail_returns_last_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = config(tmp.path());
        std::fs::write(cfg.log_file(), "one\ntwo\nthree\n").unwrap();
        let h = harness(&cfg, Arc::new(MemoryStore::default()));

        assert_eq!(h.automation.log_tail(2).await.unwrap(), vec!["two", "three"]);
    }
}
