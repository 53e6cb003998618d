//! In-memory fakes shared by the unit tests.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{sync::mpsc, time::Instant};

use crate::{
    archive::ArchiveJob,
    domain::{ChannelId, FeedEvent, JobId, MemberId, UserId},
    feeds::{FeedSource, FeedSubscription},
    messaging::{
        port::PlatformPort,
        types::{HistoryMessage, HistoryQuery, RosterMember},
    },
    persistence::PersistenceStore,
    scheduler::{JobHandler, ScheduledJob},
    Error, Result,
};

#[derive(Default)]
pub struct FakePlatform {
    channels: Mutex<HashMap<String, ChannelId>>,
    sent: Mutex<Vec<(ChannelId, String)>>,
    dms: Mutex<Vec<(UserId, String)>>,
    mutes: Mutex<Vec<(ChannelId, MemberId, bool)>>,
    feed_posts: Mutex<Vec<(ChannelId, FeedEvent)>>,
    scheduled_events: Mutex<Vec<FeedEvent>>,
    rosters: Mutex<HashMap<ChannelId, Vec<RosterMember>>>,
    history: Mutex<VecDeque<Result<Vec<HistoryMessage>>>>,
    history_queries: Mutex<Vec<HistoryQuery>>,
    lookups: AtomicUsize,
    off_domain_writes: AtomicUsize,
    fail_sends: AtomicBool,
}

impl FakePlatform {
    pub fn add_channel(&self, name: &str, id: ChannelId) {
        self.channels.lock().unwrap().insert(name.to_string(), id);
    }

    pub fn sent_texts(&self, channel: ChannelId) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| *c == channel)
            .map(|(_, t)| t.clone())
            .collect()
    }

    pub fn all_sent(&self) -> Vec<(ChannelId, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn dms(&self) -> Vec<(UserId, String)> {
        self.dms.lock().unwrap().clone()
    }

    pub fn mute_calls(&self) -> Vec<(ChannelId, MemberId, bool)> {
        self.mutes.lock().unwrap().clone()
    }

    pub fn feed_posts(&self) -> Vec<(ChannelId, FeedEvent)> {
        self.feed_posts.lock().unwrap().clone()
    }

    pub fn scheduled_events(&self) -> Vec<FeedEvent> {
        self.scheduled_events.lock().unwrap().clone()
    }

    pub fn set_roster(&self, channel: ChannelId, members: Vec<RosterMember>) {
        self.rosters.lock().unwrap().insert(channel, members);
    }

    pub fn push_history(&self, page: Vec<HistoryMessage>) {
        self.history.lock().unwrap().push_back(Ok(page));
    }

    pub fn push_history_error(&self, err: Error) {
        self.history.lock().unwrap().push_back(Err(err));
    }

    pub fn history_queries(&self) -> Vec<HistoryQuery> {
        self.history_queries.lock().unwrap().clone()
    }

    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    /// Outbound platform calls made outside an event-domain callback.
    pub fn off_domain_writes(&self) -> usize {
        self.off_domain_writes.load(Ordering::SeqCst)
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    fn note_write(&self) {
        if !crate::bridge::on_event_domain() {
            self.off_domain_writes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn check_send(&self) -> Result<()> {
        self.note_write();
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::External("send rejected".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PlatformPort for FakePlatform {
    async fn send_message(&self, channel: ChannelId, text: &str) -> Result<()> {
        self.check_send()?;
        self.sent.lock().unwrap().push((channel, text.to_string()));
        Ok(())
    }

    async fn send_dm(&self, user: UserId, text: &str) -> Result<()> {
        self.check_send()?;
        self.dms.lock().unwrap().push((user, text.to_string()));
        Ok(())
    }

    async fn post_feed_event(&self, channel: ChannelId, event: &FeedEvent) -> Result<()> {
        self.check_send()?;
        self.feed_posts
            .lock()
            .unwrap()
            .push((channel, event.clone()));
        Ok(())
    }

    async fn create_scheduled_event(&self, event: &FeedEvent) -> Result<()> {
        self.note_write();
        self.scheduled_events.lock().unwrap().push(event.clone());
        Ok(())
    }

    async fn set_voice_mute(
        &self,
        channel: ChannelId,
        member: MemberId,
        muted: bool,
    ) -> Result<()> {
        self.note_write();
        self.mutes.lock().unwrap().push((channel, member, muted));
        Ok(())
    }

    async fn voice_roster(&self, channel: ChannelId) -> Result<Vec<RosterMember>> {
        Ok(self
            .rosters
            .lock()
            .unwrap()
            .get(&channel)
            .cloned()
            .unwrap_or_default())
    }

    async fn find_channel(&self, name: &str) -> Result<ChannelId> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.channels
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("channel {name}")))
    }

    async fn channel_name(&self, channel: ChannelId) -> Result<String> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.channels
            .lock()
            .unwrap()
            .iter()
            .find(|(_, id)| **id == channel)
            .map(|(name, _)| name.clone())
            .ok_or_else(|| Error::NotFound(format!("channel {channel}")))
    }

    async fn user_name(&self, user: UserId) -> Result<String> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(format!("user{}", user.0))
    }

    async fn fetch_history(
        &self,
        _channel: ChannelId,
        query: HistoryQuery,
    ) -> Result<Vec<HistoryMessage>> {
        self.history_queries.lock().unwrap().push(query);
        self.history
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

#[derive(Default)]
pub struct MemoryStore {
    jobs: Mutex<BTreeMap<String, ScheduledJob>>,
    feeds: Mutex<BTreeMap<String, FeedSubscription>>,
    archives: Mutex<BTreeMap<String, ArchiveJob>>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
}

impl MemoryStore {
    pub fn seed_job(&self, job: ScheduledJob) {
        self.jobs.lock().unwrap().insert(job.id.0.clone(), job);
    }

    pub fn job_ids(&self) -> Vec<String> {
        self.jobs.lock().unwrap().keys().cloned().collect()
    }

    pub fn seed_feed(&self, feed: FeedSubscription) {
        self.feeds.lock().unwrap().insert(feed.url.clone(), feed);
    }

    pub fn feed(&self, url: &str) -> Option<FeedSubscription> {
        self.feeds.lock().unwrap().get(url).cloned()
    }

    pub fn seed_archive(&self, job: ArchiveJob) {
        self.archives.lock().unwrap().insert(job.token.clone(), job);
    }

    pub fn archive_tokens(&self) -> Vec<String> {
        self.archives.lock().unwrap().keys().cloned().collect()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn check_read(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::persistence("memory", "reads disabled"));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::persistence("memory", "writes disabled"));
        }
        Ok(())
    }
}

impl PersistenceStore for MemoryStore {
    fn load_jobs(&self) -> Result<Vec<ScheduledJob>> {
        self.check_read()?;
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .values()
            .cloned()
            .map(ScheduledJob::persisted)
            .collect())
    }

    fn save_job(&self, job: &ScheduledJob) -> Result<()> {
        self.check_write()?;
        self.seed_job(job.clone());
        Ok(())
    }

    fn delete_job(&self, id: &JobId) -> Result<bool> {
        self.check_write()?;
        Ok(self.jobs.lock().unwrap().remove(&id.0).is_some())
    }

    fn load_feeds(&self) -> Result<Vec<FeedSubscription>> {
        self.check_read()?;
        Ok(self.feeds.lock().unwrap().values().cloned().collect())
    }

    fn save_feed(&self, feed: &FeedSubscription) -> Result<()> {
        self.check_write()?;
        self.seed_feed(feed.clone());
        Ok(())
    }

    fn delete_feed(&self, url: &str) -> Result<bool> {
        self.check_write()?;
        Ok(self.feeds.lock().unwrap().remove(url).is_some())
    }

    fn load_archives(&self) -> Result<Vec<ArchiveJob>> {
        self.check_read()?;
        Ok(self.archives.lock().unwrap().values().cloned().collect())
    }

    fn save_archive(&self, job: &ArchiveJob) -> Result<()> {
        self.check_write()?;
        self.seed_archive(job.clone());
        Ok(())
    }

    fn delete_archive(&self, token: &str) -> Result<bool> {
        self.check_write()?;
        Ok(self.archives.lock().unwrap().remove(token).is_some())
    }
}

/// Reports every fire (with its instant) and every persistence failure.
pub struct RecordingHandler {
    fired: mpsc::UnboundedSender<(JobId, Instant)>,
    failures_tx: mpsc::UnboundedSender<JobId>,
    failures_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<JobId>>,
}

impl RecordingHandler {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(JobId, Instant)>) {
        let (fired, rx) = mpsc::unbounded_channel();
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let handler = Arc::new(Self {
            fired,
            failures_tx,
            failures_rx: tokio::sync::Mutex::new(failures_rx),
        });
        (handler, rx)
    }

    pub async fn next_failure(&self) -> JobId {
        self.failures_rx
            .lock()
            .await
            .recv()
            .await
            .expect("handler dropped")
    }
}

#[async_trait]
impl JobHandler for RecordingHandler {
    async fn on_fire(&self, job: ScheduledJob) {
        let _ = self.fired.send((job.id, Instant::now()));
    }

    async fn on_persistence_failure(&self, job: ScheduledJob, _error: Error) {
        let _ = self.failures_tx.send(job.id);
    }
}

/// Feed source answering from a queue; an empty queue yields no events.
#[derive(Default)]
pub struct FakeFeedSource {
    results: Mutex<VecDeque<Result<Vec<FeedEvent>>>>,
    calls: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl FakeFeedSource {
    pub fn push_ok(&self, events: Vec<FeedEvent>) {
        self.results.lock().unwrap().push_back(Ok(events));
    }

    pub fn push_err(&self, err: Error) {
        self.results.lock().unwrap().push_back(Err(err));
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeedSource for FakeFeedSource {
    async fn fetch(&self, _url: &str) -> Result<Vec<FeedEvent>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.results.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(Vec::new()))
    }
}

/// Calendar entry starting `hours_from_now` hours from now.
pub fn feed_event(uid: &str, hours_from_now: i64) -> FeedEvent {
    let start = chrono::Utc::now() + chrono::Duration::hours(hours_from_now);
    FeedEvent {
        uid: uid.to_string(),
        summary: format!("Event {uid}"),
        description: None,
        location: None,
        start,
        end: Some(start + chrono::Duration::hours(1)),
        url: None,
        all_day: false,
    }
}
