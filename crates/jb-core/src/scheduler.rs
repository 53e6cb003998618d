//! Timer engine for reminders and feed polling.
//!
//! - One loop task sleeps until the earliest `next_fire_at` and is woken early
//!   by `schedule`/`cancel`.
//! - Due jobs are handed to the event domain; the loop never runs job code.
//! - After a fire the job moves forward by whole intervals past "now", so a
//!   stalled process never replays a backlog.
//! - Persisted jobs are written by a single writer task in the order the
//!   schedule changed; write failures are logged, reported to the handler and
//!   otherwise ignored (the job stays armed).

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    fmt,
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::{
    bridge::DomainBridge,
    domain::{ChannelId, JobId},
    persistence::PersistenceStore,
    Error, Result,
};

/// Upper bound on one sleep when nothing is scheduled.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

/// What to do with jobs whose fire time passed while the process was down.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MissedFirePolicy {
    /// Fire once right away, then resume the normal cadence.
    #[default]
    FireOnce,
    /// Drop missed fires and wait for the next slot on the original grid.
    Skip,
}

impl FromStr for MissedFirePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "fire_once" | "once" => Ok(Self::FireOnce),
            "skip" => Ok(Self::Skip),
            other => Err(Error::Config(format!(
                "unknown missed fire policy {other:?} (expected fire_once or skip)"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobKind {
    Reminder {
        title: String,
        channel: ChannelId,
        body: String,
    },
    FeedPoll {
        url: String,
        channel: ChannelId,
    },
}

impl JobKind {
    pub fn label(&self) -> &'static str {
        match self {
            JobKind::Reminder { .. } => "reminder",
            JobKind::FeedPoll { .. } => "feed_poll",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: JobId,
    pub kind: JobKind,
    pub interval_seconds: u64,
    pub next_fire_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub one_shot: bool,
    /// Whether the job is mirrored in the store. Never serialized: everything
    /// read back from the store is persisted by definition.
    #[serde(skip)]
    pub persisted: bool,
}

impl ScheduledJob {
    /// Recurring job whose first fire is one interval from now.
    pub fn recurring(kind: JobKind, interval: Duration) -> Self {
        let now = Utc::now();
        let interval_seconds = interval.as_secs().max(1);
        Self {
            id: JobId::generate(),
            kind,
            interval_seconds,
            next_fire_at: now + chrono::Duration::seconds(interval_seconds as i64),
            created_at: now,
            one_shot: false,
            persisted: false,
        }
    }

    /// Job that fires once, `delay` from now, and is then removed.
    pub fn once(kind: JobKind, delay: Duration) -> Self {
        Self {
            one_shot: true,
            ..Self::recurring(kind, delay)
        }
    }

    pub fn starting_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_fire_at = at;
        self
    }

    pub fn persisted(mut self) -> Self {
        self.persisted = true;
        self
    }

    pub fn interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.interval_seconds.max(1) as i64)
    }

    pub fn reminder_title(&self) -> Option<&str> {
        match &self.kind {
            JobKind::Reminder { title, .. } => Some(title),
            JobKind::FeedPoll { .. } => None,
        }
    }
}

/// Receives fired jobs on the event domain.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn on_fire(&self, job: ScheduledJob);
    async fn on_persistence_failure(&self, job: ScheduledJob, error: Error);
}

#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    store: Arc<dyn PersistenceStore>,
    bridge: DomainBridge,
    policy: MissedFirePolicy,
    state: Mutex<ScheduleState>,
    wake: Notify,
    shutdown: CancellationToken,
    writes: mpsc::UnboundedSender<PersistOp>,
    pending_start: Mutex<Option<mpsc::UnboundedReceiver<PersistOp>>>,
}

#[derive(Default)]
struct ScheduleState {
    jobs: HashMap<JobId, ScheduledJob>,
    // Min-heap on fire time. Entries whose time no longer matches the job are
    // stale and skipped.
    queue: BinaryHeap<Reverse<(DateTime<Utc>, JobId)>>,
}

enum PersistOp {
    Save(ScheduledJob),
    Delete(ScheduledJob),
}

struct PersistFailure {
    job: ScheduledJob,
    error: Error,
}

impl JobScheduler {
    pub fn new(
        store: Arc<dyn PersistenceStore>,
        bridge: DomainBridge,
        policy: MissedFirePolicy,
    ) -> Self {
        let (writes, pending) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                bridge,
                policy,
                state: Mutex::new(ScheduleState::default()),
                wake: Notify::new(),
                shutdown: CancellationToken::new(),
                writes,
                pending_start: Mutex::new(Some(pending)),
            }),
        }
    }

    /// Reload persisted jobs and start the timer loop. Returns how many jobs
    /// were rehydrated.
    ///
    /// A store that cannot be read is logged and treated as empty.
    pub async fn start(&self, handler: Arc<dyn JobHandler>) -> Result<usize> {
        let Some(writes) = lock(&self.inner.pending_start).take() else {
            return Err(Error::Invalid("scheduler already started".to_string()));
        };

        let store = self.inner.store.clone();
        let loaded = match self
            .inner
            .bridge
            .run_in_background(move || store.load_jobs())
            .await
        {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::error!(error = %e, "failed to load persisted jobs, starting empty");
                Vec::new()
            }
        };

        let now = Utc::now();
        let count = loaded.len();
        {
            let mut st = lock(&self.inner.state);
            for mut job in loaded {
                let overdue = job.next_fire_at <= now;
                job.next_fire_at = rehydrated_fire_time(&job, now, self.inner.policy);
                tracing::info!(
                    job_id = %job.id,
                    kind = job.kind.label(),
                    overdue,
                    next_fire_at = %job.next_fire_at,
                    "rehydrated job"
                );
                st.insert(job);
            }
        }

        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(
            self.inner.store.clone(),
            self.inner.bridge.clone(),
            writes,
            failures_tx,
        ));
        tokio::spawn(run_timer_loop(self.inner.clone(), handler, failures_rx));
        self.inner.wake.notify_one();

        tracing::info!(count, policy = ?self.inner.policy, "scheduler started");
        Ok(count)
    }

    pub fn schedule(&self, job: ScheduledJob) -> JobId {
        let id = job.id.clone();
        {
            let mut st = lock(&self.inner.state);
            if job.persisted {
                self.inner.enqueue(PersistOp::Save(job.clone()));
            }
            st.insert(job);
        }
        self.inner.wake.notify_one();
        id
    }

    /// Schedule `job` unless an existing job satisfies `conflicts`.
    /// Check and insert happen under one lock.
    pub fn schedule_unless(
        &self,
        job: ScheduledJob,
        conflicts: impl Fn(&ScheduledJob) -> bool,
    ) -> Option<JobId> {
        let id = job.id.clone();
        {
            let mut st = lock(&self.inner.state);
            if st.jobs.values().any(|existing| conflicts(existing)) {
                return None;
            }
            if job.persisted {
                self.inner.enqueue(PersistOp::Save(job.clone()));
            }
            st.insert(job);
        }
        self.inner.wake.notify_one();
        Some(id)
    }

    pub fn cancel(&self, id: &JobId) -> bool {
        let removed = {
            let mut st = lock(&self.inner.state);
            let removed = st.jobs.remove(id);
            if let Some(job) = removed.as_ref().filter(|j| j.persisted) {
                self.inner.enqueue(PersistOp::Delete(job.clone()));
            }
            removed
        };
        if removed.is_some() {
            self.inner.wake.notify_one();
        }
        removed.is_some()
    }

    /// Cancel every job matching `pred`; returns the removed jobs.
    pub fn cancel_matching(&self, pred: impl Fn(&ScheduledJob) -> bool) -> Vec<ScheduledJob> {
        let removed = {
            let mut st = lock(&self.inner.state);
            let ids: Vec<JobId> = st
                .jobs
                .values()
                .filter(|j| pred(j))
                .map(|j| j.id.clone())
                .collect();
            let mut removed = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(job) = st.jobs.remove(&id) {
                    if job.persisted {
                        self.inner.enqueue(PersistOp::Delete(job.clone()));
                    }
                    removed.push(job);
                }
            }
            removed
        };
        if !removed.is_empty() {
            self.inner.wake.notify_one();
        }
        removed
    }

    pub fn cancel_all(&self) -> usize {
        self.cancel_matching(|_| true).len()
    }

    /// Live jobs ordered by next fire time.
    pub fn list(&self) -> Vec<ScheduledJob> {
        let mut jobs: Vec<_> = lock(&self.inner.state).jobs.values().cloned().collect();
        jobs.sort_by(|a, b| {
            a.next_fire_at
                .cmp(&b.next_fire_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        jobs
    }

    pub fn get(&self, id: &JobId) -> Option<ScheduledJob> {
        lock(&self.inner.state).jobs.get(id).cloned()
    }

    /// Stop the timer loop. Jobs stay in the store; non-persisted jobs are gone.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

impl fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobScheduler")
            .field("jobs", &lock(&self.inner.state).jobs.len())
            .field("policy", &self.inner.policy)
            .finish()
    }
}

impl SchedulerInner {
    fn enqueue(&self, op: PersistOp) {
        if self.writes.send(op).is_err() {
            tracing::warn!("job writer stopped, dropping persistence update");
        }
    }
}

impl ScheduleState {
    fn insert(&mut self, job: ScheduledJob) {
        self.queue.push(Reverse((job.next_fire_at, job.id.clone())));
        self.jobs.insert(job.id.clone(), job);
    }

    fn is_live(&self, at: &DateTime<Utc>, id: &JobId) -> bool {
        self.jobs
            .get(id)
            .map(|job| job.next_fire_at == *at)
            .unwrap_or(false)
    }

    fn next_deadline(&mut self) -> Option<DateTime<Utc>> {
        while let Some(Reverse((at, id))) = self.queue.peek() {
            if self.is_live(at, id) {
                return Some(*at);
            }
            self.queue.pop();
        }
        None
    }

    /// Pop every job due at `now`, re-arming recurring ones.
    fn take_due(&mut self, now: DateTime<Utc>, writes: &SchedulerInner) -> Vec<ScheduledJob> {
        let mut fired = Vec::new();
        while let Some(Reverse((at, _))) = self.queue.peek() {
            if *at > now {
                break;
            }
            let Some(Reverse((at, id))) = self.queue.pop() else {
                break;
            };
            if !self.is_live(&at, &id) {
                continue;
            }

            let job = if self.jobs.get(&id).map(|j| j.one_shot).unwrap_or(false) {
                let Some(job) = self.jobs.remove(&id) else {
                    continue;
                };
                if job.persisted {
                    writes.enqueue(PersistOp::Delete(job.clone()));
                }
                job
            } else {
                let Some(job) = self.jobs.get_mut(&id) else {
                    continue;
                };
                let snapshot = job.clone();
                job.next_fire_at = advance_past(at, job.interval(), now);
                let rearmed = job.clone();
                if rearmed.persisted {
                    writes.enqueue(PersistOp::Save(rearmed.clone()));
                }
                self.queue.push(Reverse((rearmed.next_fire_at, rearmed.id)));
                snapshot
            };
            fired.push(job);
        }
        fired
    }
}

async fn run_timer_loop(
    inner: Arc<SchedulerInner>,
    handler: Arc<dyn JobHandler>,
    mut failures: mpsc::UnboundedReceiver<PersistFailure>,
) {
    loop {
        let (due, next) = {
            let mut st = lock(&inner.state);
            let due = st.take_due(Utc::now(), &inner);
            (due, st.next_deadline())
        };

        for job in due {
            tracing::debug!(job_id = %job.id, kind = job.kind.label(), "firing job");
            let handler = handler.clone();
            let posted = inner
                .bridge
                .run_on_event_domain(move || async move { handler.on_fire(job).await })
                .await;
            if let Err(e) = posted {
                tracing::warn!(error = %e, "event domain gone, scheduler loop exiting");
                return;
            }
        }

        let wait = next
            .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(IDLE_WAIT);

        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = inner.wake.notified() => {}
            _ = tokio::time::sleep(wait) => {}
            Some(failure) = failures.recv() => {
                let handler = handler.clone();
                let posted = inner
                    .bridge
                    .run_on_event_domain(move || async move {
                        handler.on_persistence_failure(failure.job, failure.error).await
                    })
                    .await;
                if let Err(e) = posted {
                    tracing::warn!(error = %e, "could not report persistence failure");
                }
            }
        }
    }
    tracing::info!("scheduler loop stopped");
}

/// Applies store writes in queue order, batching whatever is already queued.
async fn run_writer(
    store: Arc<dyn PersistenceStore>,
    bridge: DomainBridge,
    mut ops: mpsc::UnboundedReceiver<PersistOp>,
    failures: mpsc::UnboundedSender<PersistFailure>,
) {
    while let Some(first) = ops.recv().await {
        let mut batch = vec![first];
        while let Ok(op) = ops.try_recv() {
            batch.push(op);
        }

        let store = store.clone();
        let applied = bridge
            .run_in_background(move || Ok(apply_batch(store.as_ref(), batch)))
            .await;
        match applied {
            Ok(failed) => {
                for failure in failed {
                    tracing::error!(
                        job_id = %failure.job.id,
                        error = %failure.error,
                        "failed to persist job"
                    );
                    let _ = failures.send(failure);
                }
            }
            Err(e) => tracing::error!(error = %e, "job writer batch aborted"),
        }
    }
}

fn apply_batch(store: &dyn PersistenceStore, batch: Vec<PersistOp>) -> Vec<PersistFailure> {
    let mut failed = Vec::new();
    for op in batch {
        let (job, res) = match op {
            PersistOp::Save(job) => {
                let res = store.save_job(&job);
                (job, res)
            }
            PersistOp::Delete(job) => {
                let res = store.delete_job(&job.id).map(|_| ());
                (job, res)
            }
        };
        if let Err(error) = res {
            failed.push(PersistFailure { job, error });
        }
    }
    failed
}

/// First point on the `from + k * interval` grid (k >= 1) strictly after `now`.
pub fn advance_past(
    from: DateTime<Utc>,
    interval: chrono::Duration,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let step = interval.num_milliseconds().max(1);
    let next = from + chrono::Duration::milliseconds(step);
    if next > now {
        return next;
    }
    let behind = (now - next).num_milliseconds();
    next + chrono::Duration::milliseconds(step * (behind / step + 1))
}

fn rehydrated_fire_time(
    job: &ScheduledJob,
    now: DateTime<Utc>,
    policy: MissedFirePolicy,
) -> DateTime<Utc> {
    if job.next_fire_at > now {
        return job.next_fire_at;
    }
    match policy {
        MissedFirePolicy::FireOnce => now,
        MissedFirePolicy::Skip if job.one_shot => now,
        MissedFirePolicy::Skip => advance_past(job.next_fire_at, job.interval(), now),
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
