//! Recurring channel reminders, keyed by title.

use std::{sync::Arc, time::Duration};

use crate::{
    domain::{ChannelId, JobId},
    formatting,
    messaging::port::PlatformPort,
    scheduler::{JobKind, JobScheduler, ScheduledJob},
    Error, Result,
};

pub struct ReminderService {
    scheduler: JobScheduler,
    platform: Arc<dyn PlatformPort>,
    min_interval: Duration,
}

impl ReminderService {
    pub fn new(
        scheduler: JobScheduler,
        platform: Arc<dyn PlatformPort>,
        min_interval: Duration,
    ) -> Self {
        Self {
            scheduler,
            platform,
            min_interval,
        }
    }

    /// Schedule a persisted reminder. Titles are unique; `one_shot` reminders
    /// fire once after `interval` and are then forgotten.
    pub fn add(
        &self,
        title: &str,
        channel: ChannelId,
        body: &str,
        interval: Duration,
        one_shot: bool,
    ) -> Result<JobId> {
        let title = title.trim();
        if title.is_empty() {
            return Err(Error::Invalid("reminder title is empty".to_string()));
        }
        if interval < self.min_interval {
            return Err(Error::Invalid(format!(
                "interval must be at least {} seconds",
                self.min_interval.as_secs()
            )));
        }

        let kind = JobKind::Reminder {
            title: title.to_string(),
            channel,
            body: body.trim().to_string(),
        };
        let job = if one_shot {
            ScheduledJob::once(kind, interval)
        } else {
            ScheduledJob::recurring(kind, interval)
        }
        .persisted();

        let id = self
            .scheduler
            .schedule_unless(job, |existing| existing.reminder_title() == Some(title))
            .ok_or_else(|| Error::Invalid(format!("a reminder titled \"{title}\" already exists")))?;
        tracing::info!(job_id = %id, title, channel = %channel, interval_secs = interval.as_secs(), one_shot, "reminder added");
        Ok(id)
    }

    pub fn delete(&self, title: &str) -> Result<()> {
        let title = title.trim();
        let removed = self
            .scheduler
            .cancel_matching(|job| job.reminder_title() == Some(title));
        if removed.is_empty() {
            return Err(Error::NotFound(format!("reminder \"{title}\"")));
        }
        tracing::info!(title, "reminder deleted");
        Ok(())
    }

    pub fn list(&self) -> Vec<ScheduledJob> {
        self.scheduler
            .list()
            .into_iter()
            .filter(|job| matches!(job.kind, JobKind::Reminder { .. }))
            .collect()
    }

    /// Remove every reminder (feed polls are left alone).
    pub fn delete_all(&self) -> usize {
        let removed = self
            .scheduler
            .cancel_matching(|job| matches!(job.kind, JobKind::Reminder { .. }))
            .len();
        tracing::info!(removed, "all reminders deleted");
        removed
    }

    /// Post a fired reminder to its channel.
    pub async fn deliver(&self, job: &ScheduledJob) -> Result<()> {
        let JobKind::Reminder {
            title,
            channel,
            body,
        } = &job.kind
        else {
            return Err(Error::Invalid(format!("job {} is not a reminder", job.id)));
        };
        self.platform
            .send_message(*channel, &formatting::reminder_text(title, body))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bridge::event_domain,
        scheduler::MissedFirePolicy,
        testing::{FakePlatform, MemoryStore},
    };

    fn service() -> (ReminderService, Arc<FakePlatform>) {
        let (bridge, _domain) = event_domain(8);
        let store = Arc::new(MemoryStore::default());
        let scheduler = JobScheduler::new(store, bridge, MissedFirePolicy::FireOnce);
        let platform = Arc::new(FakePlatform::default());
        (
            ReminderService::new(scheduler, platform.clone(), Duration::from_secs(60)),
            platform,
        )
    }

    #[test]
    fn add_validates_interval_and_title() {
        let (svc, _) = service();
        let err = svc
            .add("tick", ChannelId(1), "", Duration::from_secs(59), false)
            .unwrap_err();
        assert!(err.to_string().contains("at least 60 seconds"));
        assert!(svc
            .add("  ", ChannelId(1), "", Duration::from_secs(60), false)
            .is_err());
        assert!(svc
            .add("tick", ChannelId(1), "", Duration::from_secs(60), false)
            .is_ok());
    }

    #[test]
    fn titles_are_unique() {
        let (svc, _) = service();
        svc.add("daily-standup", ChannelId(1), "join", Duration::from_secs(3600), false)
            .unwrap();
        let err = svc
            .add("daily-standup", ChannelId(2), "again", Duration::from_secs(3600), false)
            .unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
        assert_eq!(svc.list().len(), 1);
    }

    #[test]
    fn delete_removes_only_that_title() {
        let (svc, _) = service();
        svc.add("daily-standup", ChannelId(1), "", Duration::from_secs(3600), false)
            .unwrap();
        svc.add("retro", ChannelId(1), "", Duration::from_secs(7200), false)
            .unwrap();

        svc.delete("daily-standup").unwrap();
        let titles: Vec<_> = svc
            .list()
            .iter()
            .filter_map(|j| j.reminder_title().map(str::to_string))
            .collect();
        assert_eq!(titles, vec!["retro"]);
        assert!(matches!(svc.delete("daily-standup"), Err(Error::NotFound(_))));
    }

    #[test]
    fn delete_all_spares_feed_polls() {
        let (svc, _) = service();
        svc.add("a", ChannelId(1), "", Duration::from_secs(60), false)
            .unwrap();
        svc.add("b", ChannelId(1), "", Duration::from_secs(60), true)
            .unwrap();
        svc.scheduler.schedule(ScheduledJob::recurring(
            JobKind::FeedPoll {
                url: "https://example.org/a.ics".into(),
                channel: ChannelId(2),
            },
            Duration::from_secs(3600),
        ));

        assert_eq!(svc.delete_all(), 2);
        assert!(svc.list().is_empty());
        assert_eq!(svc.scheduler.list().len(), 1);
    }

    #[tokio::test]
    async fn deliver_posts_formatted_text() {
        let (svc, platform) = service();
        let id = svc
            .add("Standup", ChannelId(3), "Join now", Duration::from_secs(60), false)
            .unwrap();
        let job = svc.scheduler.get(&id).unwrap();
        svc.deliver(&job).await.unwrap();
        assert_eq!(platform.sent_texts(ChannelId(3)), vec!["**Standup**\nJoin now"]);
    }
}
