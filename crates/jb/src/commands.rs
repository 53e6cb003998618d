//! Chat commands, as the host forwards them.

use std::time::Duration;

use jb_core::{
    archive::{ArchiveOutcome, ArchiveRequest},
    domain::{ChannelId, UserId},
    errors::Error,
    formatting,
    service::Automation,
    Result,
};
use serde::Deserialize;

const DEFAULT_LOG_LINES: usize = 50;
const MAX_LOG_LINES: usize = 500;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum CommandRequest {
    AddReminder {
        title: String,
        channel: ChannelId,
        #[serde(default)]
        body: String,
        interval_secs: u64,
        #[serde(default)]
        one_shot: bool,
    },
    DeleteReminder {
        title: String,
    },
    ListReminders,
    DeleteAllReminders,
    AddFeed {
        url: String,
        channel: ChannelId,
    },
    RemoveFeed {
        url: String,
    },
    ListFeeds,
    RequestArchive {
        requester: UserId,
        channel: ChannelId,
        target: UserId,
        start_date: String,
        #[serde(default)]
        limit: Option<usize>,
    },
    VoiceChaperone {
        enabled: bool,
    },
    Logs {
        #[serde(default)]
        lines: Option<usize>,
    },
}

impl CommandRequest {
    pub fn name(&self) -> &'static str {
        match self {
            CommandRequest::AddReminder { .. } => "add_reminder",
            CommandRequest::DeleteReminder { .. } => "delete_reminder",
            CommandRequest::ListReminders => "list_reminders",
            CommandRequest::DeleteAllReminders => "delete_all_reminders",
            CommandRequest::AddFeed { .. } => "add_feed",
            CommandRequest::RemoveFeed { .. } => "remove_feed",
            CommandRequest::ListFeeds => "list_feeds",
            CommandRequest::RequestArchive { .. } => "request_archive",
            CommandRequest::VoiceChaperone { .. } => "voice_chaperone",
            CommandRequest::Logs { .. } => "logs",
        }
    }

    /// Commands that wait on history pages or disk run on a worker and
    /// answer later; the rest complete on the event domain.
    pub fn needs_worker(&self) -> bool {
        matches!(
            self,
            CommandRequest::RequestArchive { .. } | CommandRequest::Logs { .. }
        )
    }
}

/// Run one command and render the reply text.
pub async fn execute(automation: &Automation, req: CommandRequest) -> Result<String> {
    tracing::info!(command = req.name(), "command received");
    match req {
        CommandRequest::AddReminder {
            title,
            channel,
            body,
            interval_secs,
            one_shot,
        } => {
            let id = automation.add_reminder(
                &title,
                channel,
                &body,
                Duration::from_secs(interval_secs),
                one_shot,
            )?;
            if one_shot {
                return Ok(format!(
                    "Reminder set in {} for {interval_secs} seconds from now. (id {id})",
                    formatting::mention_channel(channel)
                ));
            }
            Ok(formatting::reminder_added(channel, interval_secs, &id))
        }
        CommandRequest::DeleteReminder { title } => {
            automation.delete_reminder(&title)?;
            Ok(format!("Deleted reminder \"{}\".", title.trim()))
        }
        CommandRequest::ListReminders => {
            Ok(formatting::reminder_listing(&automation.list_reminders()))
        }
        CommandRequest::DeleteAllReminders => {
            let removed = automation.delete_all_reminders();
            Ok(format!("Deleted {removed} reminder(s)."))
        }
        CommandRequest::AddFeed { url, channel } => {
            let feed = automation.add_feed(&url, channel)?;
            Ok(format!(
                "Added calendar feed! New events from {} will be posted in {}.",
                feed.url,
                formatting::mention_channel(feed.target_channel)
            ))
        }
        CommandRequest::RemoveFeed { url } => {
            automation.remove_feed(&url)?;
            Ok(format!("Removed calendar feed {}.", url.trim()))
        }
        CommandRequest::ListFeeds => Ok(formatting::feed_listing(&automation.list_feeds())),
        CommandRequest::RequestArchive {
            requester,
            channel,
            target,
            start_date,
            limit,
        } => {
            let outcome = automation
                .request_archive(ArchiveRequest {
                    requester,
                    channel,
                    target,
                    start_date,
                    limit,
                })
                .await?;
            Ok(match outcome {
                ArchiveOutcome::Ready {
                    link,
                    found,
                    processed,
                } => format!(
                    "Archive ready ({found} of {processed} messages): {}\nLink expires {} UTC.",
                    link.url,
                    link.expiry_at.format("%Y-%m-%d %H:%M")
                ),
                ArchiveOutcome::Empty { processed } => {
                    formatting::archive_empty_dm(target, channel, processed)
                }
            })
        }
        CommandRequest::VoiceChaperone { enabled } => {
            let changed = automation.set_voice_chaperone(enabled).await;
            let state = if enabled { "enabled" } else { "disabled" };
            Ok(format!(
                "Voice chaperone {state} ({changed} channel(s) updated)."
            ))
        }
        CommandRequest::Logs { lines } => {
            let n = lines.unwrap_or(DEFAULT_LOG_LINES).clamp(1, MAX_LOG_LINES);
            let tail = automation.log_tail(n).await?;
            if tail.is_empty() {
                return Ok("The log is empty.".to_string());
            }
            Ok(formatting::truncate_chars(&tail.join("\n"), 1900))
        }
    }
}

/// User-facing text for a failed command.
pub fn error_reply(e: &Error) -> String {
    match e {
        Error::Invalid(msg) => msg.clone(),
        Error::NotFound(what) => format!("Could not find {what}."),
        Error::Timeout(_) => "The platform did not answer in time, please try again.".to_string(),
        Error::RateLimited { .. } => "The platform is busy, please try again shortly.".to_string(),
        Error::Shared(inner) => error_reply(inner),
        other => format!("Something went wrong: {other}"),
    }
}
