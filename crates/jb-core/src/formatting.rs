//! User-facing text. Output is platform markdown (`**bold**`, `<@id>`
//! mentions, `<#id>` channel links); the host renders it as-is.

use chrono::{DateTime, Utc};

use crate::{
    domain::{ChannelId, FeedEvent, JobId, MemberId, UserId},
    feeds::FeedSubscription,
    messaging::types::HistoryMessage,
    scheduler::{JobKind, ScheduledJob},
    Error,
};

const DESCRIPTION_LIMIT: usize = 1000;
const DATE_TIME: &str = "%Y-%m-%d %H:%M:%S";

pub fn mention_user(user: UserId) -> String {
    format!("<@{}>", user.0)
}

pub fn mention_member(member: MemberId) -> String {
    format!("<@{}>", member.0)
}

pub fn mention_channel(channel: ChannelId) -> String {
    format!("<#{}>", channel.0)
}

pub fn reminder_text(title: &str, body: &str) -> String {
    if body.trim().is_empty() {
        format!("**{title}**")
    } else {
        format!("**{title}**\n{body}")
    }
}

pub fn reminder_listing(jobs: &[ScheduledJob]) -> String {
    let lines: Vec<String> = jobs
        .iter()
        .filter_map(|job| match &job.kind {
            JobKind::Reminder {
                title,
                channel,
                body,
            } => {
                let cadence = if job.one_shot {
                    "once".to_string()
                } else {
                    format!("every {} seconds", job.interval_seconds)
                };
                Some(format!(
                    "**{title}**: {body} in {} ({cadence}, next {})",
                    mention_channel(*channel),
                    job.next_fire_at.format("%Y-%m-%d %H:%M UTC"),
                ))
            }
            JobKind::FeedPoll { .. } => None,
        })
        .collect();
    if lines.is_empty() {
        return "No reminders set.".to_string();
    }
    format!("Current reminders:\n{}", lines.join("\n"))
}

pub fn feed_listing(feeds: &[FeedSubscription]) -> String {
    if feeds.is_empty() {
        return "No calendar feeds registered.".to_string();
    }
    let lines: Vec<String> = feeds
        .iter()
        .map(|f| {
            let checked = f
                .last_checked
                .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
                .unwrap_or_else(|| "never".to_string());
            format!(
                "{} -> {} (last checked {checked})",
                f.url,
                mention_channel(f.target_channel)
            )
        })
        .collect();
    format!("Registered calendar feeds:\n{}", lines.join("\n"))
}

pub fn feed_event_text(event: &FeedEvent) -> String {
    let mut out = format!("📅 **{}**\n", event.summary.trim());

    let date = event.start.format("%Y-%m-%d");
    let time = if event.all_day {
        "All Day".to_string()
    } else {
        let end = event.effective_end();
        if end.date_naive() == event.start.date_naive() {
            format!("{} - {} UTC", event.start.format("%H:%M"), end.format("%H:%M"))
        } else {
            format!("{} UTC", event.start.format("%H:%M"))
        }
    };
    out.push_str(&format!("**Date:** {date}\n**Time:** {time}\n"));

    if let Some(location) = event.location.as_deref().filter(|s| !s.trim().is_empty()) {
        out.push_str(&format!("**Location:** {}\n", location.trim()));
    }
    if let Some(desc) = event.description.as_deref().filter(|s| !s.trim().is_empty()) {
        out.push_str(&format!("📝 {}\n", truncate_chars(desc.trim(), DESCRIPTION_LIMIT)));
    }
    if let Some(url) = event.url.as_deref() {
        out.push_str(url);
        out.push('\n');
    }
    out.trim_end().to_string()
}

pub fn voice_alert(channel: ChannelId, adult: MemberId, child: MemberId) -> String {
    format!(
        "🚨 **ALERT**: There is only one adult ({}) and one child ({}) currently in {}\n\n\
         Both have been muted for safety.",
        mention_member(adult),
        mention_member(child),
        mention_channel(channel),
    )
}

pub fn lock_contention_alert(channel: ChannelId) -> String {
    format!(
        "⚠️ Voice safety check for {} was skipped: channel state is busy. Please check the channel.",
        mention_channel(channel)
    )
}

pub fn feed_failure_alert(url: &str, failures: u32, err: &Error) -> String {
    format!("⚠️ Calendar feed {url} failed {failures} times in a row. Last error: {err}")
}

pub fn persistence_failure_alert(job: &ScheduledJob, err: &Error) -> String {
    let what = match &job.kind {
        JobKind::Reminder { title, .. } => format!("reminder \"{title}\""),
        JobKind::FeedPoll { url, .. } => format!("feed poll for {url}"),
    };
    format!("⚠️ Could not save {what}; it keeps running but may not survive a restart. ({err})")
}

pub fn reminder_added(channel: ChannelId, interval_seconds: u64, id: &JobId) -> String {
    format!(
        "Reminder set in {} every {interval_seconds} seconds. (id {id})",
        mention_channel(channel)
    )
}

/// One archived message: `[YYYY-MM-DD HH:MM:SS] content`, then attachment
/// urls and embed count when present, then a blank line.
pub fn archive_entry(msg: &HistoryMessage) -> String {
    let content = if msg.content.trim().is_empty() {
        "[No text content]"
    } else {
        msg.content.as_str()
    };
    let mut out = format!("[{}] {content}", msg.created_at.format(DATE_TIME));
    if !msg.attachment_urls.is_empty() {
        out.push_str(&format!("\nAttachments: {}", msg.attachment_urls.join(", ")));
    }
    if msg.embed_count > 0 {
        out.push_str(&format!("\nEmbeds: {} embed(s)", msg.embed_count));
    }
    out.push_str("\n\n");
    out
}

pub struct ArchiveSummary<'a> {
    pub target: UserId,
    pub target_name: &'a str,
    pub channel_name: &'a str,
    pub start_date: &'a str,
    pub found: usize,
    pub processed: usize,
}

pub fn archive_header(s: &ArchiveSummary<'_>, created_at: DateTime<Utc>) -> String {
    format!(
        "Messages from {} (ID: {}) in #{}\n\
         Dump created at: {}\n\
         Start date: {}\n\
         Messages found: {}\n\
         Total messages processed: {}\n\n\
         {}\n\n",
        s.target_name,
        s.target.0,
        s.channel_name,
        created_at.format(DATE_TIME),
        s.start_date,
        s.found,
        s.processed,
        "=".repeat(50),
    )
}

pub fn archive_ready_dm(
    s: &ArchiveSummary<'_>,
    channel: ChannelId,
    url: &str,
    expires_at: DateTime<Utc>,
    ttl_minutes: i64,
) -> String {
    format!(
        "Here's the message archive you requested from {}:\n\n\
         **Download Link:** {url}\n\
         **User:** {}\n\
         **Start Date:** {}\n\
         **Messages found:** {}\n\
         **Messages processed:** {}\n\
         **Link expires:** {} UTC ({ttl_minutes} minutes from now)\n\n\
         The file will be automatically deleted after the link expires.",
        mention_channel(channel),
        mention_user(s.target),
        s.start_date,
        s.found,
        s.processed,
        expires_at.format(DATE_TIME),
    )
}

pub fn archive_empty_dm(target: UserId, channel: ChannelId, processed: usize) -> String {
    format!(
        "No messages found from {} in {} ({processed} messages checked).",
        mention_user(target),
        mention_channel(channel)
    )
}

pub fn archive_failed_dm(channel: ChannelId, err: &Error) -> String {
    format!(
        "Sorry, the message archive for {} could not be created: {err}",
        mention_channel(channel)
    )
}

pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars).collect();
    out.push_str("...");
    out
}
