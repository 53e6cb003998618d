use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{AgeCategory, MemberId, MessageId, UserId};

/// One member currently in a voice channel, as the platform reports it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterMember {
    pub member: MemberId,
    #[serde(default)]
    pub category: AgeCategory,
}

/// Page request for channel history, newest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryQuery {
    /// Only messages created at or after this instant.
    pub after: DateTime<Utc>,
    /// Only messages older than this id (exclusive); `None` starts at the newest.
    #[serde(default)]
    pub before: Option<MessageId>,
    pub limit: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub id: MessageId,
    pub author: UserId,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub attachment_urls: Vec<String>,
    #[serde(default)]
    pub embed_count: usize,
}
