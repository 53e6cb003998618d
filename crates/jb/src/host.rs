//! Newline-delimited JSON host protocol.
//!
//! The chat platform lives on the other side of stdin/stdout. Platform
//! actions go out fire-and-forget; lookups go out as queries and wait for a
//! matching `reply` line.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use jb_core::{
    domain::{ChannelId, FeedEvent, MemberId, UserId},
    errors::Error,
    messaging::{
        port::PlatformPort,
        types::{HistoryMessage, HistoryQuery, RosterMember},
    },
    service::Automation,
    voice::RosterDelta,
    Result,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, oneshot},
};

use crate::commands::{self, CommandRequest};

/// One line from the host.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    Command {
        id: String,
        request: CommandRequest,
    },
    Voice {
        channel: ChannelId,
        delta: RosterDelta,
    },
    Reply {
        id: u64,
        #[serde(default)]
        ok: Option<serde_json::Value>,
        #[serde(default)]
        error: Option<HostError>,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct HostError {
    pub message: String,
    /// Set when the platform throttled the call.
    #[serde(default)]
    pub retry_after_ms: Option<u64>,
    #[serde(default)]
    pub not_found: bool,
}

impl From<HostError> for Error {
    fn from(e: HostError) -> Self {
        if let Some(ms) = e.retry_after_ms {
            Error::RateLimited {
                retry_after: Duration::from_millis(ms),
            }
        } else if e.not_found {
            Error::NotFound(e.message)
        } else {
            Error::External(e.message)
        }
    }
}

/// One line to the host.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    Response { id: String, ok: bool, text: String },
    Action { action: Action },
    Query { id: u64, query: Query },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    SendMessage {
        channel: ChannelId,
        text: String,
    },
    SendDm {
        user: UserId,
        text: String,
    },
    PostFeedEvent {
        channel: ChannelId,
        event: FeedEvent,
    },
    CreateScheduledEvent {
        event: FeedEvent,
    },
    SetVoiceMute {
        channel: ChannelId,
        member: MemberId,
        muted: bool,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "query", rename_all = "snake_case")]
pub enum Query {
    VoiceRoster {
        channel: ChannelId,
    },
    FindChannel {
        name: String,
    },
    ChannelName {
        channel: ChannelId,
    },
    UserName {
        user: UserId,
    },
    FetchHistory {
        channel: ChannelId,
        #[serde(flatten)]
        history: HistoryQuery,
    },
}

type ReplyResult = std::result::Result<serde_json::Value, HostError>;

/// `PlatformPort` over the host protocol.
pub struct StdioPlatform {
    out: mpsc::UnboundedSender<Outbound>,
    pending: Mutex<HashMap<u64, oneshot::Sender<ReplyResult>>>,
    next_id: AtomicU64,
    query_timeout: Duration,
}

impl StdioPlatform {
    pub fn new(out: mpsc::UnboundedSender<Outbound>, query_timeout: Duration) -> Self {
        Self {
            out,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            query_timeout,
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<ReplyResult>>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn emit(&self, line: Outbound) -> Result<()> {
        self.out
            .send(line)
            .map_err(|_| Error::External("host output is closed".to_string()))
    }

    fn act(&self, action: Action) -> Result<()> {
        self.emit(Outbound::Action { action })
    }

    async fn query<T: DeserializeOwned>(&self, query: Query) -> Result<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(id, tx);

        if let Err(e) = self.emit(Outbound::Query { id, query }) {
            self.lock_pending().remove(&id);
            return Err(e);
        }

        let reply = match tokio::time::timeout(self.query_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(Error::Canceled),
            Err(_) => {
                self.lock_pending().remove(&id);
                tracing::warn!(query_id = id, "host query timed out");
                return Err(Error::Timeout(self.query_timeout));
            }
        };
        let value = reply.map_err(Error::from)?;
        Ok(serde_json::from_value(value)?)
    }

    /// Hand a reply to the query waiting for it.
    pub fn resolve(&self, id: u64, reply: ReplyResult) {
        match self.lock_pending().remove(&id) {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => tracing::warn!(query_id = id, "reply for unknown or expired query"),
        }
    }

    /// Fail every waiting query; used when the host goes away.
    pub fn abandon_all(&self) {
        let drained: Vec<_> = self.lock_pending().drain().collect();
        if !drained.is_empty() {
            tracing::warn!(count = drained.len(), "abandoning pending host queries");
        }
    }
}

#[async_trait]
impl PlatformPort for StdioPlatform {
    async fn send_message(&self, channel: ChannelId, text: &str) -> Result<()> {
        self.act(Action::SendMessage {
            channel,
            text: text.to_string(),
        })
    }

    async fn send_dm(&self, user: UserId, text: &str) -> Result<()> {
        self.act(Action::SendDm {
            user,
            text: text.to_string(),
        })
    }

    async fn post_feed_event(&self, channel: ChannelId, event: &FeedEvent) -> Result<()> {
        self.act(Action::PostFeedEvent {
            channel,
            event: event.clone(),
        })
    }

    async fn create_scheduled_event(&self, event: &FeedEvent) -> Result<()> {
        self.act(Action::CreateScheduledEvent {
            event: event.clone(),
        })
    }

    async fn set_voice_mute(
        &self,
        channel: ChannelId,
        member: MemberId,
        muted: bool,
    ) -> Result<()> {
        self.act(Action::SetVoiceMute {
            channel,
            member,
            muted,
        })
    }

    async fn voice_roster(&self, channel: ChannelId) -> Result<Vec<RosterMember>> {
        self.query(Query::VoiceRoster { channel }).await
    }

    async fn find_channel(&self, name: &str) -> Result<ChannelId> {
        self.query(Query::FindChannel {
            name: name.to_string(),
        })
        .await
    }

    async fn channel_name(&self, channel: ChannelId) -> Result<String> {
        self.query(Query::ChannelName { channel }).await
    }

    async fn user_name(&self, user: UserId) -> Result<String> {
        self.query(Query::UserName { user }).await
    }

    async fn fetch_history(
        &self,
        channel: ChannelId,
        history: HistoryQuery,
    ) -> Result<Vec<HistoryMessage>> {
        self.query(Query::FetchHistory { channel, history }).await
    }
}

/// Write outbound lines until every sender is gone.
pub async fn write_outbound<W>(mut rx: mpsc::UnboundedReceiver<Outbound>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = rx.recv().await {
        let mut buf = serde_json::to_vec(&line)?;
        buf.push(b'\n');
        writer.write_all(&buf).await?;
        writer.flush().await?;
    }
    Ok(())
}

/// Host input that has to run on the event domain.
enum Dispatch {
    Command { id: String, request: CommandRequest },
    Voice { channel: ChannelId, delta: RosterDelta },
}

/// Read inbound lines until EOF.
///
/// Commands and voice events are posted to the event domain in arrival
/// order. Replies are resolved right here, so a domain callback waiting on a
/// query never waits on the reader.
pub async fn read_inbound<R>(
    reader: R,
    platform: Arc<StdioPlatform>,
    automation: Arc<Automation>,
    out: mpsc::UnboundedSender<Outbound>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let dispatcher = tokio::spawn(dispatch(rx, automation.clone(), out));

    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let inbound = match serde_json::from_str::<Inbound>(&line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring malformed host line");
                continue;
            }
        };

        let item = match inbound {
            Inbound::Command { id, request } => Dispatch::Command { id, request },
            Inbound::Voice { channel, delta } => Dispatch::Voice { channel, delta },
            Inbound::Reply { id, ok, error } => {
                let reply = match (ok, error) {
                    (_, Some(err)) => Err(err),
                    (Some(value), None) => Ok(value),
                    (None, None) => Ok(serde_json::Value::Null),
                };
                platform.resolve(id, reply);
                continue;
            }
        };
        if tx.send(item).is_err() {
            tracing::error!("host dispatcher stopped");
            break;
        }
    }

    tracing::info!("host closed stdin");
    drop(tx);
    let _ = dispatcher.await;
    // No more replies can arrive.
    platform.abandon_all();

    let (done_tx, done_rx) = oneshot::channel();
    let flushed = automation
        .bridge()
        .run_on_event_domain(move || async move {
            let _ = done_tx.send(());
        })
        .await;
    if flushed.is_ok() {
        let _ = done_rx.await;
    }
    Ok(())
}

async fn dispatch(
    mut rx: mpsc::UnboundedReceiver<Dispatch>,
    automation: Arc<Automation>,
    out: mpsc::UnboundedSender<Outbound>,
) {
    let bridge = automation.bridge().clone();
    while let Some(item) = rx.recv().await {
        let automation = automation.clone();
        let posted = match item {
            Dispatch::Command { id, request } => {
                let out = out.clone();
                bridge
                    .run_on_event_domain(move || run_command(automation, out, id, request))
                    .await
            }
            Dispatch::Voice { channel, delta } => {
                bridge
                    .run_on_event_domain(move || async move {
                        // Errors are logged and escalated inside the service.
                        let _ = automation.on_voice_roster_changed(channel, delta).await;
                    })
                    .await
            }
        };
        if let Err(e) = posted {
            tracing::error!(error = %e, "dropping host input");
            break;
        }
    }
}

/// Runs on the event domain.
async fn run_command(
    automation: Arc<Automation>,
    out: mpsc::UnboundedSender<Outbound>,
    id: String,
    request: CommandRequest,
) {
    let name = request.name();
    if !request.needs_worker() {
        let result = commands::execute(&automation, request).await;
        respond(&out, id, name, result);
        return;
    }

    let bridge = automation.bridge().clone();
    let work = bridge.spawn_worker(async move {
        Ok(commands::execute(&automation, request).await)
    });
    bridge.then(work, move |result: Result<Result<String>>| async move {
        respond(&out, id, name, result.and_then(|r| r));
    });
}

fn respond(out: &mpsc::UnboundedSender<Outbound>, id: String, name: &str, result: Result<String>) {
    let (ok, text) = match result {
        Ok(text) => (true, text),
        Err(e) => {
            tracing::warn!(command = name, error = %e, "command failed");
            (false, commands::error_reply(&e))
        }
    };
    if out.send(Outbound::Response { id, ok, text }).is_err() {
        tracing::warn!(command = name, "response dropped, host output closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use jb_core::{
        bridge::event_domain, config::Config, domain::MessageId, persistence::JsonFileStore,
    };
    use jb_ical::IcalFeedSource;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn platform(timeout: Duration) -> (Arc<StdioPlatform>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(StdioPlatform::new(tx, timeout)), rx)
    }

    #[tokio::test]
    async fn actions_are_written_as_json_lines() {
        let (p, rx) = platform(Duration::from_secs(1));
        p.send_message(ChannelId(7), "hello").await.unwrap();
        p.set_voice_mute(ChannelId(8), MemberId(2), true).await.unwrap();
        drop(p);

        let mut buf = Vec::new();
        write_outbound(rx, &mut buf).await.unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(
            lines[0],
            json!({"type": "action", "action": {"action": "send_message", "channel": 7, "text": "hello"}})
        );
        assert_eq!(lines[1]["action"]["action"], "set_voice_mute");
        assert_eq!(lines[1]["action"]["muted"], true);
    }

    #[tokio::test]
    async fn query_resolves_from_reply() {
        let (p, mut rx) = platform(Duration::from_secs(1));
        let waiter = {
            let p = p.clone();
            tokio::spawn(async move { p.find_channel("general").await })
        };

        let Some(Outbound::Query { id, query }) = rx.recv().await else {
            panic!("expected a query line");
        };
        assert_eq!(
            query,
            Query::FindChannel {
                name: "general".into()
            }
        );
        p.resolve(id, Ok(json!(42)));

        assert_eq!(waiter.await.unwrap().unwrap(), ChannelId(42));
    }

    #[tokio::test]
    async fn host_errors_map_to_core_errors() {
        let (p, mut rx) = platform(Duration::from_secs(1));
        let waiter = {
            let p = p.clone();
            tokio::spawn(async move {
                p.fetch_history(
                    ChannelId(1),
                    HistoryQuery {
                        after: Utc::now(),
                        before: None,
                        limit: 100,
                    },
                )
                .await
            })
        };

        let Some(Outbound::Query { id, .. }) = rx.recv().await else {
            panic!("expected a query line");
        };
        p.resolve(
            id,
            Err(HostError {
                message: "slow down".into(),
                retry_after_ms: Some(1500),
                not_found: false,
            }),
        );

        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn history_query_serializes_flat() {
        let line = Outbound::Query {
            id: 9,
            query: Query::FetchHistory {
                channel: ChannelId(3),
                history: HistoryQuery {
                    after: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
                    before: Some(MessageId(77)),
                    limit: 100,
                },
            },
        };
        let value = serde_json::to_value(&line).unwrap();
        assert_eq!(value["type"], "query");
        assert_eq!(value["id"], 9);
        assert_eq!(value["query"]["query"], "fetch_history");
        assert_eq!(value["query"]["channel"], 3);
        assert_eq!(value["query"]["before"], 77);
        assert_eq!(value["query"]["limit"], 100);
        assert!(value["query"]["after"].as_str().unwrap().starts_with("2024-05-01"));
    }

    #[tokio::test]
    async fn unanswered_query_times_out() {
        let (p, _rx) = platform(Duration::from_millis(50));
        let err = p.user_name(UserId(3)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(p.lock_pending().is_empty());
    }

    #[test]
    fn inbound_lines_parse() {
        let voice: Inbound = serde_json::from_str(
            r#"{"type":"voice","channel":5,"delta":{"kind":"joined","member":9,"category":"adult"}}"#,
        )
        .unwrap();
        assert!(matches!(voice, Inbound::Voice { channel: ChannelId(5), .. }));

        let reply: Inbound =
            serde_json::from_str(r#"{"type":"reply","id":4,"error":{"message":"no such channel","not_found":true}}"#)
                .unwrap();
        let Inbound::Reply { error: Some(err), .. } = reply else {
            panic!("expected an error reply");
        };
        assert!(matches!(Error::from(err), Error::NotFound(_)));

        let cmd: Inbound = serde_json::from_str(
            r#"{"type":"command","id":"c1","request":{"command":"list_reminders"}}"#,
        )
        .unwrap();
        assert!(matches!(
            cmd,
            Inbound::Command {
                request: CommandRequest::ListReminders,
                ..
            }
        ));
    }

    async fn running_automation(
        dir: &std::path::Path,
        out: mpsc::UnboundedSender<Outbound>,
    ) -> (Arc<StdioPlatform>, Arc<Automation>, CancellationToken) {
        let mut cfg = Config::with_data_dir(dir);
        cfg.archive_bind_host = "127.0.0.1".into();
        cfg.archive_port = 0;
        let (bridge, domain) = event_domain(cfg.domain_queue_capacity);
        let stop = CancellationToken::new();
        tokio::spawn(domain.run(stop.clone()));

        let stdio = Arc::new(StdioPlatform::new(out, Duration::from_millis(100)));
        let store = Arc::new(JsonFileStore::open(dir).unwrap());
        let source = Arc::new(IcalFeedSource::new(Duration::from_secs(1)).unwrap());
        let automation = Arc::new(Automation::new(&cfg, stdio.clone(), store, source, bridge));
        automation.start().await.unwrap();
        (stdio, automation, stop)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
        lines
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn commands_apply_in_arrival_order() {
        let tmp = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (stdio, automation, stop) = running_automation(tmp.path(), tx.clone()).await;

        let mut input = String::new();
        for i in 0..100 {
            input.push_str(&format!(
                r#"{{"type":"command","id":"add-{i}","request":{{"command":"add_reminder","title":"r{i}","channel":3,"interval_secs":3600}}}}"#
            ));
            input.push('\n');
            input.push_str(&format!(
                r#"{{"type":"command","id":"del-{i}","request":{{"command":"delete_reminder","title":"r{i}"}}}}"#
            ));
            input.push('\n');
        }

        read_inbound(input.as_bytes(), stdio, automation.clone(), tx)
            .await
            .unwrap();

        let responses: Vec<(String, bool)> = drain(&mut rx)
            .into_iter()
            .filter_map(|line| match line {
                Outbound::Response { id, ok, .. } => Some((id, ok)),
                _ => None,
            })
            .collect();
        assert_eq!(responses.len(), 200);
        let failed: Vec<_> = responses.iter().filter(|(_, ok)| !ok).collect();
        assert!(failed.is_empty(), "failed commands: {failed:?}");
        let expected: Vec<String> = (0..100)
            .flat_map(|i| [format!("add-{i}"), format!("del-{i}")])
            .collect();
        let ids: Vec<String> = responses.into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, expected);
        assert!(automation.list_reminders().is_empty());
        stop.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn voice_events_apply_in_arrival_order() {
        let tmp = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (stdio, automation, stop) = running_automation(tmp.path(), tx.clone()).await;

        let input = [
            r#"{"type":"voice","channel":5,"delta":{"kind":"joined","member":1,"category":"adult"}}"#,
            r#"{"type":"voice","channel":5,"delta":{"kind":"joined","member":2,"category":"child"}}"#,
            r#"{"type":"command","id":"list","request":{"command":"list_reminders"}}"#,
            r#"{"type":"voice","channel":5,"delta":{"kind":"left","member":2}}"#,
        ]
        .join("\n");

        read_inbound(input.as_bytes(), stdio, automation, tx)
            .await
            .unwrap();

        let mut order = Vec::new();
        for line in drain(&mut rx) {
            match line {
                Outbound::Action {
                    action: Action::SetVoiceMute { member, muted, .. },
                } => order.push(format!("{}:{muted}", member.0)),
                Outbound::Response { id, .. } => order.push(id),
                _ => {}
            }
        }
        assert_eq!(
            order,
            vec!["1:true", "2:true", "list", "1:false", "2:false"]
        );
        stop.cancel();
    }
}
