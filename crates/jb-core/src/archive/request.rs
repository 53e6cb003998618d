//! Collects one user's messages from a channel into a zip archive and sends
//! the requester a download link.
//!
//! History is read page by page: each page is fetched on a worker, folded into
//! the collection on the event domain, and the next page is scheduled after a
//! pause. Rate-limited pages are retried with backoff. Packaging runs on a
//! worker; the requester is messaged from the event domain.

use std::{
    fs::File,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::oneshot;
use zip::{write::FileOptions, CompressionMethod, ZipWriter};

use super::server::{ArchiveLink, EphemeralArchiveServer};
use crate::{
    bridge::DomainBridge,
    config::Config,
    directory::Directory,
    domain::{ChannelId, MessageId, UserId},
    formatting::{self, ArchiveSummary},
    messaging::{
        port::PlatformPort,
        types::{HistoryMessage, HistoryQuery},
    },
    retry::{with_retry, Backoff},
    Error, Result,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveRequest {
    pub requester: UserId,
    pub channel: ChannelId,
    pub target: UserId,
    /// `YYYY-MM-DD`, UTC midnight.
    pub start_date: String,
    /// Messages to scan; the configured default when `None`.
    pub limit: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArchiveOutcome {
    Ready {
        link: ArchiveLink,
        found: usize,
        processed: usize,
    },
    Empty {
        processed: usize,
    },
}

#[derive(Clone, Debug)]
pub struct HistorySettings {
    pub page_size: usize,
    pub page_delay: Duration,
    pub default_limit: usize,
    /// Backoff for rate-limited pages; `max_attempts` counts the first try.
    pub rate_limit: Backoff,
    pub compression_timeout: Duration,
    /// Retries for a compression attempt that timed out.
    pub compression_retry: Backoff,
    pub staging_dir: PathBuf,
}

impl HistorySettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            page_size: cfg.history_page_size.max(1),
            page_delay: cfg.history_page_delay,
            default_limit: cfg.history_default_limit,
            rate_limit: Backoff::new(cfg.rate_limit_base_delay, cfg.rate_limit_max_retries + 1),
            compression_timeout: cfg.compression_timeout,
            compression_retry: Backoff::new(Duration::from_secs(1), cfg.compression_max_attempts),
            staging_dir: cfg.staging_dir.clone(),
        }
    }
}

struct Collection {
    req: ArchiveRequest,
    after: DateTime<Utc>,
    limit: usize,
    before: Option<MessageId>,
    processed: usize,
    found: Vec<HistoryMessage>,
    retries: u32,
    reply: oneshot::Sender<Result<ArchiveOutcome>>,
}

impl Collection {
    fn batch(&self, page_size: usize) -> usize {
        page_size.min(self.limit.saturating_sub(self.processed))
    }
}

pub struct ArchiveRequests {
    settings: HistorySettings,
    bridge: DomainBridge,
    platform: Arc<dyn PlatformPort>,
    directory: Arc<Directory>,
    server: EphemeralArchiveServer,
}

impl ArchiveRequests {
    pub fn new(
        settings: HistorySettings,
        bridge: DomainBridge,
        platform: Arc<dyn PlatformPort>,
        directory: Arc<Directory>,
        server: EphemeralArchiveServer,
    ) -> Self {
        Self {
            settings,
            bridge,
            platform,
            directory,
            server,
        }
    }

    /// Run a request to completion. The requester is messaged either way.
    ///
    /// Collection is driven from the event domain, so this must not be
    /// awaited from inside an event-domain callback.
    pub async fn request(self: &Arc<Self>, req: ArchiveRequest) -> Result<ArchiveOutcome> {
        let after = parse_start_date(&req.start_date)?;
        let limit = req.limit.unwrap_or(self.settings.default_limit);
        if limit == 0 {
            return Err(Error::Invalid("limit must be positive".to_string()));
        }
        tracing::info!(
            requester = %req.requester,
            channel = %req.channel,
            target_user = %req.target,
            start_date = %req.start_date,
            limit,
            "archive requested"
        );

        let (reply, outcome) = oneshot::channel();
        let collection = Collection {
            req,
            after,
            limit,
            before: None,
            processed: 0,
            found: Vec::new(),
            retries: 0,
            reply,
        };
        let this = Arc::clone(self);
        self.bridge
            .run_on_event_domain(move || async move { this.fetch_page(collection) })
            .await?;
        outcome.await.map_err(|_| Error::Canceled)?
    }

    fn fetch_page(self: &Arc<Self>, c: Collection) {
        let query = HistoryQuery {
            after: c.after,
            before: c.before,
            limit: c.batch(self.settings.page_size),
        };
        let platform = self.platform.clone();
        let channel = c.req.channel;
        let work = self
            .bridge
            .spawn_worker(async move { platform.fetch_history(channel, query).await });

        let this = Arc::clone(self);
        self.bridge.then(work, move |page| async move {
            this.on_page(c, page).await;
        });
    }

    async fn on_page(self: &Arc<Self>, mut c: Collection, page: Result<Vec<HistoryMessage>>) {
        match page {
            Ok(page) => {
                let requested = c.batch(self.settings.page_size);
                c.retries = 0;
                c.processed += page.len();
                if let Some(oldest) = page.iter().map(|m| m.id).min() {
                    c.before = Some(oldest);
                }
                let exhausted = page.len() < requested || c.processed >= c.limit;
                let target = c.req.target;
                c.found
                    .extend(page.into_iter().filter(|m| m.author == target));
                tracing::debug!(processed = c.processed, found = c.found.len(), "history page read");

                if exhausted {
                    self.finish(c).await;
                } else {
                    let this = Arc::clone(self);
                    self.bridge
                        .run_after(self.settings.page_delay, move || async move {
                            this.fetch_page(c)
                        });
                }
            }
            Err(e)
                if e.retry_after().is_some()
                    && c.retries + 1 < self.settings.rate_limit.max_attempts =>
            {
                let delay = self.settings.rate_limit.delay_after(c.retries, &e);
                c.retries += 1;
                tracing::warn!(
                    channel = %c.req.channel,
                    retry = c.retries,
                    delay_ms = delay.as_millis() as u64,
                    "history rate limited"
                );
                let this = Arc::clone(self);
                self.bridge
                    .run_after(delay, move || async move { this.fetch_page(c) });
            }
            Err(e) => self.fail(c, e).await,
        }
    }

    async fn finish(self: &Arc<Self>, c: Collection) {
        let Collection {
            req,
            processed,
            found,
            reply,
            ..
        } = c;

        if found.is_empty() {
            tracing::info!(target_user = %req.target, processed, "archive request found nothing");
            let text = formatting::archive_empty_dm(req.target, req.channel, processed);
            self.dm(req.requester, &text).await;
            let _ = reply.send(Ok(ArchiveOutcome::Empty { processed }));
            return;
        }

        let found_count = found.len();
        let this = Arc::clone(self);
        let packaged_req = req.clone();
        let work = self
            .bridge
            .spawn_worker(async move { this.package(&packaged_req, found, processed).await });

        let this = Arc::clone(self);
        self.bridge.then(work, move |packaged| async move {
            let outcome = match packaged {
                Ok((link, text)) => {
                    this.dm(req.requester, &text).await;
                    Ok(ArchiveOutcome::Ready {
                        link,
                        found: found_count,
                        processed,
                    })
                }
                Err(e) => {
                    tracing::error!(target_user = %req.target, error = %e, "archive packaging failed");
                    this.dm(req.requester, &formatting::archive_failed_dm(req.channel, &e))
                        .await;
                    Err(e)
                }
            };
            let _ = reply.send(outcome);
        });
    }

    async fn fail(&self, c: Collection, e: Error) {
        tracing::error!(channel = %c.req.channel, error = %e, "history collection failed");
        self.dm(
            c.req.requester,
            &formatting::archive_failed_dm(c.req.channel, &e),
        )
        .await;
        let _ = c.reply.send(Err(e));
    }

    /// Render, compress and publish. Returns the link and the message for
    /// the requester.
    async fn package(
        &self,
        req: &ArchiveRequest,
        mut found: Vec<HistoryMessage>,
        processed: usize,
    ) -> Result<(ArchiveLink, String)> {
        found.sort_by_key(|m| (m.created_at, m.id));

        let target_name = self
            .directory
            .user_name(req.target)
            .await
            .unwrap_or_else(|_| format!("user{}", req.target));
        let channel_name = self
            .directory
            .channel_name(req.channel)
            .await
            .unwrap_or_else(|_| req.channel.to_string());
        let summary = ArchiveSummary {
            target: req.target,
            target_name: &target_name,
            channel_name: &channel_name,
            start_date: &req.start_date,
            found: found.len(),
            processed,
        };

        let mut text = formatting::archive_header(&summary, Utc::now());
        for msg in &found {
            text.push_str(&formatting::archive_entry(msg));
        }

        let stem = format!("{}_messages", file_stem(&target_name));
        let staged = self.compress(&format!("{stem}.txt"), text).await?;

        let link = match self.server.publish(staged.clone(), &format!("{stem}.zip")).await {
            Ok(link) => link,
            Err(e) => {
                discard(&staged);
                return Err(e);
            }
        };

        let ttl_minutes = (self.server.settings().ttl.as_secs() / 60) as i64;
        let text =
            formatting::archive_ready_dm(&summary, req.channel, &link.url, link.expiry_at, ttl_minutes);
        Ok((link, text))
    }

    async fn compress(&self, entry: &str, text: String) -> Result<PathBuf> {
        self.compress_with(entry, text, write_zip).await
    }

    /// Zip `text` into a fresh staging file. Each attempt writes its own file
    /// so a timed-out writer still running cannot clobber a later one.
    async fn compress_with(&self, entry: &str, text: String, write: ZipFn) -> Result<PathBuf> {
        let timeout = self.settings.compression_timeout;
        let body = Arc::new(text);
        with_retry(self.settings.compression_retry, "archive compression", || {
            let staged = self
                .settings
                .staging_dir
                .join(format!("{}.zip", uuid::Uuid::new_v4()));
            let path = staged.clone();
            let entry = entry.to_string();
            let body = body.clone();
            let work = self
                .bridge
                .run_in_background(move || write(&path, &entry, body.as_bytes()));
            async move {
                let written = tokio::time::timeout(timeout, work)
                    .await
                    .unwrap_or(Err(Error::Timeout(timeout)));
                match written {
                    Ok(()) => Ok(staged),
                    Err(e) => {
                        discard(&staged);
                        Err(e)
                    }
                }
            }
        })
        .await
    }

    async fn dm(&self, user: UserId, text: &str) {
        if let Err(e) = self.platform.send_dm(user, text).await {
            tracing::error!(user = %user, error = %e, "failed to message archive requester");
        }
    }
}

fn parse_start_date(raw: &str) -> Result<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| Error::Invalid(format!("start date must be YYYY-MM-DD, got {raw:?}")))?;
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .ok_or_else(|| Error::Invalid(format!("bad start date {raw:?}")))
}

/// Keep file names portable: anything but ASCII alphanumerics, `-`, `_`
/// and `.` becomes `_`.
fn file_stem(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let stem = stem.trim_matches('.').to_string();
    if stem.is_empty() {
        "user".to_string()
    } else {
        stem
    }
}

type ZipFn = fn(&Path, &str, &[u8]) -> Result<()>;

fn write_zip(path: &Path, entry: &str, body: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let zip_err = |e: zip::result::ZipError| Error::External(format!("zip: {e}"));
    let mut zip = ZipWriter::new(File::create(path)?);
    zip.start_file(
        entry,
        FileOptions::default().compression_method(CompressionMethod::Deflated),
    )
    .map_err(zip_err)?;
    zip.write_all(body)?;
    zip.finish().map_err(zip_err)?;
    Ok(())
}

fn discard(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove staged archive");
        }
    }
}
