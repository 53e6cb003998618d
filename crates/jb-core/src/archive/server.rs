//! One-shot download links for archive files.
//!
//! The listener is started on the first publish and stopped once the last
//! live job expires. Every job has its own expiry task that deletes the file
//! and the token, downloaded or not.

use std::{
    collections::{HashMap, HashSet},
    fs,
    net::SocketAddr,
    path::{Path as FsPath, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::{
    bridge::DomainBridge,
    config::Config,
    persistence::{PersistenceStore, WriteQueue},
    Error, Result,
};

const NOT_FOUND_BODY: &str = "This link has expired or does not exist.";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveJob {
    pub token: String,
    pub file_path: PathBuf,
    /// Name offered to the browser.
    pub file_name: String,
    pub created_at: DateTime<Utc>,
    pub expiry_at: DateTime<Utc>,
    pub size: u64,
}

impl ArchiveJob {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expiry_at
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveLink {
    pub token: String,
    pub url: String,
    pub expiry_at: DateTime<Utc>,
    pub size: u64,
}

#[derive(Clone, Debug)]
pub struct ServerSettings {
    pub archive_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub bind_host: String,
    pub public_host: String,
    /// 0 picks a free port.
    pub port: u16,
    pub ttl: Duration,
    pub request_timeout: Duration,
}

impl ServerSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            archive_dir: cfg.archive_dir.clone(),
            staging_dir: cfg.staging_dir.clone(),
            bind_host: cfg.archive_bind_host.clone(),
            public_host: cfg.archive_public_host.clone(),
            port: cfg.archive_port,
            ttl: cfg.archive_ttl,
            request_timeout: cfg.http_idle_timeout,
        }
    }
}

/// Outcome of the startup sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub restored: usize,
    pub expired: usize,
    pub orphans_removed: usize,
}

#[derive(Default)]
struct ArchiveTable {
    jobs: Mutex<HashMap<String, ArchiveJob>>,
}

impl ArchiveTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, ArchiveJob>> {
        self.jobs.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lookup(&self, token: &str, now: DateTime<Utc>) -> Result<ArchiveJob> {
        match self.lock().get(token) {
            Some(job) if job.is_live(now) => Ok(job.clone()),
            _ => Err(Error::ExpiredToken),
        }
    }
}

struct RunningListener {
    addr: SocketAddr,
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Clone)]
pub struct EphemeralArchiveServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    settings: ServerSettings,
    bridge: DomainBridge,
    store: Arc<dyn PersistenceStore>,
    writes: WriteQueue,
    table: Arc<ArchiveTable>,
    // Lifecycle only: held across bind and stop, never touched by requests.
    listener: tokio::sync::Mutex<Option<RunningListener>>,
    shutdown: CancellationToken,
}

impl EphemeralArchiveServer {
    pub fn new(
        settings: ServerSettings,
        bridge: DomainBridge,
        store: Arc<dyn PersistenceStore>,
        writes: WriteQueue,
    ) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                settings,
                bridge,
                store,
                writes,
                table: Arc::new(ArchiveTable::default()),
                listener: tokio::sync::Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.inner.settings
    }

    /// Move `file` into the archive directory and return a link to it.
    pub async fn publish(&self, file: PathBuf, file_name: &str) -> Result<ArchiveLink> {
        let token = new_token();
        let ext = FsPath::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin");
        let dest = self.inner.settings.archive_dir.join(format!("{token}.{ext}"));

        let target = dest.clone();
        let size = self
            .inner
            .bridge
            .run_in_background(move || move_file(&file, &target))
            .await?;

        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.inner.settings.ttl)
            .unwrap_or_else(|_| chrono::Duration::minutes(30));
        let job = ArchiveJob {
            token: token.clone(),
            file_path: dest,
            file_name: file_name.to_string(),
            created_at: now,
            expiry_at: now + ttl,
            size,
        };
        self.inner.table.lock().insert(token.clone(), job.clone());
        let record = job.clone();
        self.inner
            .writes
            .submit(format!("save archive {}", short(&token)), move |s| {
                s.save_archive(&record)
            });

        let addr = match self.ensure_listener().await {
            Ok(addr) => addr,
            Err(e) => {
                self.expire(&token).await;
                return Err(e);
            }
        };
        self.arm_expiry(job.clone());

        tracing::info!(
            token = %short(&token),
            size,
            expiry_at = %job.expiry_at,
            "archive published"
        );
        Ok(ArchiveLink {
            url: format!("http://{}:{}/{}", self.inner.settings.public_host, addr.port(), token),
            token,
            expiry_at: job.expiry_at,
            size,
        })
    }

    /// Reload live jobs from the index and delete everything else: expired
    /// records, archive files without a live job, leftover staging files.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let store = self.inner.store.clone();
        let archive_dir = self.inner.settings.archive_dir.clone();
        let staging_dir = self.inner.settings.staging_dir.clone();
        let now = Utc::now();

        let (live, report) = self
            .inner
            .bridge
            .run_in_background(move || {
                let recorded = match store.load_archives() {
                    Ok(jobs) => jobs,
                    Err(e) => {
                        tracing::error!(error = %e, "archive index unreadable, dropping it");
                        Vec::new()
                    }
                };
                let (live, dead): (Vec<_>, Vec<_>) = recorded
                    .into_iter()
                    .partition(|job| job.is_live(now) && job.file_path.is_file());
                for job in &dead {
                    remove_if_exists(&job.file_path);
                    if let Err(e) = store.delete_archive(&job.token) {
                        tracing::warn!(token = %short(&job.token), error = %e, "failed to drop archive record");
                    }
                }

                let keep: HashSet<PathBuf> = live.iter().map(|j| j.file_path.clone()).collect();
                let orphans = sweep_dir(&archive_dir, &keep)? + sweep_dir(&staging_dir, &HashSet::new())?;
                let report = RecoveryReport {
                    restored: live.len(),
                    expired: dead.len(),
                    orphans_removed: orphans,
                };
                Ok((live, report))
            })
            .await?;

        {
            let mut table = self.inner.table.lock();
            for job in &live {
                table.insert(job.token.clone(), job.clone());
            }
        }
        for job in live {
            self.arm_expiry(job);
        }
        if report.restored > 0 {
            if let Err(e) = self.ensure_listener().await {
                tracing::error!(error = %e, "archive listener failed to start after recovery");
            }
        }
        tracing::info!(
            restored = report.restored,
            expired = report.expired,
            orphans_removed = report.orphans_removed,
            "archive recovery finished"
        );
        Ok(report)
    }

    /// The job behind `token`, if it is still live at `now`.
    pub fn lookup(&self, token: &str, now: DateTime<Utc>) -> Result<ArchiveJob> {
        self.inner.table.lookup(token, now)
    }

    pub fn live_tokens(&self) -> Vec<String> {
        let mut tokens: Vec<_> = self.inner.table.lock().keys().cloned().collect();
        tokens.sort();
        tokens
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .listener
            .lock()
            .await
            .as_ref()
            .filter(|running| !running.handle.is_finished())
            .map(|running| running.addr)
    }

    /// Stop the listener and every expiry task. Files stay on disk for the
    /// next start's recovery.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        if let Some(running) = self.inner.listener.lock().await.take() {
            stop_listener(running).await;
        }
    }

    async fn ensure_listener(&self) -> Result<SocketAddr> {
        let mut slot = self.inner.listener.lock().await;
        if let Some(running) = slot.as_ref() {
            if !running.handle.is_finished() {
                return Ok(running.addr);
            }
        }

        let settings = &self.inner.settings;
        let listener = TcpListener::bind((settings.bind_host.as_str(), settings.port))
            .await
            .map_err(|e| {
                Error::External(format!(
                    "archive listener bind {}:{}: {e}",
                    settings.bind_host, settings.port
                ))
            })?;
        let addr = listener.local_addr()?;
        let stop = CancellationToken::new();
        let app = router(self.inner.table.clone(), settings.request_timeout);

        let signal = stop.clone();
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { signal.cancelled().await })
                .await;
            if let Err(e) = served {
                tracing::error!(addr = %addr, error = %e, "archive listener failed");
            }
            tracing::info!(addr = %addr, "archive listener stopped");
        });

        tracing::info!(addr = %addr, "archive listener started");
        *slot = Some(RunningListener { addr, stop, handle });
        Ok(addr)
    }

    fn arm_expiry(&self, job: ArchiveJob) {
        let server = self.clone();
        tokio::spawn(async move {
            let wait = (job.expiry_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = server.inner.shutdown.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
            server.expire(&job.token).await;
        });
    }

    async fn expire(&self, token: &str) {
        let Some(job) = self.inner.table.lock().remove(token) else {
            return;
        };
        let path = job.file_path.clone();
        let removed = self
            .inner
            .bridge
            .run_in_background(move || {
                remove_if_exists(&path);
                Ok(())
            })
            .await;
        if let Err(e) = removed {
            tracing::warn!(token = %short(token), error = %e, "archive file cleanup failed");
        }
        let key = token.to_string();
        self.inner
            .writes
            .submit(format!("delete archive {}", short(token)), move |s| {
                s.delete_archive(&key).map(|_| ())
            });
        tracing::info!(token = %short(token), "archive expired");

        self.stop_if_idle().await;
    }

    async fn stop_if_idle(&self) {
        let mut slot = self.inner.listener.lock().await;
        if !self.inner.table.lock().is_empty() {
            return;
        }
        if let Some(running) = slot.take() {
            stop_listener(running).await;
        }
    }
}

async fn stop_listener(mut running: RunningListener) {
    running.stop.cancel();
    // In-flight downloads get a moment to finish before the port is released.
    if tokio::time::timeout(Duration::from_secs(5), &mut running.handle)
        .await
        .is_err()
    {
        running.handle.abort();
    }
}

fn router(table: Arc<ArchiveTable>, request_timeout: Duration) -> Router {
    Router::new()
        .route("/{token}", get(download))
        .layer(timeout_layer(request_timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(table)
}

/// Requests that outlive `request_timeout` are answered with 408.
fn timeout_layer(request_timeout: Duration) -> TimeoutLayer {
    TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, request_timeout)
}

async fn download(State(table): State<Arc<ArchiveTable>>, Path(token): Path<String>) -> Response {
    let job = match table.lookup(&token, Utc::now()) {
        Ok(job) => job,
        Err(_) => return (StatusCode::NOT_FOUND, NOT_FOUND_BODY).into_response(),
    };
    match tokio::fs::read(&job.file_path).await {
        Ok(bytes) => {
            let mime = mime_guess::from_path(&job.file_name).first_or_octet_stream();
            let disposition = format!(
                "attachment; filename=\"{}\"",
                job.file_name.replace(['"', '\\'], "")
            );
            tracing::info!(token = %short(&token), size = bytes.len(), "archive downloaded");
            (
                [
                    (header::CONTENT_TYPE, mime.essence_str().to_string()),
                    (header::CONTENT_DISPOSITION, disposition),
                ],
                bytes,
            )
                .into_response()
        }
        Err(e) => {
            tracing::warn!(token = %short(&token), error = %e, "archive file unreadable");
            (StatusCode::NOT_FOUND, NOT_FOUND_BODY).into_response()
        }
    }
}

/// 32 bytes from the OS generator, URL-safe base64.
fn new_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn short(token: &str) -> &str {
    token.get(..8).unwrap_or(token)
}

fn move_file(from: &FsPath, to: &FsPath) -> Result<u64> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::rename(from, to).is_err() {
        // Staging and archive dirs may sit on different filesystems.
        fs::copy(from, to)?;
        fs::remove_file(from)?;
    }
    Ok(fs::metadata(to)?.len())
}

fn remove_if_exists(path: &FsPath) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to delete archive file"),
    }
}

/// Delete regular files in `dir` not listed in `keep`.
fn sweep_dir(dir: &FsPath, keep: &HashSet<PathBuf>) -> Result<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let mut removed = 0;
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && !keep.contains(&path) {
            remove_if_exists(&path);
            removed += 1;
        }
    }
    Ok(removed)
}
