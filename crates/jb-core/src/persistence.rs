//! Durable records: reminders, feed subscriptions and the archive index.
//!
//! Each record kind lives in its own JSON object file keyed by its natural id
//! (`reminders.json` by job id, `feeds.json` by url, `archives.json` by
//! token). Writes go to a temp file and are renamed into place, so a crash
//! leaves either the old or the new table, never a torn one.
//!
//! All methods block; callers run them through
//! [`DomainBridge::run_in_background`](crate::bridge::DomainBridge::run_in_background).

use std::{
    collections::BTreeMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::mpsc;

use crate::{
    archive::ArchiveJob, bridge::DomainBridge, domain::JobId, feeds::FeedSubscription,
    scheduler::ScheduledJob, Error, Result,
};

pub const REMINDERS_FILE: &str = "reminders.json";
pub const FEEDS_FILE: &str = "feeds.json";
pub const ARCHIVES_FILE: &str = "archives.json";

pub trait PersistenceStore: Send + Sync {
    fn load_jobs(&self) -> Result<Vec<ScheduledJob>>;
    fn save_job(&self, job: &ScheduledJob) -> Result<()>;
    fn delete_job(&self, id: &JobId) -> Result<bool>;

    fn load_feeds(&self) -> Result<Vec<FeedSubscription>>;
    fn save_feed(&self, feed: &FeedSubscription) -> Result<()>;
    fn delete_feed(&self, url: &str) -> Result<bool>;

    fn load_archives(&self) -> Result<Vec<ArchiveJob>>;
    fn save_archive(&self, job: &ArchiveJob) -> Result<()>;
    fn delete_archive(&self, token: &str) -> Result<bool>;
}

/// JSON-file store rooted at the data directory.
pub struct JsonFileStore {
    dir: PathBuf,
    // Serializes read-modify-write cycles across the three tables.
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| Error::persistence(&dir, e))?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read_table<T: DeserializeOwned>(&self, file: &str) -> Result<BTreeMap<String, T>> {
        let path = self.dir.join(file);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(Error::persistence(&path, e)),
        };
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&raw).map_err(|e| Error::persistence(&path, e))
    }

    fn write_table<T: Serialize>(&self, file: &str, table: &BTreeMap<String, T>) -> Result<()> {
        let path = self.dir.join(file);
        let tmp = self.dir.join(format!(".{file}.tmp"));
        let body = serde_json::to_vec_pretty(table).map_err(|e| Error::persistence(&path, e))?;

        let write = || -> std::io::Result<()> {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&body)?;
            f.sync_all()?;
            fs::rename(&tmp, &path)
        };
        write().map_err(|e| Error::persistence(&path, e))
    }

    fn update<T, R>(
        &self,
        file: &str,
        apply: impl FnOnce(&mut BTreeMap<String, T>) -> R,
    ) -> Result<R>
    where
        T: Serialize + DeserializeOwned,
    {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut table = self.read_table::<T>(file)?;
        let out = apply(&mut table);
        self.write_table(file, &table)?;
        Ok(out)
    }

    fn load_all<T: DeserializeOwned>(&self, file: &str) -> Result<Vec<T>> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        Ok(self.read_table::<T>(file)?.into_values().collect())
    }
}

impl PersistenceStore for JsonFileStore {
    fn load_jobs(&self) -> Result<Vec<ScheduledJob>> {
        let jobs = self.load_all::<ScheduledJob>(REMINDERS_FILE)?;
        Ok(jobs.into_iter().map(ScheduledJob::persisted).collect())
    }

    fn save_job(&self, job: &ScheduledJob) -> Result<()> {
        self.update(REMINDERS_FILE, |t| {
            t.insert(job.id.0.clone(), job.clone());
        })
    }

    fn delete_job(&self, id: &JobId) -> Result<bool> {
        self.update::<ScheduledJob, _>(REMINDERS_FILE, |t| t.remove(&id.0).is_some())
    }

    fn load_feeds(&self) -> Result<Vec<FeedSubscription>> {
        self.load_all(FEEDS_FILE)
    }

    fn save_feed(&self, feed: &FeedSubscription) -> Result<()> {
        self.update(FEEDS_FILE, |t| {
            t.insert(feed.url.clone(), feed.clone());
        })
    }

    fn delete_feed(&self, url: &str) -> Result<bool> {
        self.update::<FeedSubscription, _>(FEEDS_FILE, |t| t.remove(url).is_some())
    }

    fn load_archives(&self) -> Result<Vec<ArchiveJob>> {
        self.load_all(ARCHIVES_FILE)
    }

    fn save_archive(&self, job: &ArchiveJob) -> Result<()> {
        self.update(ARCHIVES_FILE, |t| {
            t.insert(job.token.clone(), job.clone());
        })
    }

    fn delete_archive(&self, token: &str) -> Result<bool> {
        self.update::<ArchiveJob, _>(ARCHIVES_FILE, |t| t.remove(token).is_some())
    }
}

type StoreWrite = Box<dyn FnOnce(&dyn PersistenceStore) -> Result<()> + Send>;

/// Applies store writes one at a time, in submission order, on the blocking
/// pool. Failures are logged; the in-memory state stays authoritative.
#[derive(Clone)]
pub struct WriteQueue {
    tx: mpsc::UnboundedSender<(String, StoreWrite)>,
}

impl WriteQueue {
    /// Spawns the writer task; must be called inside a tokio runtime.
    pub fn spawn(store: Arc<dyn PersistenceStore>, bridge: DomainBridge) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<(String, StoreWrite)>();
        tokio::spawn(async move {
            while let Some((what, write)) = rx.recv().await {
                let store = store.clone();
                let applied = bridge
                    .run_in_background(move || write(store.as_ref()))
                    .await;
                if let Err(e) = applied {
                    tracing::error!(what = %what, error = %e, "store write failed");
                }
            }
        });
        Self { tx }
    }

    pub fn submit<F>(&self, what: impl Into<String>, write: F)
    where
        F: FnOnce(&dyn PersistenceStore) -> Result<()> + Send + 'static,
    {
        let what = what.into();
        if self.tx.send((what.clone(), Box::new(write))).is_err() {
            tracing::warn!(what = %what, "store writer stopped, dropping update");
        }
    }
}
