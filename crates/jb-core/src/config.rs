use std::{
    env, fs,
    net::IpAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{errors::Error, scheduler::MissedFirePolicy, Result};

/// Typed configuration for the automation engine.
///
/// Every field has a default; `load()` only overrides from the environment.
#[derive(Clone, Debug)]
pub struct Config {
    // Storage
    pub data_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub staging_dir: PathBuf,

    // Platform
    pub moderators_channel: String,
    pub host_query_timeout: Duration,

    // Scheduler
    pub missed_fire_policy: MissedFirePolicy,
    pub min_reminder_interval: Duration,
    pub domain_queue_capacity: usize,

    // Feeds
    pub feed_poll_interval: Duration,
    pub feed_timeout: Duration,
    pub feed_max_attempts: u32,
    pub feed_failure_alert_threshold: u32,

    // Cache / locks
    pub cache_ttl: Duration,
    pub lock_timeout: Duration,

    // Archive listener
    pub archive_bind_host: String,
    pub archive_public_host: String,
    pub archive_port: u16,
    pub archive_ttl: Duration,
    pub compression_timeout: Duration,
    pub compression_max_attempts: u32,
    pub http_idle_timeout: Duration,

    // History collection
    pub history_page_size: usize,
    pub history_page_delay: Duration,
    pub history_default_limit: usize,
    pub rate_limit_max_retries: u32,
    pub rate_limit_base_delay: Duration,
}

impl Config {
    /// Defaults rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            archive_dir: data_dir.join("archives"),
            staging_dir: data_dir.join("staging"),
            data_dir,
            moderators_channel: "moderators_only".to_string(),
            host_query_timeout: Duration::from_secs(10),
            missed_fire_policy: MissedFirePolicy::FireOnce,
            min_reminder_interval: Duration::from_secs(60),
            domain_queue_capacity: 256,
            feed_poll_interval: Duration::from_secs(3600),
            feed_timeout: Duration::from_secs(30),
            feed_max_attempts: 3,
            feed_failure_alert_threshold: 3,
            cache_ttl: Duration::from_secs(300),
            lock_timeout: Duration::from_millis(500),
            archive_bind_host: "0.0.0.0".to_string(),
            archive_public_host: "127.0.0.1".to_string(),
            archive_port: 8080,
            archive_ttl: Duration::from_secs(30 * 60),
            compression_timeout: Duration::from_secs(120),
            compression_max_attempts: 3,
            http_idle_timeout: Duration::from_secs(30),
            history_page_size: 100,
            history_page_delay: Duration::from_secs(1),
            history_default_limit: 1000,
            rate_limit_max_retries: 5,
            rate_limit_base_delay: Duration::from_secs(1),
        }
    }

    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let data_dir = env_path("JB_DATA_DIR").unwrap_or_else(|| PathBuf::from("data"));
        let mut cfg = Self::with_data_dir(data_dir);

        if let Some(dir) = env_path("JB_ARCHIVE_DIR") {
            cfg.archive_dir = dir;
        }
        if let Some(name) = env_str("JB_MODERATORS_CHANNEL").and_then(non_empty) {
            cfg.moderators_channel = name;
        }
        if let Some(secs) = env_u64("JB_HOST_QUERY_TIMEOUT_SECS") {
            cfg.host_query_timeout = Duration::from_secs(secs.max(1));
        }

        if let Some(raw) = env_str("JB_MISSED_FIRE_POLICY").and_then(non_empty) {
            cfg.missed_fire_policy = raw.parse()?;
        }
        if let Some(secs) = env_u64("JB_MIN_REMINDER_INTERVAL_SECS") {
            cfg.min_reminder_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(cap) = env_usize("JB_DOMAIN_QUEUE") {
            cfg.domain_queue_capacity = cap.max(1);
        }

        if let Some(secs) = env_u64("JB_FEED_POLL_SECS") {
            cfg.feed_poll_interval = Duration::from_secs(secs.max(60));
        }
        if let Some(secs) = env_u64("JB_FEED_TIMEOUT_SECS") {
            cfg.feed_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(n) = env_u32("JB_FEED_MAX_ATTEMPTS") {
            cfg.feed_max_attempts = n.max(1);
        }
        if let Some(n) = env_u32("JB_FEED_FAILURE_ALERT_THRESHOLD") {
            cfg.feed_failure_alert_threshold = n.max(1);
        }

        if let Some(secs) = env_u64("JB_CACHE_TTL_SECS") {
            cfg.cache_ttl = Duration::from_secs(secs);
        }
        if let Some(ms) = env_u64("JB_LOCK_TIMEOUT_MS") {
            cfg.lock_timeout = Duration::from_millis(ms.max(1));
        }

        if let Some(host) = env_str("JB_ARCHIVE_HOST").and_then(non_empty) {
            cfg.archive_bind_host = host;
        }
        cfg.archive_public_host = public_host_for(
            &cfg.archive_bind_host,
            env_str("JB_ARCHIVE_PUBLIC_HOST").and_then(non_empty),
        )?;
        if let Some(port) = env_u16("JB_ARCHIVE_PORT") {
            cfg.archive_port = port;
        }
        if let Some(secs) = env_u64("JB_ARCHIVE_TTL_SECS") {
            cfg.archive_ttl = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = env_u64("JB_COMPRESSION_TIMEOUT_SECS") {
            cfg.compression_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(n) = env_u32("JB_COMPRESSION_MAX_ATTEMPTS") {
            cfg.compression_max_attempts = n.max(1);
        }
        if let Some(secs) = env_u64("JB_HTTP_IDLE_TIMEOUT_SECS") {
            cfg.http_idle_timeout = Duration::from_secs(secs.max(1));
        }

        cfg.ensure_dirs()?;
        Ok(cfg)
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.data_dir, &self.archive_dir, &self.staging_dir] {
            fs::create_dir_all(dir).map_err(|e| {
                Error::Config(format!("cannot create {}: {e}", dir.display()))
            })?;
        }
        Ok(())
    }

    pub fn log_file(&self) -> PathBuf {
        self.data_dir.join(crate::logging::LOG_FILE_NAME)
    }
}

/// Address to advertise in archive links.
///
/// An explicit bind host is advertised as-is unless overridden. A wildcard
/// bind has no address of its own, so the public host must be configured.
fn public_host_for(bind_host: &str, configured: Option<String>) -> Result<String> {
    if let Some(host) = configured {
        return Ok(host);
    }
    let bare = bind_host.trim_start_matches('[').trim_end_matches(']');
    let wildcard = bare
        .parse::<IpAddr>()
        .map(|ip| ip.is_unspecified())
        .unwrap_or(false);
    if wildcard {
        return Err(Error::Config(format!(
            "JB_ARCHIVE_PUBLIC_HOST is required when the archive listener binds {bind_host}"
        )));
    }
    Ok(bind_host.to_string())
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim().trim_start_matches("export ").trim();
        if key.is_empty() || env::var_os(key).is_some() {
            continue; // existing env wins
        }

        env::set_var(key, strip_quotes(v.trim()));
    }
}

fn strip_quotes(val: &str) -> &str {
    if val.len() >= 2
        && ((val.starts_with('"') && val.ends_with('"'))
            || (val.starts_with('\'') && val.ends_with('\'')))
    {
        return &val[1..val.len() - 1];
    }
    val
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_u16(key: &str) -> Option<u16> {
    env_str(key).and_then(|s| s.trim().parse::<u16>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s.trim().to_string())
    }
}
