use std::{path::PathBuf, sync::Arc, time::Duration};

/// Core error type for the automation engine.
///
/// Adapter crates map their specific failures into this type so the core can
/// decide between "tell the user", "alert moderators" and "retry".
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("persistence error: {path}: {reason}")]
    Persistence { path: PathBuf, reason: String },

    #[error("fetch error: {0}")]
    Fetch(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("lock contention: {0}")]
    LockContention(String),

    #[error("archive link expired or unknown")]
    ExpiredToken,

    #[error("roster inconsistency in channel {channel}: {detail}")]
    RosterInconsistency { channel: u64, detail: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("canceled")]
    Canceled,

    #[error("event domain is closed")]
    DomainClosed,

    #[error("event domain queue is full")]
    DomainBusy,

    #[error("external error: {0}")]
    External(String),

    /// A single failure observed by several waiters (single-flight fetches).
    #[error(transparent)]
    Shared(Arc<Error>),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether another attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Fetch(_)
            | Error::Timeout(_)
            | Error::RateLimited { .. }
            | Error::LockContention(_)
            | Error::DomainBusy
            | Error::External(_) => true,
            Error::Shared(inner) => inner.is_transient(),
            _ => false,
        }
    }

    /// Server-provided backoff hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after } => Some(*retry_after),
            Error::Shared(inner) => inner.retry_after(),
            _ => None,
        }
    }

    pub(crate) fn persistence(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::Persistence {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_errors_keep_classification() {
        let inner = Arc::new(Error::RateLimited {
            retry_after: Duration::from_secs(3),
        });
        let err = Error::Shared(inner);
        assert!(err.is_transient());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
        assert!(err.to_string().contains("rate limited"));
    }

    #[test]
    fn validation_errors_are_not_retried() {
        assert!(!Error::Invalid("bad".into()).is_transient());
        assert!(!Error::ExpiredToken.is_transient());
        assert!(Error::Fetch("dns".into()).is_transient());
    }
}
