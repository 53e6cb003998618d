use std::{future::Future, time::Duration};

use tokio::time::sleep;

use crate::{Error, Result};

/// Bounded exponential backoff: `base * 2^attempt`, capped at `max_delay`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max_delay: Duration,
    /// Total attempts including the first one.
    pub max_attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_delay: Duration::from_secs(60),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay honoring a server hint when it asks for more than the backoff.
    pub fn delay_after(&self, attempt: u32, err: &Error) -> Duration {
        let computed = self.delay_for(attempt);
        match err.retry_after() {
            Some(hint) if hint > computed => hint,
            _ => computed,
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
///
/// Only transient errors (see [`Error::is_transient`]) are retried.
pub async fn with_retry<T, F, Fut>(backoff: Backoff, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt + 1 < backoff.max_attempts => {
                let delay = backoff.delay_after(attempt, &e);
                tracing::warn!(
                    what,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying"
                );
                attempt += 1;
                sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
