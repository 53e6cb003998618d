//! Hand-off between the event domain and the workers.
//!
//! The event domain is one task draining a bounded queue of callbacks in
//! submission order, so callbacks never interleave with each other. Blocking
//! work goes to the blocking pool (`run_in_background`), async I/O to spawned
//! tasks (`spawn_worker`), and results come back as continuations posted to the
//! queue (`then`). The domain itself never awaits a worker.

use std::{
    any::Any,
    future::Future,
    panic::AssertUnwindSafe,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures_util::{future::BoxFuture, FutureExt};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

type DomainTask = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

tokio::task_local! {
    static ON_EVENT_DOMAIN: ();
}

/// Whether the caller is running inside an event-domain callback.
pub fn on_event_domain() -> bool {
    ON_EVENT_DOMAIN.try_with(|_| ()).is_ok()
}

/// Cloneable handle for posting work into the event domain.
#[derive(Clone)]
pub struct DomainBridge {
    tx: mpsc::Sender<DomainTask>,
}

/// Receiving side; run exactly once.
pub struct EventDomain {
    rx: mpsc::Receiver<DomainTask>,
}

pub fn event_domain(capacity: usize) -> (DomainBridge, EventDomain) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (DomainBridge { tx }, EventDomain { rx })
}

impl EventDomain {
    /// Process callbacks one at a time until `shutdown` fires or every bridge
    /// handle is dropped. A panicking callback is logged and skipped.
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            let task = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = self.rx.recv() => match next {
                    Some(task) => task,
                    None => break,
                },
            };

            let outcome = AssertUnwindSafe(ON_EVENT_DOMAIN.scope((), async move { task().await }))
                .catch_unwind()
                .await;
            if let Err(panic) = outcome {
                tracing::error!(panic = %panic_message(&panic), "event domain callback panicked");
            }
        }
        tracing::info!("event domain stopped");
    }
}

impl DomainBridge {
    /// Queue `callback` on the event domain. Waits for queue space.
    pub async fn run_on_event_domain<F, Fut>(&self, callback: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task: DomainTask = Box::new(move || callback().boxed());
        self.tx.send(task).await.map_err(|_| Error::DomainClosed)
    }

    /// Non-waiting variant for synchronous callers.
    pub fn try_run_on_event_domain<F, Fut>(&self, callback: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task: DomainTask = Box::new(move || callback().boxed());
        self.tx.try_send(task).map_err(|e| match e {
            TrySendError::Full(_) => Error::DomainBusy,
            TrySendError::Closed(_) => Error::DomainClosed,
        })
    }

    /// Run a blocking closure on the blocking pool.
    pub fn run_in_background<T, F>(&self, work: F) -> Background<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        Background::new(tokio::task::spawn_blocking(work))
    }

    /// Run async I/O on a worker task.
    pub fn spawn_worker<T, Fut>(&self, work: Fut) -> Background<T>
    where
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        Background::new(tokio::spawn(work))
    }

    /// Deliver `work`'s result to `continuation` on the event domain.
    ///
    /// Returns the cancel handle: once canceled the continuation never runs,
    /// even if the result is already sitting in the queue.
    pub fn then<T, C, Fut>(&self, work: Background<T>, continuation: C) -> CancellationToken
    where
        T: Send + 'static,
        C: FnOnce(Result<T>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = work.cancel_handle();
        let guard = cancel.clone();
        let bridge = self.clone();
        tokio::spawn(async move {
            let result = work.await;
            if matches!(result, Err(Error::Canceled)) {
                tracing::debug!("background result dropped after cancel");
                return;
            }
            let posted = bridge
                .run_on_event_domain(move || async move {
                    if guard.is_cancelled() {
                        return;
                    }
                    continuation(result).await;
                })
                .await;
            if let Err(e) = posted {
                tracing::warn!(error = %e, "continuation dropped");
            }
        });
        cancel
    }

    /// Post `callback` to the event domain after `delay`, unless canceled first.
    pub fn run_after<F, Fut>(&self, delay: Duration, callback: F) -> CancellationToken
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let guard = cancel.clone();
        let bridge = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = guard.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let posted = bridge
                .run_on_event_domain(move || async move {
                    if !guard.is_cancelled() {
                        callback().await;
                    }
                })
                .await;
            if let Err(e) = posted {
                tracing::warn!(error = %e, "delayed callback dropped");
            }
        });
        cancel
    }
}

/// Result of work running off the event domain.
///
/// Cancellation is cooperative: the work itself keeps running, but a
/// canceled `Background` resolves to `Error::Canceled`.
pub struct Background<T> {
    handle: JoinHandle<Result<T>>,
    cancel: CancellationToken,
}

impl<T> Background<T> {
    fn new(handle: JoinHandle<Result<T>>) -> Self {
        Self {
            handle,
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl<T> Future for Background<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.cancel.is_cancelled() {
            return Poll::Ready(Err(Error::Canceled));
        }
        match Pin::new(&mut self.handle).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(_) if self.cancel.is_cancelled() => Poll::Ready(Err(Error::Canceled)),
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(join_err)) => Poll::Ready(Err(Error::External(format!(
                "background task failed: {join_err}"
            )))),
        }
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
