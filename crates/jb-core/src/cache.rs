use std::{
    collections::HashMap,
    future::Future,
    hash::Hash,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use futures_util::future::{BoxFuture, FutureExt, Shared};

use crate::{Error, Result};

type SharedFetch<V> = Shared<BoxFuture<'static, std::result::Result<V, Arc<Error>>>>;

enum Slot<V> {
    Ready { value: V, fetched_at: Instant },
    Pending(SharedFetch<V>),
}

/// Key/value cache with a TTL and single-flight fetches.
///
/// Concurrent misses on one key share a single fetch and all observe its
/// result. The map lock is held only to inspect or swap a slot, never while a
/// fetch runs, so keys do not block each other. Failed fetches leave nothing
/// behind.
pub struct ObjectCache<K, V> {
    ttl: Duration,
    slots: Mutex<HashMap<K, Slot<V>>>,
}

impl<K, V> ObjectCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_or_fetch<F, Fut>(&self, key: K, fetch: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let pending = {
            let mut slots = self.lock();
            let existing = match slots.get(&key) {
                Some(Slot::Ready { value, fetched_at }) if fetched_at.elapsed() < self.ttl => {
                    return Ok(value.clone());
                }
                Some(Slot::Pending(shared)) => Some(shared.clone()),
                _ => None,
            };
            match existing {
                Some(shared) => shared,
                None => {
                    let shared = fetch().map(|res| res.map_err(Arc::new)).boxed().shared();
                    slots.insert(key.clone(), Slot::Pending(shared.clone()));
                    shared
                }
            }
        };

        let outcome = pending.clone().await;

        {
            let mut slots = self.lock();
            // Only the fetch still registered for the key may settle it; an
            // invalidation in the meantime wins.
            let current = matches!(
                slots.get(&key),
                Some(Slot::Pending(shared)) if shared.ptr_eq(&pending)
            );
            if current {
                match &outcome {
                    Ok(value) => {
                        slots.insert(
                            key,
                            Slot::Ready {
                                value: value.clone(),
                                fetched_at: Instant::now(),
                            },
                        );
                    }
                    Err(_) => {
                        slots.remove(&key);
                    }
                }
            }
        }

        outcome.map_err(Error::Shared)
    }

    /// Fresh cached value without fetching.
    pub fn peek(&self, key: &K) -> Option<V> {
        match self.lock().get(key) {
            Some(Slot::Ready { value, fetched_at }) if fetched_at.elapsed() < self.ttl => {
                Some(value.clone())
            }
            _ => None,
        }
    }

    pub fn invalidate(&self, key: &K) {
        self.lock().remove(key);
    }

    pub fn invalidate_all(&self) {
        self.lock().clear();
    }

    /// Drop expired entries; returns how many were reclaimed.
    pub fn sweep(&self) -> usize {
        let ttl = self.ttl;
        let mut slots = self.lock();
        let before = slots.len();
        slots.retain(|_, slot| match slot {
            Slot::Ready { fetched_at, .. } => fetched_at.elapsed() < ttl,
            Slot::Pending(_) => true,
        });
        before - slots.len()
    }

    /// Fresh entries (in-flight fetches excluded).
    pub fn len(&self) -> usize {
        self.lock()
            .values()
            .filter(|slot| {
                matches!(slot, Slot::Ready { fetched_at, .. } if fetched_at.elapsed() < self.ttl)
            })
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Slot<V>>> {
        self.slots.lock().unwrap_or_else(|p| p.into_inner())
    }
}
