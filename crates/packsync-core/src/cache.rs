// ABOUTME: In-memory stale-while-revalidate cache for read queries, keyed independently of the pack store.
// ABOUTME: Shares one in-flight fetch per key, keeps data across failed refreshes, and notifies subscribers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::time::Instant;

use crate::listeners::{ListenerRegistry, Subscription};

/// Error produced by a fetcher, shared between every caller awaiting it.
pub type FetchError = Arc<anyhow::Error>;

type InFlight<T> = Shared<BoxFuture<'static, Result<T, FetchError>>>;

/// Lifecycle of a cache entry as seen by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Idle,
    Loading,
    Success,
    Error,
}

/// Freshness budget for a fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
    pub stale_time: Duration,
}

impl FetchOptions {
    pub fn stale_after(stale_time: Duration) -> Self {
        Self { stale_time }
    }
}

/// Point-in-time view of one cache entry.
#[derive(Debug)]
pub struct Snapshot<T> {
    pub status: FetchStatus,
    pub data: Option<T>,
    pub error: Option<FetchError>,
    pub updated_at: Option<DateTime<Utc>>,
    pub stale: bool,
}

struct Entry<T> {
    data: Option<T>,
    error: Option<FetchError>,
    in_flight: Option<(u64, InFlight<T>)>,
    updated_at: Option<DateTime<Utc>>,
    fetched_at: Option<Instant>,
    stale_time: Duration,
    /// Changes whenever the entry is written or invalidated outside a fetch.
    /// A fetch only commits if the generation it started with is unchanged.
    generation: u64,
    snapshot: Option<Arc<Snapshot<T>>>,
}

impl<T: Clone> Entry<T> {
    fn new(generation: u64) -> Self {
        Self {
            data: None,
            error: None,
            in_flight: None,
            updated_at: None,
            fetched_at: None,
            stale_time: Duration::ZERO,
            generation,
            snapshot: None,
        }
    }

    fn is_stale(&self, now: Instant) -> bool {
        match self.fetched_at {
            None => true,
            Some(fetched_at) => now.duration_since(fetched_at) > self.stale_time,
        }
    }

    fn status(&self) -> FetchStatus {
        if self.in_flight.is_some() {
            FetchStatus::Loading
        } else if self.error.is_some() {
            FetchStatus::Error
        } else if self.data.is_some() {
            FetchStatus::Success
        } else {
            FetchStatus::Idle
        }
    }

    fn snapshot(&mut self, now: Instant) -> Arc<Snapshot<T>> {
        let stale = self.is_stale(now);
        if let Some(snapshot) = &self.snapshot
            && snapshot.stale == stale
        {
            return Arc::clone(snapshot);
        }
        let snapshot = Arc::new(Snapshot {
            status: self.status(),
            data: self.data.clone(),
            error: self.error.clone(),
            updated_at: self.updated_at,
            stale,
        });
        self.snapshot = Some(Arc::clone(&snapshot));
        snapshot
    }
}

struct Inner<T> {
    entries: Mutex<HashMap<String, Entry<T>>>,
    tokens: AtomicU64,
    listeners: ListenerRegistry<FetchStatus>,
}

impl<T> Inner<T> {
    fn next_token(&self) -> u64 {
        self.tokens.fetch_add(1, Ordering::Relaxed)
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry<T>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Stale-while-revalidate cache. Cloning is cheap and clones share state.
pub struct ReadCache<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for ReadCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for ReadCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> ReadCache<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                tokens: AtomicU64::new(1),
                listeners: ListenerRegistry::new(),
            }),
        }
    }

    /// Return cached data for `key` if it is fresh, join an in-flight fetch
    /// if there is one, or run `fetcher` and store its outcome.
    pub async fn fetch<F, Fut>(
        &self,
        key: &str,
        fetcher: F,
        options: FetchOptions,
    ) -> Result<T, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let (joined, generation) = {
            let mut entries = self.inner.entries();
            let entry = entries
                .entry(key.to_string())
                .or_insert_with(|| Entry::new(self.inner.next_token()));
            entry.stale_time = options.stale_time;

            match &entry.in_flight {
                Some((_, in_flight)) => (Some(in_flight.clone()), entry.generation),
                None => {
                    if !entry.is_stale(Instant::now())
                        && let Some(data) = &entry.data
                    {
                        return Ok(data.clone());
                    }
                    (None, entry.generation)
                }
            }
        };
        if let Some(task) = joined {
            return task.await;
        }

        // The fetcher may read this cache, so it runs with the lock released.
        let request = fetcher();

        let (task, started) = {
            let mut entries = self.inner.entries();
            let entry = entries
                .entry(key.to_string())
                .or_insert_with(|| Entry::new(self.inner.next_token()));

            if let Some((_, in_flight)) = &entry.in_flight {
                tracing::debug!("cache entry {:?} started fetching concurrently; joining", key);
                (in_flight.clone(), false)
            } else {
                let fetch_id = self.inner.next_token();
                let cache = self.clone();
                let owned_key = key.to_string();
                let task = async move {
                    let result = request.await.map_err(Arc::new);
                    cache.commit(&owned_key, fetch_id, generation, &result);
                    result
                }
                .boxed()
                .shared();

                entry.in_flight = Some((fetch_id, task.clone()));
                entry.snapshot = None;
                (task, true)
            }
        };

        if started {
            self.inner.listeners.notify(key, &FetchStatus::Loading);
        }
        task.await
    }

    fn commit(&self, key: &str, fetch_id: u64, generation: u64, result: &Result<T, FetchError>) {
        let status = {
            let mut entries = self.inner.entries();
            let Some(entry) = entries.get_mut(key) else {
                tracing::debug!("cache entry {:?} removed during fetch; dropping result", key);
                return;
            };

            if matches!(&entry.in_flight, Some((id, _)) if *id == fetch_id) {
                entry.in_flight = None;
            }

            if entry.generation == generation {
                match result {
                    Ok(data) => {
                        entry.data = Some(data.clone());
                        entry.error = None;
                        entry.updated_at = Some(Utc::now());
                        entry.fetched_at = Some(Instant::now());
                    }
                    Err(error) => {
                        // Keep previously cached data; only surface the error.
                        entry.error = Some(Arc::clone(error));
                    }
                }
            } else {
                tracing::debug!("cache entry {:?} changed during fetch; result superseded", key);
            }

            entry.snapshot = None;
            entry.status()
        };

        self.inner.listeners.notify(key, &status);
    }

    /// Current state of `key`. The same `Arc` is returned until the entry
    /// changes or crosses its staleness boundary.
    pub fn snapshot(&self, key: &str) -> Arc<Snapshot<T>> {
        let mut entries = self.inner.entries();
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(self.inner.next_token()));
        entry.snapshot(Instant::now())
    }

    /// Register `listener` for every state transition of `key`.
    pub fn subscribe<F>(&self, key: &str, listener: F) -> Subscription
    where
        F: Fn(&FetchStatus) + Send + Sync + 'static,
    {
        self.inner.listeners.subscribe(key, listener)
    }

    /// Overwrite the cached value without running a fetcher.
    pub fn set_data(&self, key: &str, value: T) {
        self.update_data(key, move |_| value);
    }

    /// Overwrite the cached value from its previous value.
    pub fn update_data<F>(&self, key: &str, updater: F)
    where
        F: FnOnce(Option<&T>) -> T,
    {
        let previous = self.inner.entries().get(key).and_then(|entry| entry.data.clone());
        let next = updater(previous.as_ref());
        {
            let mut entries = self.inner.entries();
            let entry = entries
                .entry(key.to_string())
                .or_insert_with(|| Entry::new(self.inner.next_token()));
            entry.data = Some(next);
            entry.error = None;
            entry.updated_at = Some(Utc::now());
            entry.fetched_at = Some(Instant::now());
            entry.generation = self.inner.next_token();
            entry.snapshot = None;
        }
        self.inner.listeners.notify(key, &FetchStatus::Success);
    }

    /// Mark `key` stale so the next fetch runs its fetcher regardless of the
    /// freshness budget. Cached data stays readable.
    pub fn invalidate(&self, key: &str) {
        let status = {
            let mut entries = self.inner.entries();
            let Some(entry) = entries.get_mut(key) else {
                return;
            };
            entry.updated_at = None;
            entry.fetched_at = None;
            entry.generation = self.inner.next_token();
            entry.snapshot = None;
            entry.status()
        };
        self.inner.listeners.notify(key, &status);
    }

    /// Drop `key` entirely. A fetch still in flight finishes but is not stored.
    pub fn remove(&self, key: &str) {
        let removed = self.inner.entries().remove(key).is_some();
        if removed {
            self.inner.listeners.notify(key, &FetchStatus::Idle);
        }
    }

    /// Drop every entry, e.g. on sign-out.
    pub fn clear(&self) {
        let keys: Vec<String> = self.inner.entries().drain().map(|(key, _)| key).collect();
        for key in keys {
            self.inner.listeners.notify(&key, &FetchStatus::Idle);
        }
    }
}
