// ABOUTME: Durable FIFO queue of pending backend mutations, replayed in order when connectivity returns.
// ABOUTME: Tracks attempts per item, dead-letters items past the retry budget, and shares one in-flight flush.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use packsync_core::backend::Backend;
use packsync_core::connectivity::Connectivity;
use packsync_core::mutation::{ActionRequest, MutationError, OutboxItem};
use thiserror::Error;
use ulid::Ulid;

use crate::substrate::{Substrate, SubstrateError};

/// Pack namespaces can never be empty, so a leading separator keeps queued
/// items out of reach of pack keys when both share one substrate.
const ITEM_PREFIX: &str = "/outbox/";

/// Errors that can occur while queueing or delivering mutations.
#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("invalid action: {0}")]
    InvalidAction(#[from] MutationError),

    #[error("storage error: {0}")]
    Substrate(#[from] SubstrateError),

    #[error("queued item {key} is unreadable: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("flush aborted: {0}")]
    FlushAborted(String),
}

/// How failed deliveries are retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after which an item is dead-lettered. None retries forever.
    pub max_attempts: Option<u32>,
    /// Delay before the first retry, doubled per attempt. Zero retries on
    /// every flush.
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(10),
            base_backoff: Duration::ZERO,
            max_backoff: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Delay required after the `attempts`-th failure before trying again.
    pub fn backoff_after(&self, attempts: u32) -> Duration {
        if self.base_backoff.is_zero() || attempts == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32 << (attempts - 1).min(20);
        self.base_backoff.saturating_mul(factor).min(self.max_backoff)
    }

    fn next_retry_at(&self, item: &OutboxItem) -> Option<DateTime<Utc>> {
        let last_tried = item.last_tried_at?;
        let delay = self.backoff_after(item.attempts);
        if delay.is_zero() {
            return None;
        }
        let delay = chrono::Duration::from_std(delay).ok()?;
        last_tried.checked_add_signed(delay)
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| max > 0 && attempts >= max)
    }
}

/// Outcome of one flush pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Items delivered and removed from the queue.
    pub flushed: usize,
    /// Items still pending after the pass.
    pub remaining: usize,
    /// Deliveries that failed during the pass.
    pub failed: usize,
    /// Items moved to the dead-letter set during the pass.
    pub dead_lettered: usize,
    /// Items left alone because their retry backoff has not elapsed.
    pub skipped: usize,
}

type SharedFlush = Shared<BoxFuture<'static, Result<FlushReport, String>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn item_key(id: &str) -> String {
    format!("{ITEM_PREFIX}{id}")
}

pub struct Outbox {
    substrate: Option<Arc<dyn Substrate>>,
    policy: RetryPolicy,
    connectivity: Option<Connectivity>,
    /// Serializes queue writes. Holds the next sequence number once loaded.
    write_lock: tokio::sync::Mutex<Option<u64>>,
    in_flight: Mutex<Option<SharedFlush>>,
}

impl Outbox {
    pub fn new(substrate: Option<Arc<dyn Substrate>>, policy: RetryPolicy) -> Self {
        Self {
            substrate,
            policy,
            connectivity: None,
            write_lock: tokio::sync::Mutex::new(None),
            in_flight: Mutex::new(None),
        }
    }

    pub fn unsupported() -> Self {
        Self::new(None, RetryPolicy::default())
    }

    /// Skip delivery entirely while `connectivity` reports offline.
    pub fn with_connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    pub fn is_supported(&self) -> bool {
        self.substrate.is_some()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn is_online(&self) -> bool {
        self.connectivity.as_ref().is_none_or(Connectivity::is_online)
    }

    /// Validate and durably queue a mutation. Enqueueing an id that is
    /// already queued returns the existing item unchanged. Returns None when
    /// there is no durable storage.
    pub async fn enqueue(&self, request: ActionRequest) -> Result<Option<OutboxItem>, OutboxError> {
        let mutation = request.to_mutation()?;
        let Some(substrate) = &self.substrate else {
            tracing::warn!(table = %request.table, "no durable storage, mutation not queued");
            return Ok(None);
        };

        let id = request
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Ulid::new().to_string());
        let key = item_key(&id);

        let mut next_seq = self.write_lock.lock().await;
        if let Some(existing) = substrate.get(&key).await? {
            tracing::debug!(id = %id, "mutation already queued");
            return decode_item(key, existing).map(Some);
        }

        let seq = match *next_seq {
            Some(seq) => seq,
            None => self.highest_seq(substrate.as_ref()).await?.map_or(0, |s| s + 1),
        };

        let item = OutboxItem {
            id,
            table: request.table.clone(),
            mutation,
            queued_at: Utc::now(),
            seq,
            attempts: 0,
            last_error: None,
            last_tried_at: None,
            dead_lettered_at: None,
        };
        let encoded = serde_json::to_value(&item).map_err(SubstrateError::from)?;
        substrate.set(&key, encoded).await?;
        *next_seq = Some(seq + 1);

        tracing::debug!(
            id = %item.id,
            table = %item.table,
            op = %item.mutation.kind(),
            seq,
            "mutation queued"
        );
        Ok(Some(item))
    }

    async fn highest_seq(&self, substrate: &dyn Substrate) -> Result<Option<u64>, OutboxError> {
        Ok(self.scan(substrate).await?.iter().map(|item| item.seq).max())
    }

    async fn scan(&self, substrate: &dyn Substrate) -> Result<Vec<OutboxItem>, OutboxError> {
        let mut items = Vec::new();
        for (key, value) in substrate.scan_prefix(ITEM_PREFIX).await? {
            match decode_item(key, value) {
                Ok(item) => items.push(item),
                Err(e) => tracing::warn!(error = %e, "skipping unreadable outbox item"),
            }
        }
        items.sort_by_key(OutboxItem::order_key);
        Ok(items)
    }

    /// Pending items in delivery order.
    pub async fn list(&self) -> Result<Vec<OutboxItem>, OutboxError> {
        let Some(substrate) = &self.substrate else {
            return Ok(Vec::new());
        };
        let mut items = self.scan(substrate.as_ref()).await?;
        items.retain(|item| !item.is_dead_lettered());
        Ok(items)
    }

    /// Items that exhausted their retry budget.
    pub async fn dead_letters(&self) -> Result<Vec<OutboxItem>, OutboxError> {
        let Some(substrate) = &self.substrate else {
            return Ok(Vec::new());
        };
        let mut items = self.scan(substrate.as_ref()).await?;
        items.retain(OutboxItem::is_dead_lettered);
        Ok(items)
    }

    /// Put every dead-lettered item back in the pending queue with a fresh
    /// retry budget. Returns how many items were requeued.
    pub async fn requeue_dead_letters(&self) -> Result<usize, OutboxError> {
        let Some(substrate) = &self.substrate else {
            return Ok(0);
        };

        let _guard = self.write_lock.lock().await;
        let mut requeued = 0;
        for mut item in self.scan(substrate.as_ref()).await? {
            if !item.is_dead_lettered() {
                continue;
            }
            item.dead_lettered_at = None;
            item.attempts = 0;
            let encoded = serde_json::to_value(&item).map_err(SubstrateError::from)?;
            substrate.set(&item_key(&item.id), encoded).await?;
            requeued += 1;
        }
        if requeued > 0 {
            tracing::info!(requeued, "dead letters requeued");
        }
        Ok(requeued)
    }

    /// Number of pending items.
    pub async fn len(&self) -> Result<usize, OutboxError> {
        Ok(self.list().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool, OutboxError> {
        Ok(self.len().await? == 0)
    }

    /// Remove every item, pending and dead-lettered.
    pub async fn clear(&self) -> Result<usize, OutboxError> {
        let Some(substrate) = &self.substrate else {
            return Ok(0);
        };
        let _guard = self.write_lock.lock().await;
        let removed = substrate.remove_prefix(ITEM_PREFIX).await?;
        tracing::info!(removed, "outbox cleared");
        Ok(removed)
    }

    /// Deliver pending items to `backend` in FIFO order.
    ///
    /// A flush requested while another is running joins it and receives the
    /// same report, so no item is delivered twice by overlapping calls.
    pub async fn flush(
        self: &Arc<Self>,
        backend: Arc<dyn Backend>,
    ) -> Result<FlushReport, OutboxError> {
        let pass = {
            let mut slot = lock(&self.in_flight);
            match slot.as_ref() {
                Some(pass) => {
                    tracing::debug!("joining in-flight flush");
                    pass.clone()
                }
                None => {
                    let outbox = Arc::clone(self);
                    let pass = async move {
                        let result = outbox.run_flush(backend).await.map_err(|e| e.to_string());
                        *lock(&outbox.in_flight) = None;
                        result
                    }
                    .boxed()
                    .shared();
                    *slot = Some(pass.clone());
                    pass
                }
            }
        };
        pass.await.map_err(OutboxError::FlushAborted)
    }

    async fn run_flush(&self, backend: Arc<dyn Backend>) -> Result<FlushReport, OutboxError> {
        let Some(substrate) = &self.substrate else {
            return Ok(FlushReport::default());
        };

        let pending = self.list().await?;
        let mut report = FlushReport::default();
        if pending.is_empty() {
            return Ok(report);
        }
        if !self.is_online() {
            tracing::debug!(pending = pending.len(), "offline, flush skipped");
            report.remaining = pending.len();
            return Ok(report);
        }

        tracing::info!(pending = pending.len(), "flushing outbox");
        for item in pending {
            if !self.is_online() {
                report.remaining += 1;
                continue;
            }
            if let Some(due) = self.policy.next_retry_at(&item)
                && due > Utc::now()
            {
                report.skipped += 1;
                report.remaining += 1;
                continue;
            }

            match item.mutation.apply(&item.table, backend.as_ref()).await {
                Ok(()) => {
                    substrate.remove(&item_key(&item.id)).await?;
                    report.flushed += 1;
                    tracing::debug!(
                        id = %item.id,
                        table = %item.table,
                        op = %item.mutation.kind(),
                        "delivered"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        id = %item.id,
                        table = %item.table,
                        error = %e,
                        "delivery failed"
                    );
                    if self.record_failure(substrate.as_ref(), &item.id, e.to_string()).await? {
                        report.dead_lettered += 1;
                    } else {
                        report.remaining += 1;
                    }
                }
            }
        }

        tracing::info!(
            flushed = report.flushed,
            remaining = report.remaining,
            failed = report.failed,
            dead_lettered = report.dead_lettered,
            "flush complete"
        );
        Ok(report)
    }

    /// Record a failed attempt on the stored item. Returns true when the item
    /// was dead-lettered by this failure.
    async fn record_failure(
        &self,
        substrate: &dyn Substrate,
        id: &str,
        error: String,
    ) -> Result<bool, OutboxError> {
        let key = item_key(id);
        let _guard = self.write_lock.lock().await;
        let Some(stored) = substrate.get(&key).await? else {
            return Ok(false);
        };

        let mut item = decode_item(key.clone(), stored)?;
        let now = Utc::now();
        item.attempts += 1;
        item.last_error = Some(error);
        item.last_tried_at = Some(now);

        let dead = self.policy.exhausted(item.attempts);
        if dead {
            item.dead_lettered_at = Some(now);
            tracing::warn!(
                id = %item.id,
                attempts = item.attempts,
                "retry budget exhausted, dead-lettering"
            );
        }

        let encoded = serde_json::to_value(&item).map_err(SubstrateError::from)?;
        substrate.set(&key, encoded).await?;
        Ok(dead)
    }
}

impl std::fmt::Debug for Outbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbox")
            .field("supported", &self.is_supported())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

fn decode_item(key: String, value: serde_json::Value) -> Result<OutboxItem, OutboxError> {
    serde_json::from_value(value).map_err(|source| OutboxError::Decode { key, source })
}
