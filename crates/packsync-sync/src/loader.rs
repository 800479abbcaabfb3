// ABOUTME: Per-namespace pack loader combining the read cache, the pack store and the outbox.
// ABOUTME: Loads network-first with offline fallback, applies optimistic writes, and refreshes stale packs.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use packsync_core::cache::{FetchError, FetchOptions, ReadCache};
use packsync_core::connectivity::Connectivity;
use packsync_core::manifest::ReconcileReport;
use packsync_core::mutation::{ActionRequest, OutboxItem};
use packsync_core::pack::{KeyError, Pack, PackKey, namespace_prefix};
use packsync_store::{Outbox, OutboxError, PackStore, PackStoreError};
use serde_json::Value;
use thiserror::Error;

/// Errors that can occur while loading or mutating packs.
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("invalid pack key: {0}")]
    Key(#[from] KeyError),

    #[error(transparent)]
    Store(#[from] PackStoreError),

    #[error(transparent)]
    Outbox(#[from] OutboxError),

    #[error("fetch failed and no local copy exists: {0}")]
    Fetch(FetchError),

    #[error("pack {namespace}/{id} is not available offline")]
    Unavailable { namespace: String, id: String },
}

/// Data and version produced by a network fetcher.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub data: Value,
    pub version: String,
}

impl Fetched {
    pub fn new(data: Value, version: impl Into<String>) -> Self {
        Self {
            data,
            version: version.into(),
        }
    }
}

/// Where a loaded pack came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Network,
    Cache,
    PackStore,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadOutcome {
    pub pack: Pack,
    pub source: LoadSource,
}

/// Result of an optimistic write.
#[derive(Debug, Clone, PartialEq)]
pub struct MutateOutcome {
    pub pack: Pack,
    /// None when durable storage is unavailable and nothing was queued.
    pub queued: Option<OutboxItem>,
}

pub struct PackLoader {
    namespace: String,
    packs: Arc<PackStore>,
    cache: ReadCache<Pack>,
    outbox: Arc<Outbox>,
    connectivity: Connectivity,
    options: FetchOptions,
}

impl PackLoader {
    pub fn new(
        namespace: impl Into<String>,
        packs: Arc<PackStore>,
        cache: ReadCache<Pack>,
        outbox: Arc<Outbox>,
        connectivity: Connectivity,
        options: FetchOptions,
    ) -> Result<Self, KeyError> {
        let namespace = namespace.into();
        namespace_prefix(&namespace)?;
        Ok(Self {
            namespace,
            packs,
            cache,
            outbox,
            connectivity,
            options,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn cache(&self) -> &ReadCache<Pack> {
        &self.cache
    }

    fn cache_key(&self, id: &str) -> Result<String, KeyError> {
        Ok(PackKey::new(&self.namespace, id)?.storage_key())
    }

    /// Load pack `id`, network first while online.
    ///
    /// Fresh cached data is returned without calling `fetcher`. A fetched
    /// pack is persisted unless a local write superseded it mid-flight. When
    /// offline, or when the fetch fails, the stored pack is returned instead.
    pub async fn load<F, Fut>(&self, id: &str, fetcher: F) -> Result<LoadOutcome, LoaderError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Fetched>> + Send + 'static,
    {
        let key = self.cache_key(id)?;

        let fetch_error = if self.connectivity.is_online() {
            let ran = Arc::new(AtomicBool::new(false));
            let ran_flag = Arc::clone(&ran);
            let namespace = self.namespace.clone();
            let pack_id = id.to_string();
            let result = self
                .cache
                .fetch(
                    &key,
                    move || {
                        ran_flag.store(true, Ordering::SeqCst);
                        let request = fetcher();
                        async move {
                            let fetched = request.await?;
                            Ok::<_, anyhow::Error>(Pack::new(
                                namespace,
                                pack_id,
                                fetched.data,
                                fetched.version,
                            ))
                        }
                    },
                    self.options,
                )
                .await;

            match result {
                Ok(pack) if ran.load(Ordering::SeqCst) => {
                    return self.settle_fetched(&key, pack).await;
                }
                Ok(pack) => {
                    return Ok(LoadOutcome {
                        pack,
                        source: LoadSource::Cache,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        namespace = %self.namespace,
                        id,
                        error = %e,
                        "fetch failed, falling back to local copy"
                    );
                    Some(e)
                }
            }
        } else {
            None
        };

        if let Some(pack) = self.packs.load(&self.namespace, id).await? {
            return Ok(LoadOutcome {
                pack,
                source: LoadSource::PackStore,
            });
        }
        if let Some(pack) = self.cache.snapshot(&key).data.clone() {
            return Ok(LoadOutcome {
                pack,
                source: LoadSource::Cache,
            });
        }

        Err(match fetch_error {
            Some(e) => LoaderError::Fetch(e),
            None => LoaderError::Unavailable {
                namespace: self.namespace.clone(),
                id: id.to_string(),
            },
        })
    }

    async fn settle_fetched(&self, key: &str, pack: Pack) -> Result<LoadOutcome, LoaderError> {
        let current = self.cache.snapshot(key);
        if let Some(newer) = &current.data
            && *newer != pack
        {
            tracing::debug!(key, "fetched pack superseded by a local write");
            return Ok(LoadOutcome {
                pack: newer.clone(),
                source: LoadSource::Cache,
            });
        }

        self.packs
            .save(&pack.namespace, &pack.id, pack.data.clone(), &pack.version)
            .await?;
        Ok(LoadOutcome {
            pack,
            source: LoadSource::Network,
        })
    }

    /// Apply a write locally right away and queue `action` for delivery.
    ///
    /// The action is validated before anything is written.
    pub async fn mutate(
        &self,
        id: &str,
        data: Value,
        version: &str,
        action: ActionRequest,
    ) -> Result<MutateOutcome, LoaderError> {
        let key = self.cache_key(id)?;
        action.to_mutation().map_err(OutboxError::from)?;

        let pack = match self.packs.save(&self.namespace, id, data.clone(), version).await? {
            Some(pack) => pack,
            None => Pack::new(self.namespace.clone(), id, data, version),
        };
        self.cache.set_data(&key, pack.clone());

        let queued = self.outbox.enqueue(action).await?;
        tracing::debug!(
            namespace = %self.namespace,
            id,
            queued = queued.is_some(),
            "optimistic write applied"
        );
        Ok(MutateOutcome { pack, queued })
    }

    /// Re-fetch every pack of this namespace the report lists as stale.
    /// Returns the ids refreshed from the network; failures are logged.
    pub async fn refresh_from_report<F, Fut>(
        &self,
        report: &ReconcileReport,
        fetcher: F,
    ) -> Vec<String>
    where
        F: Fn(&str) -> Fut,
        Fut: Future<Output = anyhow::Result<Fetched>> + Send + 'static,
    {
        let mut refreshed = Vec::new();
        for stale in report.stale_in(&self.namespace) {
            let Ok(key) = self.cache_key(&stale.id) else {
                tracing::warn!(id = %stale.id, "manifest lists an invalid pack id");
                continue;
            };
            self.cache.invalidate(&key);

            match self.load(&stale.id, || fetcher(&stale.id)).await {
                Ok(LoadOutcome {
                    source: LoadSource::Network,
                    ..
                }) => refreshed.push(stale.id.clone()),
                Ok(_) => {
                    tracing::warn!(
                        namespace = %self.namespace,
                        id = %stale.id,
                        "stale pack not refreshed"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        namespace = %self.namespace,
                        id = %stale.id,
                        error = %e,
                        "refresh failed"
                    );
                }
            }
        }
        refreshed
    }
}
