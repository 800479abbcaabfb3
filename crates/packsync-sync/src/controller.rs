// ABOUTME: Connectivity-driven sync controller: initial flush and reconcile, then replay on every reconnect.
// ABOUTME: Publishes readiness/online status and the latest manifest reconciliation report over watch channels.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use packsync_core::backend::Backend;
use packsync_core::connectivity::Connectivity;
use packsync_core::manifest::{ManifestSource, ReconcileReport};
use packsync_store::{FlushReport, Outbox, OutboxError, PackStore};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Reserved namespace for packsync's own bookkeeping packs.
pub const META_NAMESPACE: &str = "_packsync";
const CACHE_VERSION_ID: &str = "cache_version";

/// What consumers need to know before trusting local data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStatus {
    pub is_online: bool,
    /// The initial flush and reconciliation have finished (or were skipped).
    pub is_ready: bool,
    /// Durable storage is available.
    pub is_supported: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SyncController {
    packs: Arc<PackStore>,
    outbox: Arc<Outbox>,
    backend: Arc<dyn Backend>,
    manifest: Arc<dyn ManifestSource>,
    connectivity: Connectivity,
    status: watch::Sender<SyncStatus>,
    reports: watch::Sender<Option<ReconcileReport>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SyncController {
    /// Run the initial sync and start following connectivity changes.
    ///
    /// When durable storage is unavailable the controller is ready at once
    /// and only tracks the online flag.
    pub async fn start(
        packs: Arc<PackStore>,
        outbox: Arc<Outbox>,
        backend: Arc<dyn Backend>,
        manifest: Arc<dyn ManifestSource>,
        connectivity: Connectivity,
    ) -> Arc<Self> {
        let mut changes = connectivity.subscribe();
        let online = *changes.borrow_and_update();
        let supported = packs.is_supported() && outbox.is_supported();

        let (status, _) = watch::channel(SyncStatus {
            is_online: online,
            is_ready: false,
            is_supported: supported,
        });
        let (reports, _) = watch::channel(None);

        let controller = Arc::new(Self {
            packs,
            outbox,
            backend,
            manifest,
            connectivity,
            status,
            reports,
            listener: Mutex::new(None),
        });

        if supported {
            if let Err(e) = controller.flush_queue().await {
                tracing::warn!(error = %e, "initial flush failed");
            }
            controller.reconcile().await;
        } else {
            tracing::warn!("durable storage unavailable, sync disabled");
        }

        controller.status.send_modify(|s| s.is_ready = true);
        tracing::info!(online, supported, "sync controller ready");

        let task = tokio::spawn(follow_connectivity(Arc::downgrade(&controller), changes, online));
        *lock(&controller.listener) = Some(task);
        controller
    }

    pub fn status(&self) -> SyncStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Receiver carrying the most recent reconciliation report.
    pub fn watch_reports(&self) -> watch::Receiver<Option<ReconcileReport>> {
        self.reports.subscribe()
    }

    pub fn is_supported(&self) -> bool {
        self.status.borrow().is_supported
    }

    /// Deliver queued mutations now. Reports everything as remaining while
    /// offline.
    pub async fn flush_queue(&self) -> Result<FlushReport, OutboxError> {
        if !self.is_supported() {
            return Ok(FlushReport::default());
        }
        if !self.connectivity.is_online() {
            return Ok(FlushReport {
                remaining: self.outbox.len().await?,
                ..FlushReport::default()
            });
        }
        self.outbox.flush(Arc::clone(&self.backend)).await
    }

    /// Compare the remote manifest with local pack versions, record the new
    /// cache-version token and publish the report. Failures are logged and
    /// yield None.
    pub async fn reconcile(&self) -> Option<ReconcileReport> {
        if !self.is_supported() || !self.connectivity.is_online() {
            return None;
        }

        let manifest = match self.manifest.fetch_manifest().await {
            Ok(manifest) => manifest,
            Err(e) => {
                tracing::warn!(error = %e, "manifest fetch failed, skipping reconciliation");
                return None;
            }
        };

        let mut local_versions = HashMap::new();
        for entry in &manifest.packs {
            match self.packs.load(&entry.namespace, &entry.id).await {
                Ok(Some(pack)) => {
                    local_versions.insert((pack.namespace, pack.id), pack.version);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        namespace = %entry.namespace,
                        id = %entry.id,
                        error = %e,
                        "local pack unreadable, treating as missing"
                    );
                }
            }
        }

        let previous = match self.packs.load(META_NAMESPACE, CACHE_VERSION_ID).await {
            Ok(pack) => pack.and_then(|p| p.data.as_str().map(str::to_string)),
            Err(e) => {
                tracing::warn!(error = %e, "stored cache version unreadable");
                None
            }
        };

        let report = ReconcileReport::compute(&manifest, &local_versions, previous);
        if report.cache_version_changed
            && let Err(e) = self
                .packs
                .save(
                    META_NAMESPACE,
                    CACHE_VERSION_ID,
                    Value::String(report.cache_version.clone()),
                    &report.cache_version,
                )
                .await
        {
            tracing::warn!(error = %e, "could not store cache version");
        }

        tracing::info!(
            stale = report.needs_download.len(),
            cache_version = %report.cache_version,
            cache_version_changed = report.cache_version_changed,
            "reconciled with manifest"
        );
        self.reports.send_replace(Some(report.clone()));
        Some(report)
    }

    /// Stop following connectivity changes.
    pub fn shutdown(&self) {
        if let Some(task) = lock(&self.listener).take() {
            task.abort();
            tracing::debug!("sync controller stopped");
        }
    }

    async fn on_connectivity(&self, online: bool, was_online: bool) {
        self.status.send_if_modified(|s| {
            let changed = s.is_online != online;
            s.is_online = online;
            changed
        });

        if !online || was_online {
            if !online {
                tracing::info!("offline, queueing writes locally");
            }
            return;
        }
        if !self.is_supported() {
            return;
        }

        tracing::info!("back online, replaying queued writes");
        if let Err(e) = self.flush_queue().await {
            tracing::warn!(error = %e, "flush after reconnect failed");
        }
        self.reconcile().await;
    }
}

impl Drop for SyncController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for SyncController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncController")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

async fn follow_connectivity(
    controller: Weak<SyncController>,
    mut changes: watch::Receiver<bool>,
    mut was_online: bool,
) {
    while changes.changed().await.is_ok() {
        let online = *changes.borrow_and_update();
        let Some(controller) = controller.upgrade() else {
            break;
        };
        controller.on_connectivity(online, was_online).await;
        was_online = online;
    }
}
