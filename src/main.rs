// ABOUTME: Entry point for the packsync daemon.
// ABOUTME: Loads config, opens durable storage, and runs the sync controller and connectivity probe until ctrl-c.

use std::sync::Arc;

use packsync_core::connectivity::Connectivity;
use packsync_store::{Outbox, PackStore, SqliteSubstrate, Substrate};
use packsync_sync::{ConnectivityProbe, HttpManifestSource, RestBackend, SyncConfig, SyncController};

/// Open the shared SQLite file, or run degraded if it cannot be opened.
fn open_storage(config: &SyncConfig) -> (Option<Arc<dyn Substrate>>, Option<Arc<dyn Substrate>>) {
    match SqliteSubstrate::open(&config.database_path(), "packs") {
        Ok(packs) => {
            let outbox = packs.with_store("outbox");
            let packs: Arc<dyn Substrate> = Arc::new(packs);
            let outbox: Arc<dyn Substrate> = Arc::new(outbox);
            (Some(packs), Some(outbox))
        }
        Err(e) => {
            tracing::warn!(
                path = %config.database_path().display(),
                error = %e,
                "cannot open storage, running without persistence"
            );
            (None, None)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("packsync=debug")),
        )
        .init();

    let config = SyncConfig::from_env()?;
    tracing::info!(
        home = %config.home.display(),
        backend = %config.backend_url,
        "packsync starting up"
    );

    let connectivity = Connectivity::new(false);
    let (pack_substrate, outbox_substrate) = open_storage(&config);
    let packs = Arc::new(PackStore::new(pack_substrate));
    let outbox = Arc::new(
        Outbox::new(outbox_substrate, config.retry_policy())
            .with_connectivity(connectivity.clone()),
    );

    let backend = Arc::new(RestBackend::new(
        config.backend_url.clone(),
        config.api_key.clone(),
        config.request_timeout,
    )?);
    let manifest = Arc::new(HttpManifestSource::new(
        config.manifest_url.clone(),
        config.api_key.clone(),
        config.request_timeout,
    )?);
    let probe = ConnectivityProbe::new(
        config.health_url.clone(),
        config.api_key.clone(),
        connectivity.clone(),
        config.probe_interval,
        config.request_timeout,
    )?;

    // Learn the real state before the initial sync decides what to do.
    probe.check().await;
    let controller =
        SyncController::start(packs, Arc::clone(&outbox), backend, manifest, connectivity).await;
    let probe_task = probe.spawn();

    let mut reports = controller.watch_reports();
    let report_task = tokio::spawn(async move {
        while reports.changed().await.is_ok() {
            let report = reports.borrow_and_update().clone();
            if let Some(report) = report {
                for stale in &report.needs_download {
                    tracing::info!(
                        namespace = %stale.namespace,
                        id = %stale.id,
                        local = stale.local_version.as_deref().unwrap_or("-"),
                        expected = %stale.expected_version,
                        "pack needs download"
                    );
                }
            }
        }
    });

    let status = controller.status();
    let pending = outbox.len().await.unwrap_or(0);
    tracing::info!(
        online = status.is_online,
        supported = status.is_supported,
        pending,
        "packsync ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    probe_task.abort();
    report_task.abort();
    controller.shutdown();
    Ok(())
}
