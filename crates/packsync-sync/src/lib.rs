// ABOUTME: Sync layer for packsync: the connectivity-driven controller, per-namespace pack loader and HTTP adapters.
// ABOUTME: Also owns daemon configuration and the reachability probe that feeds the connectivity signal.

pub mod config;
pub mod controller;
pub mod loader;
pub mod probe;
pub mod rest;

#[cfg(test)]
mod fake_server;

pub use config::{ConfigError, SyncConfig};
pub use controller::{META_NAMESPACE, SyncController, SyncStatus};
pub use loader::{Fetched, LoadOutcome, LoadSource, LoaderError, MutateOutcome, PackLoader};
pub use probe::ConnectivityProbe;
pub use rest::{HttpManifestSource, RestBackend};
