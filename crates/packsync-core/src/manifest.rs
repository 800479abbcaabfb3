// ABOUTME: Remote manifest of expected pack versions and the reconciliation diff against local packs.
// ABOUTME: The diff only reports what is stale; re-fetching is left to the feature loaders.

use std::cmp::Ordering;
use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while fetching a manifest.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("manifest request failed: {0}")]
    Transport(String),

    #[error("manifest endpoint returned status {0}")]
    Status(u16),

    #[error("manifest body could not be decoded: {0}")]
    Decode(String),
}

/// One pack the server expects clients to hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub namespace: String,
    pub id: String,
    pub expected_version: String,
}

/// Server-provided description of expected pack versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub cache_version: String,
    #[serde(default)]
    pub packs: Vec<ManifestEntry>,
}

/// Source of the remote manifest.
#[async_trait]
pub trait ManifestSource: Send + Sync {
    async fn fetch_manifest(&self) -> Result<Manifest, ManifestError>;
}

/// A pack whose local copy is missing or behind the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StalePack {
    pub namespace: String,
    pub id: String,
    pub local_version: Option<String>,
    pub expected_version: String,
}

/// Result of comparing a manifest with the local pack store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub needs_download: Vec<StalePack>,
    pub cache_version: String,
    pub previous_cache_version: Option<String>,
    /// True when the cache-version token differs from the stored one,
    /// including the first reconciliation when nothing was stored yet.
    pub cache_version_changed: bool,
}

impl ReconcileReport {
    /// Diff `manifest` against local versions keyed by `(namespace, id)`.
    pub fn compute(
        manifest: &Manifest,
        local_versions: &HashMap<(String, String), String>,
        previous_cache_version: Option<String>,
    ) -> Self {
        let needs_download = manifest
            .packs
            .iter()
            .filter_map(|entry| {
                let local = local_versions.get(&(entry.namespace.clone(), entry.id.clone()));
                let stale = match local {
                    None => true,
                    Some(local) => version_is_older(local, &entry.expected_version),
                };
                stale.then(|| StalePack {
                    namespace: entry.namespace.clone(),
                    id: entry.id.clone(),
                    local_version: local.cloned(),
                    expected_version: entry.expected_version.clone(),
                })
            })
            .collect();

        let cache_version_changed =
            previous_cache_version.as_deref() != Some(manifest.cache_version.as_str());

        Self {
            needs_download,
            cache_version: manifest.cache_version.clone(),
            previous_cache_version,
            cache_version_changed,
        }
    }

    /// Stale packs belonging to one namespace.
    pub fn stale_in<'a>(&'a self, namespace: &'a str) -> impl Iterator<Item = &'a StalePack> + 'a {
        self.needs_download
            .iter()
            .filter(move |pack| pack.namespace == namespace)
    }

    pub fn is_up_to_date(&self) -> bool {
        self.needs_download.is_empty() && !self.cache_version_changed
    }
}

/// Whether `local` is behind `expected`.
///
/// Versions made only of dot-separated integers ("3", "1.10.2") compare
/// numerically, ignoring trailing zero components. Anything else is opaque:
/// any difference counts as older.
pub fn version_is_older(local: &str, expected: &str) -> bool {
    if local == expected {
        return false;
    }
    match (numeric_parts(local), numeric_parts(expected)) {
        (Some(local), Some(expected)) => local.cmp(&expected) == Ordering::Less,
        _ => true,
    }
}

fn numeric_parts(version: &str) -> Option<Vec<u64>> {
    let mut parts = version
        .trim()
        .split('.')
        .map(|part| part.parse::<u64>().ok())
        .collect::<Option<Vec<_>>>()?;
    while parts.len() > 1 && parts.last() == Some(&0) {
        parts.pop();
    }
    Some(parts)
}
