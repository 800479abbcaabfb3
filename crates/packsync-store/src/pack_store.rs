// ABOUTME: Namespaced, versioned document store for packs with per-namespace change notification.
// ABOUTME: Runs in degraded mode (all no-ops) when no durable substrate is available.

use std::sync::Arc;

use packsync_core::listeners::{ListenerRegistry, Subscription};
use packsync_core::pack::{KeyError, Pack, PackKey, namespace_prefix};
use serde_json::Value;
use thiserror::Error;

use crate::substrate::{Substrate, SubstrateError};

/// Errors that can occur while reading or writing packs.
#[derive(Debug, Error)]
pub enum PackStoreError {
    #[error("invalid pack key: {0}")]
    Key(#[from] KeyError),

    #[error("storage error: {0}")]
    Substrate(#[from] SubstrateError),

    #[error("stored pack {key} is unreadable: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// What happened in a namespace. Delivered to namespace subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum PackChange {
    Saved {
        namespace: String,
        id: String,
        version: String,
    },
    Deleted {
        namespace: String,
        id: String,
    },
    Cleared {
        namespace: String,
        removed: usize,
    },
}

pub struct PackStore {
    substrate: Option<Arc<dyn Substrate>>,
    listeners: ListenerRegistry<PackChange>,
}

impl PackStore {
    /// Build a store over `substrate`. `None` means durable storage is not
    /// available in this runtime and the store runs degraded.
    pub fn new(substrate: Option<Arc<dyn Substrate>>) -> Self {
        if substrate.is_none() {
            tracing::warn!("no durable storage available, pack store running degraded");
        }
        Self {
            substrate,
            listeners: ListenerRegistry::new(),
        }
    }

    pub fn unsupported() -> Self {
        Self::new(None)
    }

    pub fn is_supported(&self) -> bool {
        self.substrate.is_some()
    }

    /// Persist a pack, replacing any pack at the same key wholesale.
    /// Returns None without touching anything when running degraded.
    pub async fn save(
        &self,
        namespace: &str,
        id: &str,
        data: Value,
        version: &str,
    ) -> Result<Option<Pack>, PackStoreError> {
        let key = PackKey::new(namespace, id)?;
        let Some(substrate) = &self.substrate else {
            return Ok(None);
        };

        let pack = Pack::new(namespace, id, data, version);
        let encoded = serde_json::to_value(&pack).map_err(SubstrateError::from)?;
        substrate.set(&key.storage_key(), encoded).await?;
        tracing::debug!(namespace, id, version, "pack saved");

        self.listeners.notify(
            namespace,
            &PackChange::Saved {
                namespace: namespace.to_string(),
                id: id.to_string(),
                version: version.to_string(),
            },
        );
        Ok(Some(pack))
    }

    pub async fn load(&self, namespace: &str, id: &str) -> Result<Option<Pack>, PackStoreError> {
        let key = PackKey::new(namespace, id)?;
        let Some(substrate) = &self.substrate else {
            return Ok(None);
        };

        let storage_key = key.storage_key();
        match substrate.get(&storage_key).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|source| PackStoreError::Decode {
                    key: storage_key,
                    source,
                }),
            None => Ok(None),
        }
    }

    /// Remove a pack. Subscribers are notified even when nothing was stored.
    pub async fn delete(&self, namespace: &str, id: &str) -> Result<(), PackStoreError> {
        let key = PackKey::new(namespace, id)?;
        let Some(substrate) = &self.substrate else {
            return Ok(());
        };

        substrate.remove(&key.storage_key()).await?;
        self.listeners.notify(
            namespace,
            &PackChange::Deleted {
                namespace: namespace.to_string(),
                id: id.to_string(),
            },
        );
        Ok(())
    }

    /// Every readable pack in `namespace`. Records that fail to decode are
    /// logged and skipped.
    pub async fn list_all(&self, namespace: &str) -> Result<Vec<Pack>, PackStoreError> {
        let prefix = namespace_prefix(namespace)?;
        let Some(substrate) = &self.substrate else {
            return Ok(Vec::new());
        };

        let mut packs = Vec::new();
        for (key, value) in substrate.scan_prefix(&prefix).await? {
            match serde_json::from_value::<Pack>(value) {
                Ok(pack) => packs.push(pack),
                Err(e) => tracing::warn!(key = %key, error = %e, "skipping unreadable pack"),
            }
        }
        Ok(packs)
    }

    /// Remove every pack in `namespace` in one storage operation and notify
    /// subscribers once. Returns how many packs were removed.
    pub async fn clear_namespace(&self, namespace: &str) -> Result<usize, PackStoreError> {
        let prefix = namespace_prefix(namespace)?;
        let Some(substrate) = &self.substrate else {
            return Ok(0);
        };

        let removed = substrate.remove_prefix(&prefix).await?;
        tracing::info!(namespace, removed, "namespace cleared");
        self.listeners.notify(
            namespace,
            &PackChange::Cleared {
                namespace: namespace.to_string(),
                removed,
            },
        );
        Ok(removed)
    }

    /// Run `listener` after every change in `namespace` until the returned
    /// subscription is dropped.
    pub fn subscribe<F>(&self, namespace: &str, listener: F) -> Subscription
    where
        F: Fn(&PackChange) + Send + Sync + 'static,
    {
        self.listeners.subscribe(namespace, listener)
    }
}

impl std::fmt::Debug for PackStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackStore")
            .field("supported", &self.is_supported())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemorySubstrate;
    use crate::sqlite::SqliteSubstrate;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn memory_store() -> PackStore {
        PackStore::new(Some(Arc::new(MemorySubstrate::new())))
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let store = memory_store();
        let saved = store
            .save("bookmarks", "list", json!([{"id": "b1"}]), "1")
            .await
            .unwrap()
            .unwrap();

        let loaded = store.load("bookmarks", "list").await.unwrap().unwrap();
        assert_eq!(loaded, saved);
        assert!(store.load("bookmarks", "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_replaces_existing_pack() {
        let dir = TempDir::new().unwrap();
        let substrate = SqliteSubstrate::open(&dir.path().join("packs.db"), "packs").unwrap();
        let store = PackStore::new(Some(Arc::new(substrate)));

        let first = store
            .save("bookmarks", "list", json!({"v": 1}), "1")
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store
            .save("bookmarks", "list", json!({"v": 2}), "2")
            .await
            .unwrap();

        let loaded = store.load("bookmarks", "list").await.unwrap().unwrap();
        assert_eq!(loaded.data, json!({"v": 2}));
        assert_eq!(loaded.version, "2");
        assert!(loaded.updated_at > first.updated_at);
        assert_eq!(store.list_all("bookmarks").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn list_all_is_scoped_to_namespace() {
        let store = memory_store();
        store.save("notes", "a", json!(1), "1").await.unwrap();
        store.save("notes", "b", json!(2), "1").await.unwrap();
        store.save("notesx", "c", json!(3), "1").await.unwrap();

        let mut ids: Vec<String> = store
            .list_all("notes")
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn list_all_skips_undecodable_records() {
        let substrate = Arc::new(MemorySubstrate::new());
        let store = PackStore::new(Some(substrate.clone()));
        store.save("notes", "good", json!(1), "1").await.unwrap();
        substrate
            .set("notes/bad", json!({"not": "a pack"}))
            .await
            .unwrap();

        let packs = store.list_all("notes").await.unwrap();
        assert_eq!(packs.len(), 1);
        assert_eq!(packs[0].id, "good");

        let err = store.load("notes", "bad").await.unwrap_err();
        assert!(matches!(err, PackStoreError::Decode { .. }));
    }

    #[tokio::test]
    async fn clear_namespace_notifies_once() {
        let store = memory_store();
        store.save("notes", "a", json!(1), "1").await.unwrap();
        store.save("notes", "b", json!(2), "1").await.unwrap();
        store.save("other", "a", json!(3), "1").await.unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let _sub = store.subscribe("notes", move |change| {
            sink.lock().unwrap().push(change.clone());
        });

        assert_eq!(store.clear_namespace("notes").await.unwrap(), 2);
        assert_eq!(
            *events.lock().unwrap(),
            vec![PackChange::Cleared {
                namespace: "notes".into(),
                removed: 2
            }]
        );
        assert!(store.list_all("notes").await.unwrap().is_empty());
        assert_eq!(store.list_all("other").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn panicking_listener_does_not_block_others() {
        let store = memory_store();
        let hits = Arc::new(AtomicUsize::new(0));

        let _bad = store.subscribe("notes", |_| panic!("listener blew up"));
        let counter = Arc::clone(&hits);
        let _good = store.subscribe("notes", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        store.save("notes", "a", json!(1), "1").await.unwrap();
        store.delete("notes", "a").await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dropped_subscription_stops_notifications() {
        let store = memory_store();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let sub = store.subscribe("notes", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        store.save("notes", "a", json!(1), "1").await.unwrap();
        drop(sub);
        store.save("notes", "a", json!(2), "2").await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn degraded_store_is_a_no_op() {
        let store = PackStore::unsupported();
        assert!(!store.is_supported());
        assert!(store.save("notes", "a", json!(1), "1").await.unwrap().is_none());
        assert!(store.load("notes", "a").await.unwrap().is_none());
        assert!(store.list_all("notes").await.unwrap().is_empty());
        assert_eq!(store.clear_namespace("notes").await.unwrap(), 0);
        store.delete("notes", "a").await.unwrap();
    }

    #[tokio::test]
    async fn invalid_keys_are_rejected() {
        let store = memory_store();
        let err = store.save("", "a", json!(1), "1").await.unwrap_err();
        assert!(matches!(err, PackStoreError::Key(KeyError::EmptyNamespace)));
        let err = store.load("notes", "a/b").await.unwrap_err();
        assert!(matches!(err, PackStoreError::Key(KeyError::Separator(_))));
    }
}
