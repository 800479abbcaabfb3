// ABOUTME: In-memory substrate backed by an ordered map, for tests and ephemeral sessions.
// ABOUTME: Prefix scans use BTreeMap range queries so listing stays ordered by key.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::substrate::{Substrate, SubstrateError};

#[derive(Debug, Default)]
pub struct MemorySubstrate {
    entries: RwLock<BTreeMap<String, Value>>,
}

impl MemorySubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl Substrate for MemorySubstrate {
    async fn get(&self, key: &str) -> Result<Option<Value>, SubstrateError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), SubstrateError> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, SubstrateError> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>, SubstrateError> {
        let entries = self.entries.read().await;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<usize, SubstrateError> {
        let mut entries = self.entries.write().await;
        let doomed: Vec<String> = entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            entries.remove(key);
        }
        Ok(doomed.len())
    }
}
