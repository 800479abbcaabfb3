// ABOUTME: Trait for the durable string-keyed store that packs and outbox items are written to.
// ABOUTME: Values are JSON; prefix scans give namespaced listing and clearing over one physical store.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Errors that can occur inside a substrate implementation.
#[derive(Debug, Error)]
pub enum SubstrateError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage task failed: {0}")]
    Task(String),
}

/// Asynchronous key/value store holding serializable values.
///
/// A store that cannot exist in the current runtime is represented by the
/// absence of a substrate, not by an implementation that errors.
#[async_trait]
pub trait Substrate: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, SubstrateError>;

    async fn set(&self, key: &str, value: Value) -> Result<(), SubstrateError>;

    /// Remove `key`. Returns whether anything was removed.
    async fn remove(&self, key: &str) -> Result<bool, SubstrateError>;

    /// Every entry whose key starts with `prefix`, ordered by key.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>, SubstrateError>;

    /// Remove every entry whose key starts with `prefix` in one step.
    /// Returns the number of entries removed.
    async fn remove_prefix(&self, prefix: &str) -> Result<usize, SubstrateError>;

    async fn clear(&self) -> Result<usize, SubstrateError> {
        self.remove_prefix("").await
    }
}
