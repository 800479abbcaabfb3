// ABOUTME: Trait for the remote table-style data service the outbox delivers mutations to.
// ABOUTME: Errors are structured so delivery failures can be recorded on the outbox item.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Structured failure returned by a backend call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BackendError {
    #[error("backend rejected request ({status}): {message}")]
    Rejected {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid filter: {0}")]
    InvalidFilter(String),
}

/// An authenticated data service exposing per-table mutations.
///
/// Filters are JSON objects mapping column names to the scalar value the
/// column must equal.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn insert(&self, table: &str, payload: &Value) -> Result<(), BackendError>;

    async fn update(&self, table: &str, payload: &Value, filter: &Value)
    -> Result<(), BackendError>;

    async fn delete(&self, table: &str, filter: &Value) -> Result<(), BackendError>;

    async fn upsert(
        &self,
        table: &str,
        payload: &Value,
        on_conflict: Option<&str>,
    ) -> Result<(), BackendError>;

    async fn select(&self, table: &str, filter: &Value) -> Result<Vec<Value>, BackendError>;
}
