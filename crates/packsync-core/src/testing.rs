// ABOUTME: Test doubles for packsync: a recording in-memory backend and a scripted manifest source.
// ABOUTME: Used across the workspace to drive the outbox and controller without network access.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::backend::{Backend, BackendError};
use crate::manifest::{Manifest, ManifestError, ManifestSource};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One call observed by [`RecordingBackend`].
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    Insert {
        table: String,
        payload: Value,
    },
    Update {
        table: String,
        payload: Value,
        filter: Value,
    },
    Delete {
        table: String,
        filter: Value,
    },
    Upsert {
        table: String,
        payload: Value,
        on_conflict: Option<String>,
    },
    Select {
        table: String,
        filter: Value,
    },
}

impl BackendCall {
    /// The payload of a write, or the filter of a delete/select.
    pub fn subject(&self) -> &Value {
        match self {
            BackendCall::Insert { payload, .. }
            | BackendCall::Update { payload, .. }
            | BackendCall::Upsert { payload, .. } => payload,
            BackendCall::Delete { filter, .. } | BackendCall::Select { filter, .. } => filter,
        }
    }
}

/// Backend that records every call and fails on demand.
///
/// Calls are recorded before the failure check, so failed attempts show up in
/// `calls()` too.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    calls: Mutex<Vec<BackendCall>>,
    failing_subjects: Mutex<Vec<Value>>,
    fail_all: AtomicBool,
    delay: Mutex<Option<Duration>>,
    rows: Mutex<HashMap<String, Vec<Value>>>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call whose payload (or filter, for deletes) equals `subject`.
    pub fn fail_on(&self, subject: Value) {
        lock(&self.failing_subjects).push(subject);
    }

    /// Stop failing calls for `subject`.
    pub fn heal(&self, subject: &Value) {
        lock(&self.failing_subjects).retain(|s| s != subject);
    }

    pub fn set_fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    /// Sleep this long inside every call, to widen race windows in tests.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = Some(delay);
    }

    /// Rows returned by `select` for `table`.
    pub fn set_rows(&self, table: &str, rows: Vec<Value>) {
        lock(&self.rows).insert(table.to_string(), rows);
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    async fn record(&self, call: BackendCall) -> Result<(), BackendError> {
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let should_fail = self.fail_all.load(Ordering::SeqCst)
            || lock(&self.failing_subjects).contains(call.subject());
        lock(&self.calls).push(call);

        if should_fail {
            Err(BackendError::Transport("simulated failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Backend for RecordingBackend {
    async fn insert(&self, table: &str, payload: &Value) -> Result<(), BackendError> {
        self.record(BackendCall::Insert {
            table: table.to_string(),
            payload: payload.clone(),
        })
        .await
    }

    async fn update(
        &self,
        table: &str,
        payload: &Value,
        filter: &Value,
    ) -> Result<(), BackendError> {
        self.record(BackendCall::Update {
            table: table.to_string(),
            payload: payload.clone(),
            filter: filter.clone(),
        })
        .await
    }

    async fn delete(&self, table: &str, filter: &Value) -> Result<(), BackendError> {
        self.record(BackendCall::Delete {
            table: table.to_string(),
            filter: filter.clone(),
        })
        .await
    }

    async fn upsert(
        &self,
        table: &str,
        payload: &Value,
        on_conflict: Option<&str>,
    ) -> Result<(), BackendError> {
        self.record(BackendCall::Upsert {
            table: table.to_string(),
            payload: payload.clone(),
            on_conflict: on_conflict.map(str::to_string),
        })
        .await
    }

    async fn select(&self, table: &str, filter: &Value) -> Result<Vec<Value>, BackendError> {
        self.record(BackendCall::Select {
            table: table.to_string(),
            filter: filter.clone(),
        })
        .await?;
        Ok(lock(&self.rows).get(table).cloned().unwrap_or_default())
    }
}

/// Manifest source returning a scripted manifest or error.
#[derive(Debug)]
pub struct StaticManifest {
    response: Mutex<Result<Manifest, ManifestError>>,
    fetches: AtomicUsize,
}

impl StaticManifest {
    pub fn new(manifest: Manifest) -> Self {
        Self {
            response: Mutex::new(Ok(manifest)),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn failing(error: ManifestError) -> Self {
        Self {
            response: Mutex::new(Err(error)),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Manifest with no packs and the given cache version.
    pub fn empty(cache_version: &str) -> Self {
        Self::new(Manifest {
            cache_version: cache_version.to_string(),
            packs: Vec::new(),
        })
    }

    pub fn set(&self, response: Result<Manifest, ManifestError>) {
        *lock(&self.response) = response;
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ManifestSource for StaticManifest {
    async fn fetch_manifest(&self) -> Result<Manifest, ManifestError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        lock(&self.response).clone()
    }
}
