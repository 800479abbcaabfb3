// ABOUTME: In-process axum server standing in for the REST backend, manifest and health endpoints in tests.
// ABOUTME: Records every table request and serves scripted rows, rejections and manifests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use serde_json::{Value, json};

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub table: String,
    pub query: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub body: Option<Value>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

struct FakeState {
    requests: Vec<RecordedRequest>,
    rows: Vec<Value>,
    reject: Option<(u16, Value)>,
    manifest: Value,
    manifest_status: u16,
    health_status: u16,
}

type SharedState = Arc<Mutex<FakeState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, FakeState> {
    state.lock().unwrap()
}

pub struct FakeServer {
    addr: SocketAddr,
    state: SharedState,
}

impl FakeServer {
    pub async fn start() -> Self {
        let state = Arc::new(Mutex::new(FakeState {
            requests: Vec::new(),
            rows: Vec::new(),
            reject: None,
            manifest: json!({"cacheVersion": "v1", "packs": []}),
            manifest_status: 200,
            health_status: 200,
        }));

        let app = Router::new()
            .route("/rest/v1/", get(health))
            .route("/rest/v1/{table}", any(table))
            .route("/manifest", get(manifest))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock(&self.state).requests.clone()
    }

    pub fn set_rows(&self, rows: Vec<Value>) {
        lock(&self.state).rows = rows;
    }

    pub fn reject_with(&self, status: u16, body: Value) {
        lock(&self.state).reject = Some((status, body));
    }

    pub fn set_manifest(&self, manifest: Value) {
        let mut state = lock(&self.state);
        state.manifest = manifest;
        state.manifest_status = 200;
    }

    pub fn set_manifest_status(&self, status: u16) {
        lock(&self.state).manifest_status = status;
    }

    pub fn set_health_status(&self, status: u16) {
        lock(&self.state).health_status = status;
    }
}

/// URL of a port nothing is listening on.
pub async fn closed_port_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

fn status(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap()
}

async fn table(
    State(state): State<SharedState>,
    method: Method,
    Path(table): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut state = lock(&state);
    state.requests.push(RecordedRequest {
        method: method.to_string(),
        table,
        query,
        headers: headers
            .iter()
            .filter_map(|(name, value)| {
                Some((name.as_str().to_string(), value.to_str().ok()?.to_string()))
            })
            .collect(),
        body: serde_json::from_slice(&body).ok(),
    });

    if let Some((code, body)) = &state.reject {
        return (status(*code), Json(body.clone())).into_response();
    }
    if method == Method::GET {
        return Json(state.rows.clone()).into_response();
    }
    StatusCode::CREATED.into_response()
}

async fn manifest(State(state): State<SharedState>) -> Response {
    let state = lock(&state);
    if state.manifest_status != 200 {
        return status(state.manifest_status).into_response();
    }
    Json(state.manifest.clone()).into_response()
}

async fn health(State(state): State<SharedState>) -> Response {
    status(lock(&state).health_status).into_response()
}
