// ABOUTME: HTTP adapters for a PostgREST-style backend: table mutations and the pack manifest endpoint.
// ABOUTME: Translates match filters into `col=eq.value` query params and error bodies into BackendError.

use std::time::Duration;

use async_trait::async_trait;
use packsync_core::backend::{Backend, BackendError};
use packsync_core::manifest::{Manifest, ManifestError, ManifestSource};
use serde::Deserialize;
use serde_json::Value;

const REST_PREFIX: &str = "/rest/v1";

/// Error body returned by PostgREST on rejected requests.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: Option<String>,
    message: Option<String>,
}

/// Backend speaking PostgREST conventions under `{base_url}/rest/v1/{table}`.
pub struct RestBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl RestBackend {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}{}/{}", self.base_url, REST_PREFIX, table)
    }

    fn request(&self, method: reqwest::Method, table: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, self.table_url(table));
        authorize(builder, self.api_key.as_deref())
    }

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, BackendError> {
        let response = builder
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        let parsed: Option<ErrorBody> = serde_json::from_str(&text).ok();
        let (code, message) = match parsed {
            Some(body) => (body.code, body.message.unwrap_or(text)),
            None => (None, text),
        };
        Err(BackendError::Rejected {
            status: status.as_u16(),
            code,
            message,
        })
    }
}

fn authorize(builder: reqwest::RequestBuilder, api_key: Option<&str>) -> reqwest::RequestBuilder {
    match api_key {
        Some(key) => builder.header("apikey", key).bearer_auth(key),
        None => builder,
    }
}

/// Turn a match object into `column=eq.value` query pairs.
pub fn filter_params(filter: &Value) -> Result<Vec<(String, String)>, BackendError> {
    let Some(object) = filter.as_object() else {
        return Err(BackendError::InvalidFilter(format!(
            "expected an object, got {}",
            filter
        )));
    };

    object
        .iter()
        .map(|(column, value)| {
            let condition = match value {
                Value::Null => "is.null".to_string(),
                Value::String(s) => format!("eq.{}", s),
                Value::Bool(b) => format!("eq.{}", b),
                Value::Number(n) => format!("eq.{}", n),
                other => {
                    return Err(BackendError::InvalidFilter(format!(
                        "column {} has non-scalar value {}",
                        column, other
                    )));
                }
            };
            Ok((column.clone(), condition))
        })
        .collect()
}

#[async_trait]
impl Backend for RestBackend {
    async fn insert(&self, table: &str, payload: &Value) -> Result<(), BackendError> {
        let builder = self
            .request(reqwest::Method::POST, table)
            .header("Prefer", "return=minimal")
            .json(payload);
        self.send(builder).await.map(|_| ())
    }

    async fn update(
        &self,
        table: &str,
        payload: &Value,
        filter: &Value,
    ) -> Result<(), BackendError> {
        let params = filter_params(filter)?;
        let builder = self
            .request(reqwest::Method::PATCH, table)
            .query(&params)
            .header("Prefer", "return=minimal")
            .json(payload);
        self.send(builder).await.map(|_| ())
    }

    async fn delete(&self, table: &str, filter: &Value) -> Result<(), BackendError> {
        let params = filter_params(filter)?;
        let builder = self
            .request(reqwest::Method::DELETE, table)
            .query(&params)
            .header("Prefer", "return=minimal");
        self.send(builder).await.map(|_| ())
    }

    async fn upsert(
        &self,
        table: &str,
        payload: &Value,
        on_conflict: Option<&str>,
    ) -> Result<(), BackendError> {
        let mut builder = self
            .request(reqwest::Method::POST, table)
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(payload);
        if let Some(column) = on_conflict {
            builder = builder.query(&[("on_conflict", column)]);
        }
        self.send(builder).await.map(|_| ())
    }

    async fn select(&self, table: &str, filter: &Value) -> Result<Vec<Value>, BackendError> {
        let mut params = vec![("select".to_string(), "*".to_string())];
        if !filter.is_null() {
            params.extend(filter_params(filter)?);
        }
        let builder = self.request(reqwest::Method::GET, table).query(&params);
        let response = self.send(builder).await?;
        response
            .json::<Vec<Value>>()
            .await
            .map_err(|e| BackendError::Transport(format!("unreadable response: {}", e)))
    }
}

/// Manifest fetched with a plain GET against a fixed URL.
pub struct HttpManifestSource {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpManifestSource {
    pub fn new(
        url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            api_key,
        })
    }
}

#[async_trait]
impl ManifestSource for HttpManifestSource {
    async fn fetch_manifest(&self) -> Result<Manifest, ManifestError> {
        let response = authorize(self.client.get(&self.url), self.api_key.as_deref())
            .send()
            .await
            .map_err(|e| ManifestError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ManifestError::Status(status.as_u16()));
        }

        response
            .json::<Manifest>()
            .await
            .map_err(|e| ManifestError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_server::{FakeServer, closed_port_url};
    use serde_json::json;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn backend(server: &FakeServer) -> RestBackend {
        RestBackend::new(server.url(), Some("anon-key".into()), TIMEOUT).unwrap()
    }

    #[test]
    fn filter_params_cover_scalars() {
        let filter = json!({"id": "b1", "n": 3, "done": false, "gone": null});
        let params = filter_params(&filter).unwrap();
        assert!(params.contains(&("id".into(), "eq.b1".into())));
        assert!(params.contains(&("n".into(), "eq.3".into())));
        assert!(params.contains(&("done".into(), "eq.false".into())));
        assert!(params.contains(&("gone".into(), "is.null".into())));

        assert!(matches!(
            filter_params(&json!({"tags": ["a"]})),
            Err(BackendError::InvalidFilter(_))
        ));
        assert!(matches!(filter_params(&json!("id")), Err(BackendError::InvalidFilter(_))));
    }

    #[tokio::test]
    async fn insert_posts_payload_with_auth_headers() {
        let server = FakeServer::start().await;
        backend(&server)
            .insert("bookmarks", &json!({"id": "b1"}))
            .await
            .unwrap();

        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.method, "POST");
        assert_eq!(request.table, "bookmarks");
        assert_eq!(request.body, Some(json!({"id": "b1"})));
        assert_eq!(request.header("apikey"), Some("anon-key"));
        assert_eq!(request.header("authorization"), Some("Bearer anon-key"));
    }

    #[tokio::test]
    async fn update_and_delete_send_eq_filters() {
        let server = FakeServer::start().await;
        let backend = backend(&server);
        backend
            .update("bookmarks", &json!({"note": "hi"}), &json!({"id": "b1"}))
            .await
            .unwrap();
        backend.delete("bookmarks", &json!({"id": "b1"})).await.unwrap();

        let requests = server.requests();
        assert_eq!(requests[0].method, "PATCH");
        assert_eq!(requests[0].query.get("id").map(String::as_str), Some("eq.b1"));
        assert_eq!(requests[0].body, Some(json!({"note": "hi"})));
        assert_eq!(requests[1].method, "DELETE");
        assert_eq!(requests[1].query.get("id").map(String::as_str), Some("eq.b1"));
    }

    #[tokio::test]
    async fn upsert_merges_duplicates_on_conflict_column() {
        let server = FakeServer::start().await;
        backend(&server)
            .upsert("bookmarks", &json!([{"id": "b1"}]), Some("id"))
            .await
            .unwrap();

        let request = &server.requests()[0];
        assert_eq!(request.method, "POST");
        assert_eq!(request.query.get("on_conflict").map(String::as_str), Some("id"));
        assert!(request
            .header("prefer")
            .is_some_and(|p| p.contains("resolution=merge-duplicates")));
    }

    #[tokio::test]
    async fn select_returns_rows() {
        let server = FakeServer::start().await;
        server.set_rows(vec![json!({"id": "b1"}), json!({"id": "b2"})]);

        let rows = backend(&server)
            .select("bookmarks", &json!({"owner": "u1"}))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);

        let request = &server.requests()[0];
        assert_eq!(request.method, "GET");
        assert_eq!(request.query.get("select").map(String::as_str), Some("*"));
        assert_eq!(request.query.get("owner").map(String::as_str), Some("eq.u1"));
    }

    #[tokio::test]
    async fn rejection_surfaces_status_and_code() {
        let server = FakeServer::start().await;
        server.reject_with(409, json!({"code": "23505", "message": "duplicate key"}));

        let err = backend(&server)
            .insert("bookmarks", &json!({"id": "b1"}))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            BackendError::Rejected {
                status: 409,
                code: Some("23505".into()),
                message: "duplicate key".into()
            }
        );
    }

    #[tokio::test]
    async fn unreachable_backend_is_a_transport_error() {
        let url = closed_port_url().await;
        let backend = RestBackend::new(url, None, TIMEOUT).unwrap();
        let err = backend.insert("bookmarks", &json!({"id": "b1"})).await.unwrap_err();
        assert!(matches!(err, BackendError::Transport(_)));
    }

    #[tokio::test]
    async fn manifest_source_decodes_manifest() {
        let server = FakeServer::start().await;
        server.set_manifest(json!({
            "cacheVersion": "v7",
            "packs": [{"namespace": "bookmarks", "id": "list", "expectedVersion": "3"}]
        }));

        let source =
            HttpManifestSource::new(format!("{}/manifest", server.url()), None, TIMEOUT).unwrap();
        let manifest = source.fetch_manifest().await.unwrap();
        assert_eq!(manifest.cache_version, "v7");
        assert_eq!(manifest.packs[0].expected_version, "3");
    }

    #[tokio::test]
    async fn manifest_source_reports_status_and_decode_errors() {
        let server = FakeServer::start().await;
        let source =
            HttpManifestSource::new(format!("{}/manifest", server.url()), None, TIMEOUT).unwrap();

        server.set_manifest_status(503);
        assert_eq!(source.fetch_manifest().await.unwrap_err(), ManifestError::Status(503));

        server.set_manifest(json!({"unexpected": true}));
        assert!(matches!(
            source.fetch_manifest().await.unwrap_err(),
            ManifestError::Decode(_)
        ));
    }
}
