//! REST adapter over HTTP.
//!
//! Endpoints, relative to the base URL:
//! - `PUT {table}/{id}` creates or replaces a record; `409` carries the
//!   remote record in the body
//! - `DELETE {table}/{id}` removes a record; `404` counts as done
//! - `GET {table}?since=` returns `{"data": [...], "lastModified": ...}`
//! - `GET health` answers any 2xx when the remote is up

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

use fieldsync_common::{Action, EntityType, Error, Record, Result};

use crate::adapter::{Adapter, PullResponse, PushResponse};

/// Timeout for the health probe.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Body of a pull response.
#[derive(Debug, Deserialize)]
struct PullBody {
    #[serde(default)]
    data: Vec<Record>,
    #[serde(default, rename = "lastModified")]
    last_modified: Option<DateTime<Utc>>,
}

/// Adapter speaking JSON over HTTP to a REST backend.
pub struct HttpAdapter {
    http: Client,
    base: Url,
    token: Option<String>,
}

impl HttpAdapter {
    /// Create an adapter for the backend at `base`.
    pub fn new(base: Url) -> Result<Self> {
        if base.cannot_be_a_base() {
            return Err(Error::InvalidInput(format!("'{}' cannot be used as a base URL", base)));
        }
        let http = Client::builder()
            .user_agent(concat!("fieldsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base,
            token: None,
        })
    }

    /// Send `token` as a bearer credential on every request.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::InvalidInput(format!("'{}' cannot be used as a base URL", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let request = self.http.request(method, url);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl Adapter for HttpAdapter {
    fn name(&self) -> &str {
        "http"
    }

    async fn push(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        action: Action,
        payload: &Record,
    ) -> Result<PushResponse> {
        let url = self.endpoint(&[entity_type.as_str(), entity_id])?;
        let request = match action {
            Action::Delete => self.request(Method::DELETE, url),
            Action::Create | Action::Update => self.request(Method::PUT, url).json(payload),
        };

        let response = request
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to push {}/{}: {}", entity_type, entity_id, e)))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Network(format!("Failed to read push response: {}", e)))?;
        debug!("Push {} {}/{} -> {}", action, entity_type, entity_id, status);

        if status.is_success() || (action == Action::Delete && status == StatusCode::NOT_FOUND) {
            return Ok(PushResponse::ok(parse_record(&body)));
        }
        if status == StatusCode::CONFLICT {
            return Ok(match parse_record(&body) {
                Some(server_data) => PushResponse::conflict(server_data),
                None => PushResponse {
                    conflict: true,
                    error: Some("conflict without server data".to_string()),
                    ..PushResponse::default()
                },
            });
        }
        Ok(PushResponse::failed(format!("API error: {} - {}", status, body)))
    }

    async fn pull(
        &self,
        entity_type: EntityType,
        since: Option<DateTime<Utc>>,
    ) -> Result<PullResponse> {
        let url = self.endpoint(&[entity_type.as_str()])?;
        let mut request = self.request(Method::GET, url);
        if let Some(since) = since {
            request = request.query(&[("since", since.to_rfc3339())]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to pull {}: {}", entity_type, e)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Ok(PullResponse::failed(format!("API error: {} - {}", status, body)));
        }

        let body: PullBody = response
            .json()
            .await
            .map_err(|e| Error::Network(format!("Failed to parse pull response: {}", e)))?;
        debug!("Pulled {} {} records over HTTP", body.data.len(), entity_type);
        Ok(PullResponse::ok(body.data, body.last_modified))
    }

    async fn is_available(&self) -> bool {
        let Ok(url) = self.endpoint(&["health"]) else {
            return false;
        };
        match self
            .request(Method::GET, url)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Health check failed: {}", e);
                false
            }
        }
    }
}

/// Parse a JSON object body; anything else yields `None`.
fn parse_record(body: &str) -> Option<Record> {
    match serde_json::from_str(body) {
        Ok(serde_json::Value::Object(record)) => Some(record),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter_at(base: &str) -> HttpAdapter {
        HttpAdapter::new(Url::parse(base).unwrap()).unwrap()
    }

    #[test]
    fn test_endpoint_building() {
        let adapter = adapter_at("https://api.example.com/v1/");
        assert_eq!(
            adapter.endpoint(&["zona", "z1"]).unwrap().as_str(),
            "https://api.example.com/v1/zona/z1"
        );

        let adapter = adapter_at("https://api.example.com/v1");
        assert_eq!(
            adapter.endpoint(&["health"]).unwrap().as_str(),
            "https://api.example.com/v1/health"
        );
    }

    #[test]
    fn test_entity_id_is_escaped() {
        let adapter = adapter_at("https://api.example.com/");
        assert_eq!(
            adapter.endpoint(&["gasto", "a/b c"]).unwrap().as_str(),
            "https://api.example.com/gasto/a%2Fb%20c"
        );
    }

    #[test]
    fn test_rejects_non_base_url() {
        assert!(HttpAdapter::new(Url::parse("mailto:ops@example.com").unwrap()).is_err());
    }

    #[test]
    fn test_pull_body_parsing() {
        let body: PullBody = serde_json::from_str(
            r#"{"data": [{"id": "r1", "litros": 40}], "lastModified": "2024-05-01T12:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(body.data.len(), 1);
        assert!(body.last_modified.is_some());

        let empty: PullBody = serde_json::from_str("{}").unwrap();
        assert!(empty.data.is_empty());
    }

    #[test]
    fn test_parse_record_only_accepts_objects() {
        assert!(parse_record(r#"{"id": "z1"}"#).is_some());
        assert!(parse_record("[]").is_none());
        assert!(parse_record("").is_none());
    }
}
