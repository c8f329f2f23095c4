use super::{BackendError, NotificationBackend};
use crate::model::{NotificationItem, PAGE_SIZE};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;
use url::Url;

const MAX_RESPONSE_SIZE: usize = 2 * 1024 * 1024; // 2MB

/// Structured error body returned by the hosted backend.
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: Option<String>,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ReadStateRow {
    read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct MarkAllResponse {
    read_at: DateTime<Utc>,
}

/// REST client for a hosted notification backend.
///
/// Endpoints (relative to the base URL):
///
/// - `GET notifications?owner_id=eq.<id>&order=created_at.desc&offset=..&limit=..`
/// - `PATCH notifications?id=eq.<id>&owner_id=eq.<owner>` with `{"read_at": ..}`
/// - `POST rpc/mark_all_notifications_read` with `{"owner_id": ..}`
#[derive(Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base: Url,
    api_key: Option<SecretString>,
    timeout: Duration,
}

impl HttpBackend {
    /// Build a backend for `base_url`.
    ///
    /// HTTPS is required except for loopback hosts, which tests and local
    /// development servers use.
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        api_key: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let mut base = Url::parse(base_url).map_err(|e| BackendError::InvalidUrl(e.to_string()))?;
        let loopback = matches!(
            base.host_str(),
            Some("localhost") | Some("127.0.0.1") | Some("[::1]")
        );
        if base.scheme() != "https" && !(base.scheme() == "http" && loopback) {
            return Err(BackendError::InvalidUrl(format!(
                "{base_url}: HTTPS required (except localhost)"
            )));
        }
        // Url::join replaces the last segment unless the path ends with '/'
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            client,
            base,
            api_key,
            timeout,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, BackendError> {
        self.base
            .join(path)
            .map_err(|e| BackendError::InvalidUrl(e.to_string()))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key.expose_secret()),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Vec<u8>, BackendError> {
        let response = tokio::time::timeout(self.timeout, self.authorize(request).send())
            .await
            .map_err(|_| BackendError::Timeout)?
            .map_err(BackendError::Network)?;

        let status = response.status();
        let bytes = read_limited_bytes(response, MAX_RESPONSE_SIZE).await?;

        if !status.is_success() {
            return Err(match serde_json::from_slice::<ApiErrorBody>(&bytes) {
                Ok(body) => {
                    tracing::debug!(status = %status, code = ?body.code, "Backend returned error body");
                    BackendError::Api {
                        code: body.code,
                        message: body.message,
                    }
                }
                Err(_) => BackendError::HttpStatus(status.as_u16()),
            });
        }

        Ok(bytes)
    }
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, BackendError> {
    serde_json::from_slice(bytes).map_err(|e| BackendError::Decode(e.to_string()))
}

fn json_body(value: serde_json::Value) -> Result<Vec<u8>, BackendError> {
    serde_json::to_vec(&value).map_err(|e| BackendError::Decode(e.to_string()))
}

#[async_trait]
impl NotificationBackend for HttpBackend {
    async fn fetch_page(
        &self,
        owner_id: &str,
        cursor: usize,
    ) -> Result<Vec<NotificationItem>, BackendError> {
        let mut url = self.endpoint("notifications")?;
        url.query_pairs_mut()
            .append_pair("owner_id", &format!("eq.{owner_id}"))
            .append_pair("order", "created_at.desc")
            .append_pair("offset", &cursor.saturating_mul(PAGE_SIZE).to_string())
            .append_pair("limit", &PAGE_SIZE.to_string());

        let bytes = self.send(self.client.get(url)).await?;
        let mut items: Vec<NotificationItem> = decode(&bytes)?;
        if items.len() > PAGE_SIZE {
            tracing::warn!(owner = %owner_id, cursor, returned = items.len(), "Backend ignored page limit, truncating");
            items.truncate(PAGE_SIZE);
        }
        Ok(items)
    }

    async fn set_read(
        &self,
        owner_id: &str,
        item_id: &str,
        is_read: bool,
    ) -> Result<Option<DateTime<Utc>>, BackendError> {
        let mut url = self.endpoint("notifications")?;
        url.query_pairs_mut()
            .append_pair("id", &format!("eq.{item_id}"))
            .append_pair("owner_id", &format!("eq.{owner_id}"));

        let read_at = is_read.then(Utc::now);
        let body = json_body(serde_json::json!({ "read_at": read_at }))?;
        let request = self
            .client
            .patch(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header("Prefer", "return=representation")
            .body(body);

        let bytes = self.send(request).await?;
        let rows: Vec<ReadStateRow> = decode(&bytes)?;
        rows.into_iter()
            .next()
            .map(|row| row.read_at)
            .ok_or_else(|| BackendError::NotFound(item_id.to_string()))
    }

    async fn set_all_read(&self, owner_id: &str) -> Result<DateTime<Utc>, BackendError> {
        let url = self.endpoint("rpc/mark_all_notifications_read")?;
        let body = json_body(serde_json::json!({ "owner_id": owner_id }))?;
        let request = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);

        let bytes = self.send(request).await?;
        let response: MarkAllResponse = decode(&bytes)?;
        Ok(response.read_at)
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, BackendError> {
    if let Some(len) = response.content_length() {
        if len as usize > limit {
            return Err(BackendError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(BackendError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(BackendError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}
