//! Repair shop REST API client.
//!
//! [`RemoteApi`] is the seam the sync engine and repositories talk to;
//! [`HttpApiClient`] is the reqwest implementation. Every request carries a
//! bearer token from a [`TokenProvider`]. Responses use the
//! `{ success, data, error, message }` envelope; lists arrive either as a
//! bare array or as `{ items: [...] }` / `{ data: [...] }`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Method, StatusCode, Url};
use serde_json::Value;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::error::ApiError;

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the API base URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();
    if url.is_empty() {
        return url;
    }

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }
    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Orders,
    Devices,
    Clients,
    Tickets,
}

impl Resource {
    /// Collection name under `/api`.
    pub fn segment(&self) -> &'static str {
        match self {
            Resource::Orders => "orders",
            Resource::Devices => "devices",
            Resource::Clients => "clients",
            Resource::Tickets => "tickets",
        }
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.segment())
    }
}

/// Optional list query parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilters {
    pub status: Option<String>,
    pub search: Option<String>,
    pub order_id: Option<String>,
}

impl ListFilters {
    pub fn search(text: &str) -> Self {
        Self {
            search: Some(text.to_string()),
            ..Self::default()
        }
    }

    fn to_query(&self) -> Vec<(&'static str, String)> {
        let mut query = Vec::new();
        if let Some(status) = self.status.as_deref().filter(|s| !s.is_empty()) {
            query.push(("status", status.to_string()));
        }
        if let Some(search) = self.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            query.push(("search", search.to_string()));
        }
        if let Some(order_id) = self.order_id.as_deref().filter(|s| !s.is_empty()) {
            query.push(("order_id", order_id.to_string()));
        }
        query
    }
}

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// Supplies the bearer token for each request. Token storage and refresh
/// belong to the host's auth layer.
pub trait TokenProvider: Send + Sync {
    fn bearer_token(&self) -> Option<Zeroizing<String>>;
}

/// Typed operations the sync core consumes. Records are returned as raw JSON
/// so decoding can be isolated per record.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn list(
        &self,
        resource: Resource,
        page: u32,
        limit: u32,
        filters: &ListFilters,
    ) -> Result<Vec<Value>, ApiError>;

    async fn get(&self, resource: Resource, id: &str) -> Result<Value, ApiError>;

    /// Partial update. The response body is not needed.
    async fn update(&self, resource: Resource, id: &str, body: Value) -> Result<(), ApiError>;

    async fn create(&self, resource: Resource, body: Value) -> Result<Value, ApiError>;

    async fn list_ticket_messages(&self, ticket_id: &str) -> Result<Vec<Value>, ApiError>;

    /// Returns the created message with its server id.
    async fn send_ticket_message(&self, ticket_id: &str, body: Value) -> Result<Value, ApiError>;
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into an [`ApiError`].
fn transport_error(url: &str, err: &reqwest::Error) -> ApiError {
    if err.is_timeout() {
        return ApiError::Timeout;
    }
    if err.is_connect() {
        return ApiError::Offline;
    }
    if err.is_builder() {
        return ApiError::InvalidUrl(url.to_string());
    }
    ApiError::Transport(format!("Network error communicating with {url}: {err}"))
}

/// Pull a human readable message out of an error body.
fn error_detail(body_text: &str) -> Option<String> {
    let trimmed = body_text.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(json) => json
            .get("error")
            .or_else(|| json.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string),
        Err(_) => Some(trimmed.chars().take(200).collect()),
    }
}

/// Convert a non-success HTTP status into an [`ApiError`].
pub(crate) fn status_error(status: StatusCode, body_text: &str, retry_after: Option<u64>) -> ApiError {
    let code = status.as_u16();
    let message = error_detail(body_text).unwrap_or_else(|| {
        status
            .canonical_reason()
            .unwrap_or("Unexpected response")
            .to_string()
    });

    match code {
        401 => ApiError::Unauthorized,
        403 => ApiError::Forbidden,
        404 => ApiError::NotFound,
        429 => ApiError::RateLimited { retry_after },
        400 | 409 | 422 => ApiError::Validation {
            status: code,
            message,
        },
        s if s >= 500 => ApiError::Server { status: s, message },
        s => ApiError::Http { status: s, message },
    }
}

// ---------------------------------------------------------------------------
// Envelope handling
// ---------------------------------------------------------------------------

/// Unwrap `{ success, data, error, message }`. Bodies without a `success`
/// field are returned as they are.
pub(crate) fn unwrap_envelope(body: Value) -> Result<Value, ApiError> {
    let Some(success) = body.get("success").and_then(Value::as_bool) else {
        return Ok(body);
    };
    if !success {
        let message = body
            .get("error")
            .or_else(|| body.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("Request was not successful")
            .to_string();
        return Err(ApiError::Http {
            status: 200,
            message,
        });
    }
    Ok(match body {
        Value::Object(mut map) => map.remove("data").unwrap_or(Value::Null),
        other => other,
    })
}

/// Accept a bare array or an object carrying the array under `items`/`data`.
pub(crate) fn list_items(data: Value) -> Result<Vec<Value>, ApiError> {
    match data {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(Vec::new()),
        Value::Object(mut map) => match map.remove("items").or_else(|| map.remove("data")) {
            Some(Value::Array(items)) => Ok(items),
            Some(Value::Null) | None => Ok(Vec::new()),
            Some(other) => Err(ApiError::Decode(format!(
                "expected a list, got {}",
                json_kind(&other)
            ))),
        },
        other => Err(ApiError::Decode(format!(
            "expected a list, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

pub struct HttpApiClient {
    client: Client,
    base_url: String,
    base: Url,
    tokens: Arc<dyn TokenProvider>,
}

impl HttpApiClient {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self, ApiError> {
        let base_url = normalize_base_url(base_url);
        if base_url.is_empty() {
            return Err(ApiError::InvalidUrl("API base URL is empty".to_string()));
        }
        let base = Url::parse(&base_url)
            .map_err(|e| ApiError::InvalidUrl(format!("{base_url}: {e}")))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Transport(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            base,
            tokens,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Base URL plus `segments`, each percent-encoded as a single path
    /// segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidUrl(self.base_url.clone()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Lightweight HEAD `/api/health`. Returns the round-trip latency.
    pub async fn health_check(&self) -> Result<Duration, ApiError> {
        let url = self.endpoint(&["api", "health"])?;
        let start = Instant::now();
        let resp = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;
        let status = resp.status();
        if status.is_success() {
            Ok(start.elapsed())
        } else {
            Err(status_error(status, "", None))
        }
    }

    async fn request(
        &self,
        method: Method,
        segments: &[&str],
        query: &[(&'static str, String)],
        body: Option<Value>,
    ) -> Result<Value, ApiError> {
        let url = self.endpoint(segments)?;
        debug!(%method, %url, "api request");

        let mut req = self.client.request(method, url.clone());
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(token) = self.tokens.bearer_token() {
            req = req.bearer_auth(token.as_str());
        }
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;
        let status = resp.status();
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());

        let body_text = resp
            .text()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;

        if !status.is_success() {
            let err = status_error(status, &body_text, retry_after);
            warn!(%url, status = status.as_u16(), error = %err, "api request failed");
            return Err(err);
        }

        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        let json: Value = serde_json::from_str(&body_text)
            .map_err(|e| ApiError::Decode(format!("Invalid JSON from {}: {e}", url.path())))?;
        unwrap_envelope(json)
    }
}

#[async_trait]
impl RemoteApi for HttpApiClient {
    async fn list(
        &self,
        resource: Resource,
        page: u32,
        limit: u32,
        filters: &ListFilters,
    ) -> Result<Vec<Value>, ApiError> {
        let mut query = vec![("page", page.to_string()), ("limit", limit.to_string())];
        query.extend(filters.to_query());
        let data = self
            .request(Method::GET, &["api", resource.segment()], &query, None)
            .await?;
        list_items(data)
    }

    async fn get(&self, resource: Resource, id: &str) -> Result<Value, ApiError> {
        self.request(Method::GET, &["api", resource.segment(), id], &[], None)
            .await
    }

    async fn update(&self, resource: Resource, id: &str, body: Value) -> Result<(), ApiError> {
        self.request(
            Method::PATCH,
            &["api", resource.segment(), id],
            &[],
            Some(body),
        )
        .await
        .map(|_| ())
    }

    async fn create(&self, resource: Resource, body: Value) -> Result<Value, ApiError> {
        self.request(Method::POST, &["api", resource.segment()], &[], Some(body))
            .await
    }

    async fn list_ticket_messages(&self, ticket_id: &str) -> Result<Vec<Value>, ApiError> {
        let data = self
            .request(
                Method::GET,
                &["api", "tickets", ticket_id, "messages"],
                &[],
                None,
            )
            .await?;
        list_items(data)
    }

    async fn send_ticket_message(&self, ticket_id: &str, body: Value) -> Result<Value, ApiError> {
        self.request(
            Method::POST,
            &["api", "tickets", ticket_id, "messages"],
            &[],
            Some(body),
        )
        .await
    }
}
