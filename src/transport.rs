//! Remote HTTP contract behind a trait seam.
//!
//! The sync engine and the client façade talk to [`RemoteTransport`] only,
//! so the whole layer is testable against an in-process mock. The real
//! implementation is a thin reqwest wrapper with a per-client timeout.
//!
//! Only network-level failures ([`TransportError::Network`]) are recoverable
//! by queueing or cache fallback; a non-2xx answer is a real server answer
//! and surfaces as [`TransportError::Rejected`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use serde_json::Value as JsonValue;

use crate::config::SyncOptions;
use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl From<HttpMethod> for reqwest::Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        })
    }
}

/// The layer's only view of the remote server.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Performs one request. A 2xx answer resolves to its JSON body
    /// (`Null` for empty bodies); everything else is a [`TransportError`].
    async fn request(
        &self,
        method: HttpMethod,
        endpoint: &str,
        body: Option<&JsonValue>,
    ) -> Result<JsonValue, TransportError>;
}

/// reqwest-backed transport. Authentication and 401 handling live in the
/// HTTP layer above; this wrapper only classifies failures.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, timeout_ms: u64) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { client, base_url })
    }

    /// Builds the transport with the timeout from the sync options record,
    /// so the layer's one configuration knob governs requests too.
    pub fn with_options(
        base_url: impl Into<String>,
        options: &SyncOptions,
    ) -> Result<Self, TransportError> {
        Self::new(base_url, options.request_timeout_ms)
    }
}

#[async_trait]
impl RemoteTransport for HttpTransport {
    async fn request(
        &self,
        method: HttpMethod,
        endpoint: &str,
        body: Option<&JsonValue>,
    ) -> Result<JsonValue, TransportError> {
        let url = format!("{}{}", self.base_url, endpoint);
        let mut request = self.client.request(method.into(), &url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Rejected { status: status.as_u16() });
        }

        let text = response
            .text()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        if text.is_empty() {
            return Ok(JsonValue::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| TransportError::Network(format!("invalid JSON from {url}: {e}")))
    }
}

/// Extracts the row list from a read response. The server returns either a
/// bare list or `{"data": [...]}`; both shapes are accepted.
pub(crate) fn rows_from_response(body: &JsonValue) -> Option<Vec<JsonValue>> {
    match body {
        JsonValue::Array(rows) => Some(rows.clone()),
        JsonValue::Object(map) => match map.get("data") {
            Some(JsonValue::Array(rows)) => Some(rows.clone()),
            _ => None,
        },
        _ => {
            warn!("unexpected response shape: neither list nor {{data: list}}");
            None
        }
    }
}
