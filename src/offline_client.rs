//! Request façade: the one surface application code calls instead of the
//! HTTP client.
//!
//! Every call tries the network first. When the network is up the remote
//! answer wins and cacheable reads are persisted as a side effect. When the
//! request fails at the network level and the device is offline, reads fall
//! back to the local mirror and replay-safe writes are queued. Server
//! rejections (any non-2xx) always surface to the caller untouched.

use std::sync::Arc;

use log::{debug, warn};
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::collections::{endpoint_path, route_for, Route};
use crate::connectivity::ConnectivityMonitor;
use crate::error::TransportError;
use crate::events::OfflineEvent;
use crate::local_store::LocalStore;
use crate::operation_queue::{OperationQueue, QueueMethod};
use crate::transport::{rows_from_response, HttpMethod, RemoteTransport};

fn is_false(b: &bool) -> bool {
    !*b
}

/// Answer envelope handed back to the application. `from_cache` marks a
/// read served from the local mirror, `offline` marks a write accepted into
/// the queue; a plain remote answer carries neither.
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse {
    pub data: JsonValue,
    #[serde(rename = "fromCache", skip_serializing_if = "is_false")]
    pub from_cache: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub offline: bool,
}

impl ApiResponse {
    fn remote(data: JsonValue) -> Self {
        Self { data, from_cache: false, offline: false }
    }

    fn cached(data: JsonValue) -> Self {
        Self { data, from_cache: true, offline: false }
    }

    fn queued(data: JsonValue) -> Self {
        Self { data, from_cache: false, offline: true }
    }
}

pub struct OfflineClient {
    transport: Arc<dyn RemoteTransport>,
    monitor: Arc<ConnectivityMonitor>,
    store: Option<Arc<LocalStore>>,
    queue: Option<Arc<OperationQueue>>,
}

impl OfflineClient {
    /// A client without a store or queue degrades to pure pass-through:
    /// every answer and every failure comes straight from the transport.
    pub fn new(
        transport: Arc<dyn RemoteTransport>,
        monitor: Arc<ConnectivityMonitor>,
        store: Option<Arc<LocalStore>>,
        queue: Option<Arc<OperationQueue>>,
    ) -> Self {
        Self { transport, monitor, store, queue }
    }

    pub async fn get(&self, endpoint: &str) -> Result<ApiResponse, TransportError> {
        match self.transport.request(HttpMethod::Get, endpoint, None).await {
            Ok(body) => {
                self.cache_read(endpoint, &body);
                Ok(ApiResponse::remote(body))
            }
            Err(e) if e.is_network() && self.monitor.is_offline() => {
                match self.read_fallback(endpoint) {
                    Some(data) => {
                        debug!("serving '{endpoint}' from the local mirror");
                        Ok(ApiResponse::cached(data))
                    }
                    None => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    pub async fn post(
        &self,
        endpoint: &str,
        payload: JsonValue,
    ) -> Result<ApiResponse, TransportError> {
        self.write(HttpMethod::Post, endpoint, payload).await
    }

    pub async fn put(
        &self,
        endpoint: &str,
        payload: JsonValue,
    ) -> Result<ApiResponse, TransportError> {
        self.write(HttpMethod::Put, endpoint, payload).await
    }

    pub async fn delete(&self, endpoint: &str) -> Result<ApiResponse, TransportError> {
        self.write(HttpMethod::Delete, endpoint, JsonValue::Null).await
    }

    async fn write(
        &self,
        method: HttpMethod,
        endpoint: &str,
        payload: JsonValue,
    ) -> Result<ApiResponse, TransportError> {
        let body = match method {
            HttpMethod::Delete => None,
            _ => Some(&payload),
        };
        match self.transport.request(method, endpoint, body).await {
            Ok(body) => Ok(ApiResponse::remote(body)),
            Err(e) if e.is_network() && self.monitor.is_offline() => {
                match self.try_enqueue(method, endpoint, &payload) {
                    Some(()) => Ok(ApiResponse::queued(payload)),
                    None => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Persists a successful read into the local mirror when the route is
    /// cacheable. List answers replace records one by one; a single-object
    /// answer (the profile endpoint) is stored as one record. Cache failures
    /// are logged and never affect the answer.
    fn cache_read(&self, endpoint: &str, body: &JsonValue) {
        let Some(store) = &self.store else { return };
        let Some(route) = cacheable_route(endpoint) else { return };

        if let Some(rows) = rows_from_response(body) {
            match store.bulk_put(route.collection, &rows) {
                Ok(results) => {
                    let failed = results.iter().filter(|r| !r.ok).count();
                    if failed > 0 {
                        warn!("cache: {failed} records from '{endpoint}' not stored");
                    }
                }
                Err(e) => warn!("cache: bulkPut for '{endpoint}' failed: {e}"),
            }
        } else if body.is_object() {
            if let Err(e) = store.put(route.collection, body) {
                warn!("cache: put for '{endpoint}' failed: {e}");
            }
        }
    }

    /// Local-mirror answer for a failed cacheable read. An empty collection
    /// is treated as a miss so the caller sees the network error rather than
    /// a confidently empty list.
    fn read_fallback(&self, endpoint: &str) -> Option<JsonValue> {
        let store = self.store.as_ref()?;
        let route = cacheable_route(endpoint)?;
        match store.get_all(route.collection) {
            Ok(rows) if rows.is_empty() => None,
            Ok(rows) => Some(JsonValue::Array(rows)),
            Err(e) => {
                warn!("cache fallback for '{endpoint}' failed: {e}");
                None
            }
        }
    }

    /// Queues a replay-safe write and emits `operationQueued`. Returns `None`
    /// when the endpoint is not queueable or no queue exists, in which case
    /// the original network error surfaces.
    fn try_enqueue(&self, method: HttpMethod, endpoint: &str, payload: &JsonValue) -> Option<()> {
        let queue = self.queue.as_ref()?;
        let route = route_for(endpoint).filter(|route| route.queueable)?;
        let queue_method = match method {
            HttpMethod::Post if endpoint_path(endpoint).ends_with("/bulk") => {
                QueueMethod::BulkCreate
            }
            HttpMethod::Post => QueueMethod::Create,
            HttpMethod::Put => QueueMethod::Update,
            HttpMethod::Delete => QueueMethod::Delete,
            HttpMethod::Get => return None,
        };
        match queue.enqueue(route.collection, queue_method, endpoint, payload.clone()) {
            Ok(operation) => {
                self.monitor.emit(&OfflineEvent::OperationQueued {
                    seq: operation.seq,
                    collection: operation.collection,
                });
                Some(())
            }
            Err(e) => {
                warn!("failed to queue {method} {endpoint}: {e}");
                None
            }
        }
    }
}

fn cacheable_route(endpoint: &str) -> Option<&'static Route> {
    route_for(endpoint).filter(|route| route.cacheable)
}
