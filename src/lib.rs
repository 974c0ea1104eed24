//! Offline data layer for the attendance and lab-booking client.
//!
//! The layer sits between the application and its HTTP client and keeps the
//! app usable without a network:
//!
//! - **Local mirror** of the domain collections in an embedded redb database,
//!   with secondary indexes for the hot lookups.
//! - **Durable operation queue** that captures replay-safe writes made while
//!   offline and replays them in order once connectivity returns.
//! - **Sync engine** that refreshes stale collections from the server and
//!   drains the queue, on reconnect and on a periodic timer.
//! - **Client façade** with the network-first policy: remote answers win,
//!   cacheable reads fall back to the mirror, queueable writes are accepted
//!   offline and marked as such.
//!
//! [`OfflineDataLayer::init`] wires everything together. If the local
//! database cannot be opened the layer still comes up, degraded to pure
//! pass-through, so a broken disk never blocks the app outright. A schema
//! version from the future is the one fatal case.
//!
//! The sync engine spawns Tokio tasks; construct the layer inside a Tokio
//! runtime.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use attendance_offline_core::{HttpTransport, OfflineDataLayer, SyncOptions};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let options = SyncOptions::default();
//! let transport = Arc::new(HttpTransport::with_options("http://localhost:5000", &options)?);
//! let layer = OfflineDataLayer::init("offline.redb", transport, true, options)?;
//!
//! let students = layer.client().get("/api/students").await?;
//! if students.from_cache {
//!     // served from the local mirror while offline
//! }
//! # Ok(())
//! # }
//! ```

pub mod collections;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod events;
pub mod local_store;
pub mod offline_client;
pub mod operation_queue;
pub mod sync_engine;
pub mod transport;


use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{info, warn};

pub use collections::{route_for, Collection, Route, ROUTES};
pub use config::SyncOptions;
pub use connectivity::{ConnectivityMonitor, Subscription};
pub use error::{StoreError, TransportError};
pub use events::OfflineEvent;
pub use local_store::{BulkPutResult, LocalStore, MetadataEntry};
pub use offline_client::{ApiResponse, OfflineClient};
pub use operation_queue::{OperationQueue, OperationStatus, QueueMethod, QueuedOperation};
pub use sync_engine::{SyncEngine, SyncStatus};
pub use transport::{HttpMethod, HttpTransport, RemoteTransport};

/// Milliseconds since the Unix epoch. Every timestamp in the layer uses this
/// clock.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// The assembled layer: monitor, store, queue, engine, and façade.
pub struct OfflineDataLayer {
    monitor: Arc<ConnectivityMonitor>,
    store: Option<Arc<LocalStore>>,
    queue: Option<Arc<OperationQueue>>,
    engine: Option<Arc<SyncEngine>>,
    client: Arc<OfflineClient>,
}

impl OfflineDataLayer {
    /// Opens the database at `db_path` and wires the full stack. When the
    /// open fails for any reason other than a schema mismatch, the layer
    /// starts without a store, queue, or engine and every request goes
    /// straight to the transport.
    pub fn init(
        db_path: impl AsRef<Path>,
        transport: Arc<dyn RemoteTransport>,
        initially_online: bool,
        options: SyncOptions,
    ) -> Result<Self, StoreError> {
        let monitor = ConnectivityMonitor::new(initially_online);

        let store = match LocalStore::open(db_path) {
            Ok(store) => Some(Arc::new(store)),
            Err(e @ StoreError::Schema(_)) => return Err(e),
            Err(e) => {
                warn!("local store unavailable, running in pass-through mode: {e}");
                None
            }
        };

        let queue = store
            .as_ref()
            .map(|store| Arc::new(OperationQueue::new(store, options.max_retries)));

        let engine = match (&store, &queue) {
            (Some(store), Some(queue)) => {
                let engine = SyncEngine::new(
                    Arc::clone(store),
                    Arc::clone(queue),
                    Arc::clone(&monitor),
                    Arc::clone(&transport),
                    options,
                );
                engine.start();
                Some(engine)
            }
            _ => None,
        };

        let client = Arc::new(OfflineClient::new(
            transport,
            Arc::clone(&monitor),
            store.clone(),
            queue.clone(),
        ));

        info!(
            "offline data layer initialized ({})",
            if store.is_some() { "full" } else { "pass-through" }
        );
        Ok(Self { monitor, store, queue, engine, client })
    }

    pub fn client(&self) -> &Arc<OfflineClient> {
        &self.client
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    /// `None` while running in pass-through mode.
    pub fn store(&self) -> Option<&Arc<LocalStore>> {
        self.store.as_ref()
    }

    pub fn queue(&self) -> Option<&Arc<OperationQueue>> {
        self.queue.as_ref()
    }

    pub fn engine(&self) -> Option<&Arc<SyncEngine>> {
        self.engine.as_ref()
    }

    /// Stops the background tasks. The store stays usable; dropping the
    /// layer releases it with everything else.
    pub fn teardown(&self) {
        if let Some(engine) = &self.engine {
            engine.stop();
        }
    }
}
