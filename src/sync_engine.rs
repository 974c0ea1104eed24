//! The reconciler: pull remote state into the local mirror, then drain the
//! operation queue back out.
//!
//! A single `in_progress` flag guards both phases; a second `sync_all` while
//! one is running is dropped, not queued. Failures inside either phase are
//! logged per unit (collection, date, batch, or queue entry) and never abort
//! the whole sync. `syncStart` / `syncComplete` events flow through the
//! connectivity monitor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{Days, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::collections::Collection;
use crate::config::SyncOptions;
use crate::connectivity::{ConnectivityMonitor, Subscription};
use crate::events::OfflineEvent;
use crate::local_store::LocalStore;
use crate::now_ms;
use crate::operation_queue::{OperationQueue, OperationStatus, QueueMethod};
use crate::transport::{rows_from_response, HttpMethod, RemoteTransport};

/// Reference collections and the endpoints that serve them whole.
const REFERENCE_PULLS: [(Collection, &str); 4] = [
    (Collection::Students, "/api/students"),
    (Collection::Batches, "/api/batches"),
    (Collection::Teachers, "/api/users/teachers"),
    (Collection::Pcs, "/api/lab/pcs"),
];

/// Snapshot returned by [`SyncEngine::status`] for the UI indicator.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub in_progress: bool,
    pub pending_count: usize,
    pub last_sync: HashMap<String, u64>,
}

#[derive(Default)]
struct EngineTasks {
    periodic: Option<JoinHandle<()>>,
    subscription: Option<Subscription>,
}

/// Releases the engine's in-flight flag on drop, so a cancelled or panicking
/// sync cannot leave the flag stuck and wedge every later `sync_all`.
struct RunGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

pub struct SyncEngine {
    store: Arc<LocalStore>,
    queue: Arc<OperationQueue>,
    monitor: Arc<ConnectivityMonitor>,
    transport: Arc<dyn RemoteTransport>,
    options: SyncOptions,
    in_progress: AtomicBool,
    tasks: Mutex<EngineTasks>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<LocalStore>,
        queue: Arc<OperationQueue>,
        monitor: Arc<ConnectivityMonitor>,
        transport: Arc<dyn RemoteTransport>,
        options: SyncOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            queue,
            monitor,
            transport,
            options,
            in_progress: AtomicBool::new(false),
            tasks: Mutex::new(EngineTasks::default()),
        })
    }

    /// Wires the online-transition listener and the periodic timer. Must be
    /// called from within a Tokio runtime. Calling `start` twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if tasks.subscription.is_some() {
            return;
        }

        let engine = Arc::downgrade(self);
        tasks.subscription = Some(self.monitor.subscribe(move |event| {
            if matches!(event, OfflineEvent::Online) {
                if let Some(engine) = engine.upgrade() {
                    // Scheduled, not awaited: the transition notification
                    // must not block on the sync.
                    tokio::spawn(async move { engine.sync_all().await });
                }
            }
        }));

        let engine = Arc::downgrade(self);
        let interval = Duration::from_millis(self.options.periodic_interval_ms);
        tasks.periodic = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // first tick resolves immediately
            loop {
                ticker.tick().await;
                let Some(engine) = engine.upgrade() else { break };
                if engine.monitor.is_online() {
                    engine.sync_all().await;
                }
            }
        }));
        debug!("sync engine started (interval {interval:?})");
    }

    /// Stops the periodic timer and drops the online listener.
    pub fn stop(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = tasks.periodic.take() {
            handle.abort();
        }
        tasks.subscription = None;
    }

    /// Runs pull then push. If a sync is already in progress the call
    /// returns immediately without starting a second one.
    pub async fn sync_all(&self) {
        if self.in_progress.swap(true, Ordering::SeqCst) {
            debug!("sync already in progress; dropping invocation");
            return;
        }
        let running = RunGuard { flag: &self.in_progress };
        self.monitor.emit(&OfflineEvent::SyncStart);
        info!("sync started");

        self.pull().await;
        let (success_count, failure_count) = self.push().await;

        drop(running);
        let success = failure_count == 0;
        info!("sync finished: {success_count} replayed, {failure_count} failed");
        self.monitor.emit(&OfflineEvent::SyncComplete {
            success,
            success_count,
            failure_count,
            error: None,
        });
    }

    /// User-initiated sync. Refuses (returning `false`) while offline or
    /// while another sync is running.
    pub async fn force_sync(&self) -> bool {
        if self.monitor.is_offline() {
            debug!("forceSync refused: offline");
            return false;
        }
        if self.in_progress.load(Ordering::SeqCst) {
            debug!("forceSync refused: sync already running");
            return false;
        }
        self.sync_all().await;
        true
    }

    pub fn status(&self) -> SyncStatus {
        let pending_count = self.queue.count().unwrap_or_else(|e| {
            warn!("failed to count pending operations: {e}");
            0
        });
        let last_sync = self.store.last_sync_map().unwrap_or_else(|e| {
            warn!("failed to read lastSync metadata: {e}");
            HashMap::new()
        });
        SyncStatus {
            in_progress: self.in_progress.load(Ordering::SeqCst),
            pending_count,
            last_sync,
        }
    }

    /// True when the collection was pulled more recently than the staleness
    /// threshold.
    fn is_fresh(&self, collection: Collection) -> bool {
        match self.store.last_sync(collection) {
            Ok(Some(ts)) => now_ms().saturating_sub(ts) < self.options.stale_after_ms,
            Ok(None) => false,
            Err(e) => {
                warn!("failed to read lastSync for '{collection}': {e}");
                false
            }
        }
    }

    /// Remote → local refresh. Reference collections are replaced whole;
    /// attendance and lab bookings are pulled per date (and per batch for
    /// attendance, which is the shape of the remote API). Each failing unit
    /// is logged and skipped. A collection is stamped as synced only when at
    /// least one of its pulls landed, so a refresh that failed wholesale is
    /// retried on the next sync instead of sitting out the staleness window.
    async fn pull(&self) {
        for (collection, endpoint) in REFERENCE_PULLS {
            if self.is_fresh(collection) {
                debug!("pull: '{collection}' is fresh, skipping");
                continue;
            }
            match self.transport.request(HttpMethod::Get, endpoint, None).await {
                Ok(body) => {
                    if self.store_rows(collection, &body) {
                        self.stamp_last_sync(collection);
                    }
                }
                Err(e) => warn!("pull: failed to refresh '{collection}': {e}"),
            }
        }

        let dates = self.recent_dates();

        if !self.is_fresh(Collection::LabBookings) {
            let mut pulled = false;
            for date in &dates {
                let endpoint = format!("/api/lab/bookings?date={date}");
                match self.transport.request(HttpMethod::Get, &endpoint, None).await {
                    Ok(body) => pulled |= self.store_rows(Collection::LabBookings, &body),
                    Err(e) => warn!("pull: lab bookings for {date} failed: {e}"),
                }
            }
            if pulled {
                self.stamp_last_sync(Collection::LabBookings);
            }
        }

        if !self.is_fresh(Collection::Attendance) {
            let batches = self.store.get_all(Collection::Batches).unwrap_or_else(|e| {
                warn!("pull: cannot list batches for attendance refresh: {e}");
                Vec::new()
            });
            let mut pulled = false;
            for batch in &batches {
                let Some(batch_id) = batch.get("id").and_then(|v| v.as_str()) else {
                    continue;
                };
                for date in &dates {
                    let endpoint = format!("/api/attendance?batchId={batch_id}&date={date}");
                    match self.transport.request(HttpMethod::Get, &endpoint, None).await {
                        Ok(body) => pulled |= self.store_rows(Collection::Attendance, &body),
                        Err(e) => {
                            warn!("pull: attendance for batch {batch_id} on {date} failed: {e}")
                        }
                    }
                }
            }
            if pulled {
                self.stamp_last_sync(Collection::Attendance);
            }
        }
    }

    /// Persists one pull response. Returns whether the rows were stored.
    fn store_rows(&self, collection: Collection, body: &serde_json::Value) -> bool {
        let Some(rows) = rows_from_response(body) else {
            warn!("pull: unusable response shape for '{collection}'");
            return false;
        };
        match self.store.bulk_put(collection, &rows) {
            Ok(results) => {
                let failed = results.iter().filter(|r| !r.ok).count();
                if failed > 0 {
                    warn!("pull: {failed} of {} records failed for '{collection}'", results.len());
                }
                debug!("pull: stored {} records into '{collection}'", results.len() - failed);
                true
            }
            Err(e) => {
                warn!("pull: bulkPut into '{collection}' failed: {e}");
                false
            }
        }
    }

    fn stamp_last_sync(&self, collection: Collection) {
        if let Err(e) = self.store.set_last_sync(collection) {
            warn!("failed to stamp lastSync for '{collection}': {e}");
        }
    }

    fn recent_dates(&self) -> Vec<String> {
        let today = Utc::now().date_naive();
        (0..self.options.recent_transactional_days)
            .map(|i| {
                today
                    .checked_sub_days(Days::new(u64::from(i)))
                    .unwrap_or(today)
                    .format("%Y-%m-%d")
                    .to_string()
            })
            .collect()
    }

    /// Local → remote drain. Strictly serial, in enqueue order; a failing
    /// entry has its failure recorded and the drain moves on, so one
    /// poisoned operation cannot block the queue. COMPLETED entries are
    /// swept afterwards.
    async fn push(&self) -> (usize, usize) {
        let pending = match self.queue.pending() {
            Ok(pending) => pending,
            Err(e) => {
                warn!("push: cannot snapshot pending operations: {e}");
                return (0, 0);
            }
        };

        let mut success_count = 0;
        let mut failure_count = 0;
        for operation in pending {
            let method = match operation.method {
                QueueMethod::Create | QueueMethod::BulkCreate => HttpMethod::Post,
                QueueMethod::Update => HttpMethod::Put,
                QueueMethod::Delete => HttpMethod::Delete,
            };
            let body = match operation.method {
                QueueMethod::Delete => None,
                _ => Some(&operation.payload),
            };
            match self.transport.request(method, &operation.endpoint, body).await {
                Ok(_) => {
                    if let Err(e) = self.queue.mark_completed(operation.seq) {
                        warn!("push: replayed seq {} but could not mark it: {e}", operation.seq);
                        failure_count += 1;
                    } else {
                        success_count += 1;
                    }
                }
                Err(e) => {
                    failure_count += 1;
                    match self.queue.record_failure(operation.seq, &e.to_string()) {
                        Ok(OperationStatus::Failed) => {
                            warn!("push: seq {} moved to dead-letter state", operation.seq)
                        }
                        Ok(_) => debug!("push: seq {} will be retried: {e}", operation.seq),
                        Err(store_err) => {
                            warn!("push: failed to record failure for seq {}: {store_err}", operation.seq)
                        }
                    }
                }
            }
        }

        if let Err(e) = self.queue.gc_completed() {
            warn!("push: failed to sweep completed entries: {e}");
        }
        (success_count, failure_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_pulls_cover_every_reference_collection() {
        let pulled: Vec<_> = REFERENCE_PULLS.iter().map(|(c, _)| *c).collect();
        assert_eq!(pulled, Collection::REFERENCE.to_vec());
    }
}
