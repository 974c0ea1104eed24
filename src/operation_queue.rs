//! Durable, ordered write-ahead queue of mutations to replay against the
//! remote.
//!
//! Entries live in the `sync_queue` table of the shared database, keyed by a
//! monotonically increasing `seq`; iteration order is therefore enqueue
//! order. Status transitions are single-entry transactions, so they are
//! atomic with respect to concurrent enqueues.

use std::sync::Arc;

use log::{debug, warn};
use redb::{Database, ReadableTable};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::collections::Collection;
use crate::error::StoreError;
use crate::local_store::{LocalStore, QUEUE_TABLE};
use crate::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Pending,
    Completed,
    Failed,
}

/// Logical verb of a queued mutation, mapped back to HTTP on replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueMethod {
    Create,
    Update,
    Delete,
    BulkCreate,
}

/// One pending mutation. The payload is the whole document (never a partial
/// patch), so replay is idempotent under last-writer-wins at the remote.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    pub seq: u64,
    #[serde(rename = "type")]
    pub collection: Collection,
    pub method: QueueMethod,
    pub endpoint: String,
    pub payload: JsonValue,
    pub enqueued_at: u64,
    pub status: OperationStatus,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_retry_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
}

pub struct OperationQueue {
    db: Arc<Database>,
    max_retries: u32,
}

impl OperationQueue {
    pub fn new(store: &LocalStore, max_retries: u32) -> Self {
        Self { db: store.handle(), max_retries }
    }

    /// Appends a PENDING entry and returns it with its assigned `seq`.
    pub fn enqueue(
        &self,
        collection: Collection,
        method: QueueMethod,
        endpoint: impl Into<String>,
        payload: JsonValue,
    ) -> Result<QueuedOperation, StoreError> {
        let txn = self.db.begin_write()?;
        let operation = {
            let mut table = txn.open_table(QUEUE_TABLE)?;
            let seq = table.last()?.map(|(key, _)| key.value() + 1).unwrap_or(1);
            let operation = QueuedOperation {
                seq,
                collection,
                method,
                endpoint: endpoint.into(),
                payload,
                enqueued_at: now_ms(),
                status: OperationStatus::Pending,
                retry_count: 0,
                last_error: None,
                last_retry_at: None,
                completed_at: None,
            };
            let json = serde_json::to_string(&operation)?;
            table.insert(seq, json.as_str())?;
            operation
        };
        txn.commit()?;
        debug!(
            "queued {:?} {} for '{}' as seq {}",
            operation.method, operation.endpoint, operation.collection, operation.seq
        );
        Ok(operation)
    }

    /// PENDING entries in enqueue order.
    pub fn pending(&self) -> Result<Vec<QueuedOperation>, StoreError> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|op| op.status == OperationStatus::Pending)
            .collect())
    }

    /// Every entry regardless of status, in enqueue order. FAILED entries
    /// stay here for forensic inspection until explicitly cleared.
    pub fn all(&self) -> Result<Vec<QueuedOperation>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(QUEUE_TABLE)?;
        let mut operations = Vec::new();
        for item in table.iter()? {
            let (key, value) = item?;
            match serde_json::from_str(value.value()) {
                Ok(operation) => operations.push(operation),
                Err(e) => warn!("skipping corrupt queue entry {}: {e}", key.value()),
            }
        }
        Ok(operations)
    }

    /// Number of PENDING entries.
    pub fn count(&self) -> Result<usize, StoreError> {
        Ok(self.pending()?.len())
    }

    /// Transitions PENDING → COMPLETED. Any other current status is left
    /// untouched and logged.
    pub fn mark_completed(&self, seq: u64) -> Result<(), StoreError> {
        self.update(seq, |operation| {
            if operation.status != OperationStatus::Pending {
                warn!("markCompleted: seq {seq} is {:?}, not PENDING", operation.status);
                return;
            }
            operation.status = OperationStatus::Completed;
            operation.completed_at = Some(now_ms());
        })
    }

    /// Records a replay failure: bumps `retry_count`, stamps the error, and
    /// parks the entry as FAILED once the retry budget is spent. Returns the
    /// resulting status.
    pub fn record_failure(&self, seq: u64, error: &str) -> Result<OperationStatus, StoreError> {
        let mut resulting = OperationStatus::Pending;
        self.update(seq, |operation| {
            operation.retry_count += 1;
            operation.last_error = Some(error.to_string());
            operation.last_retry_at = Some(now_ms());
            if operation.retry_count >= self.max_retries {
                operation.status = OperationStatus::Failed;
                warn!(
                    "seq {seq} exhausted its retry budget ({} attempts); parking as FAILED",
                    operation.retry_count
                );
            }
            resulting = operation.status;
        })?;
        Ok(resulting)
    }

    /// Deletes all COMPLETED entries. Returns how many were removed.
    pub fn gc_completed(&self) -> Result<usize, StoreError> {
        self.sweep(OperationStatus::Completed)
    }

    /// Deletes all FAILED entries on demand; nothing calls this
    /// automatically, so the dead-letter set survives for forensics.
    pub fn clear_failed(&self) -> Result<usize, StoreError> {
        self.sweep(OperationStatus::Failed)
    }

    fn update(&self, seq: u64, apply: impl FnOnce(&mut QueuedOperation)) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(QUEUE_TABLE)?;
            let existing = table.get(seq)?.map(|guard| guard.value().to_string());
            match existing {
                Some(json) => {
                    let mut operation: QueuedOperation = serde_json::from_str(&json)?;
                    apply(&mut operation);
                    let json = serde_json::to_string(&operation)?;
                    table.insert(seq, json.as_str())?;
                }
                None => warn!("queue update for unknown seq {seq}"),
            }
        }
        txn.commit()?;
        Ok(())
    }

    fn sweep(&self, status: OperationStatus) -> Result<usize, StoreError> {
        let doomed: Vec<u64> = self
            .all()?
            .into_iter()
            .filter(|op| op.status == status)
            .map(|op| op.seq)
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(QUEUE_TABLE)?;
            for seq in &doomed {
                table.remove(*seq)?;
            }
        }
        txn.commit()?;
        debug!("swept {} {status:?} queue entries", doomed.len());
        Ok(doomed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn open_queue() -> (tempfile::TempDir, LocalStore, OperationQueue) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LocalStore::open(dir.path().join("offline.redb")).expect("open store");
        let queue = OperationQueue::new(&store, 3);
        (dir, store, queue)
    }

    fn enqueue_attendance(queue: &OperationQueue, id: &str) -> QueuedOperation {
        queue
            .enqueue(
                Collection::Attendance,
                QueueMethod::Create,
                "/api/attendance",
                json!({"id": id, "studentId": "s1", "date": "2024-06-01", "status": "present"}),
            )
            .unwrap()
    }

    #[test]
    fn enqueue_assigns_increasing_seq_and_preserves_order() {
        let (_dir, _store, queue) = open_queue();
        let first = enqueue_attendance(&queue, "a1");
        let second = enqueue_attendance(&queue, "a2");
        assert!(second.seq > first.seq);

        let pending = queue.pending().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].payload["id"], "a1");
        assert_eq!(pending[1].payload["id"], "a2");
        assert_eq!(queue.count().unwrap(), 2);
    }

    #[test]
    fn mark_completed_then_gc_deletes_entry() {
        let (_dir, _store, queue) = open_queue();
        let op = enqueue_attendance(&queue, "a1");
        queue.mark_completed(op.seq).unwrap();

        assert_eq!(queue.count().unwrap(), 0);
        assert_eq!(queue.all().unwrap()[0].status, OperationStatus::Completed);
        assert_eq!(queue.gc_completed().unwrap(), 1);
        assert!(queue.all().unwrap().is_empty());
    }

    #[test]
    fn mark_completed_does_not_resurrect_failed_entries() {
        let (_dir, _store, queue) = open_queue();
        let op = enqueue_attendance(&queue, "a1");
        for _ in 0..3 {
            queue.record_failure(op.seq, "connection reset").unwrap();
        }
        queue.mark_completed(op.seq).unwrap();
        assert_eq!(queue.all().unwrap()[0].status, OperationStatus::Failed);
    }

    #[test]
    fn record_failure_parks_entry_after_retry_budget() {
        let (_dir, _store, queue) = open_queue();
        let op = enqueue_attendance(&queue, "a1");

        assert_eq!(queue.record_failure(op.seq, "timeout").unwrap(), OperationStatus::Pending);
        assert_eq!(queue.record_failure(op.seq, "timeout").unwrap(), OperationStatus::Pending);
        assert_eq!(queue.record_failure(op.seq, "timeout").unwrap(), OperationStatus::Failed);

        let entry = &queue.all().unwrap()[0];
        assert_eq!(entry.retry_count, 3);
        assert_eq!(entry.last_error.as_deref(), Some("timeout"));
        assert!(entry.last_retry_at.is_some());
        // Parked entries no longer appear in the drain set.
        assert!(queue.pending().unwrap().is_empty());
    }

    #[test]
    fn clear_failed_sweeps_only_failed() {
        let (_dir, _store, queue) = open_queue();
        let poisoned = enqueue_attendance(&queue, "a1");
        enqueue_attendance(&queue, "a2");
        for _ in 0..3 {
            queue.record_failure(poisoned.seq, "boom").unwrap();
        }
        assert_eq!(queue.clear_failed().unwrap(), 1);
        assert_eq!(queue.all().unwrap().len(), 1);
        assert_eq!(queue.count().unwrap(), 1);
    }

    #[test]
    fn entries_survive_reopen_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offline.redb");
        {
            let store = LocalStore::open(&path).unwrap();
            let queue = OperationQueue::new(&store, 3);
            enqueue_attendance(&queue, "a1");
            enqueue_attendance(&queue, "a2");
        }
        let store = LocalStore::open(&path).unwrap();
        let queue = OperationQueue::new(&store, 3);
        let pending = queue.pending().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].payload["id"], "a1");
        assert_eq!(pending[1].payload["id"], "a2");
        // New entries continue the sequence rather than reusing it.
        let next = enqueue_attendance(&queue, "a3");
        assert!(next.seq > pending[1].seq);
    }

    #[test]
    fn queue_entry_wire_format_is_stable() {
        let (_dir, _store, queue) = open_queue();
        let op = enqueue_attendance(&queue, "a1");
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["type"], "attendance");
        assert_eq!(json["method"], "CREATE");
        assert_eq!(json["status"], "PENDING");
        assert!(json["enqueuedAt"].is_u64());
        assert!(json.get("lastError").is_none());
    }
}
