//! Durable key-addressed persistence on the client device.
//!
//! One redb database file holds every domain collection (id → JSON document),
//! every secondary index (indexed value → id), the `sync_queue` control table
//! and the `metadata` control table. The schema is created on first open and
//! migrates forward via a monotonically increasing version number stored in
//! `metadata`.
//!
//! Individual operations are atomic. [`LocalStore::bulk_put`] is deliberately
//! NOT all-or-nothing: records without a key are skipped with a warning and
//! per-record failures do not abort the batch.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use log::{info, warn};
use redb::{Database, ReadableMultimapTable, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::collections::{record_id, Collection};
use crate::error::StoreError;
use crate::now_ms;

const METADATA_TABLE: TableDefinition<&str, &str> = TableDefinition::new("metadata");
pub(crate) const QUEUE_TABLE: TableDefinition<u64, &str> = TableDefinition::new("sync_queue");

const SCHEMA_VERSION_KEY: &str = "schemaVersion";
const SCHEMA_VERSION: u64 = 1;
const LAST_SYNC_PREFIX: &str = "lastSync_";
const LOGGED_IN_KEY: &str = "isLoggedIn";

/// A metadata value with its update timestamp, as persisted on-device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataEntry {
    pub value: JsonValue,
    pub updated_at: u64,
}

/// Per-record outcome of a [`LocalStore::bulk_put`]. One entry per input that
/// carried a valid key.
#[derive(Debug, Clone)]
pub struct BulkPutResult {
    pub id: String,
    pub ok: bool,
    pub error: Option<String>,
}

/// The device-local mirror of remote data plus the two control collections.
pub struct LocalStore {
    db: Arc<Database>,
}

impl LocalStore {
    /// Opens (or creates) the database at `path` and migrates the schema
    /// forward. Returns [`StoreError::Unavailable`] when the underlying
    /// storage cannot be opened; callers degrade to pass-through mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::create(path.as_ref())?;
        let store = Self { db: Arc::new(db) };
        store.migrate()?;
        Ok(store)
    }

    /// Shared handle for control-collection owners (the operation queue).
    pub(crate) fn handle(&self) -> Arc<Database> {
        Arc::clone(&self.db)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        let version = {
            let table = txn.open_table(METADATA_TABLE)?;
            let raw = table.get(SCHEMA_VERSION_KEY)?.map(|guard| guard.value().to_string());
            match raw {
                Some(json) => {
                    let entry: MetadataEntry = serde_json::from_str(&json)?;
                    entry
                        .value
                        .as_u64()
                        .ok_or_else(|| StoreError::Schema("schemaVersion is not an integer".to_string()))?
                }
                None => 0,
            }
        };

        if version > SCHEMA_VERSION {
            return Err(StoreError::Schema(format!(
                "on-device schema version {version} is newer than supported version {SCHEMA_VERSION}"
            )));
        }

        if version < SCHEMA_VERSION {
            // Version 1 creates every collection, index and control table.
            // Future migrations append here, gated on `version`.
            for collection in Collection::ALL {
                txn.open_table(collection.table())?;
                for index in collection.indexes() {
                    txn.open_multimap_table(index.table)?;
                }
            }
            txn.open_table(QUEUE_TABLE)?;

            let entry = MetadataEntry { value: SCHEMA_VERSION.into(), updated_at: now_ms() };
            let json = serde_json::to_string(&entry)?;
            let mut table = txn.open_table(METADATA_TABLE)?;
            table.insert(SCHEMA_VERSION_KEY, json.as_str())?;
            drop(table);
            info!("local store schema migrated {version} -> {SCHEMA_VERSION}");
        }

        txn.commit()?;
        Ok(())
    }

    /// Writes or replaces a record by key. Rejects records without a
    /// non-empty `id`.
    pub fn put(&self, collection: Collection, record: &JsonValue) -> Result<(), StoreError> {
        let id = record_id(record).ok_or(StoreError::InvalidKey)?;
        let json = serde_json::to_string(record)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(collection.table())?;
            let old = table.get(id.as_str())?.map(|guard| guard.value().to_string());
            table.insert(id.as_str(), json.as_str())?;
            drop(table);

            let old_record = old.and_then(|j| serde_json::from_str::<JsonValue>(&j).ok());
            for index in collection.indexes() {
                let mut index_table = txn.open_multimap_table(index.table)?;
                if let Some(prev) = old_record.as_ref().and_then(|r| index.value_of(r)) {
                    index_table.remove(prev.as_str(), id.as_str())?;
                }
                if let Some(next) = index.value_of(record) {
                    index_table.insert(next.as_str(), id.as_str())?;
                }
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Returns the record stored under `key`, if any.
    pub fn get(&self, collection: Collection, key: &str) -> Result<Option<JsonValue>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(collection.table())?;
        match table.get(key)? {
            Some(guard) => Ok(Some(serde_json::from_str(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Returns all records of a collection. Order is unspecified.
    pub fn get_all(&self, collection: Collection) -> Result<Vec<JsonValue>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(collection.table())?;
        let mut records = Vec::new();
        for item in table.iter()? {
            let (_, value) = item?;
            match serde_json::from_str(value.value()) {
                Ok(record) => records.push(record),
                Err(e) => warn!("skipping corrupt record in '{collection}': {e}"),
            }
        }
        Ok(records)
    }

    /// Deletes by key. Idempotent: succeeds whether or not the key existed.
    pub fn delete(&self, collection: Collection, key: &str) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(collection.table())?;
            let old = table.remove(key)?.map(|guard| guard.value().to_string());
            drop(table);

            if let Some(old_record) = old.and_then(|j| serde_json::from_str::<JsonValue>(&j).ok()) {
                for index in collection.indexes() {
                    if let Some(prev) = index.value_of(&old_record) {
                        let mut index_table = txn.open_multimap_table(index.table)?;
                        index_table.remove(prev.as_str(), key)?;
                    }
                }
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Best-effort batch write. Records lacking a key are skipped with a
    /// warning; a failing record is logged and the batch continues. Returns
    /// one result per valid input record.
    pub fn bulk_put(
        &self,
        collection: Collection,
        records: &[JsonValue],
    ) -> Result<Vec<BulkPutResult>, StoreError> {
        let txn = self.db.begin_write()?;
        let mut results = Vec::new();
        {
            let mut table = txn.open_table(collection.table())?;
            let mut index_tables = Vec::new();
            for index in collection.indexes() {
                index_tables.push((index, txn.open_multimap_table(index.table)?));
            }

            for record in records {
                let Some(id) = record_id(record) else {
                    warn!("bulkPut: skipping record without id in '{collection}'");
                    continue;
                };
                let outcome = (|| -> Result<(), StoreError> {
                    let json = serde_json::to_string(record)?;
                    let old = table.get(id.as_str())?.map(|guard| guard.value().to_string());
                    table.insert(id.as_str(), json.as_str())?;
                    let old_record = old.and_then(|j| serde_json::from_str::<JsonValue>(&j).ok());
                    for (index, index_table) in index_tables.iter_mut() {
                        if let Some(prev) = old_record.as_ref().and_then(|r| index.value_of(r)) {
                            index_table.remove(prev.as_str(), id.as_str())?;
                        }
                        if let Some(next) = index.value_of(record) {
                            index_table.insert(next.as_str(), id.as_str())?;
                        }
                    }
                    Ok(())
                })();
                match outcome {
                    Ok(()) => results.push(BulkPutResult { id, ok: true, error: None }),
                    Err(e) => {
                        warn!("bulkPut: failed to persist '{id}' in '{collection}': {e}");
                        results.push(BulkPutResult { id, ok: false, error: Some(e.to_string()) });
                    }
                }
            }
        }
        txn.commit()?;
        Ok(results)
    }

    /// Wipes a collection and its indexes.
    pub fn clear(&self, collection: Collection) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        txn.delete_table(collection.table())?;
        txn.open_table(collection.table())?;
        for index in collection.indexes() {
            txn.delete_multimap_table(index.table)?;
            txn.open_multimap_table(index.table)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Returns all records whose indexed field equals `value`.
    pub fn get_by_index(
        &self,
        collection: Collection,
        index_name: &str,
        value: &str,
    ) -> Result<Vec<JsonValue>, StoreError> {
        let index = collection
            .indexes()
            .iter()
            .find(|i| i.name == index_name)
            .ok_or_else(|| StoreError::Schema(format!("no index '{index_name}' on '{collection}'")))?;

        let txn = self.db.begin_read()?;
        let index_table = txn.open_multimap_table(index.table)?;
        let mut ids = Vec::new();
        for guard in index_table.get(value)? {
            ids.push(guard?.value().to_string());
        }
        drop(index_table);

        let table = txn.open_table(collection.table())?;
        let mut records = Vec::new();
        for id in ids {
            if let Some(guard) = table.get(id.as_str())? {
                records.push(serde_json::from_str(guard.value())?);
            }
        }
        Ok(records)
    }

    /// Returns all records whose indexed value lies within the inclusive
    /// range `[lower, upper]`. Compound index values compare
    /// lexicographically on their joined parts.
    pub fn get_by_range(
        &self,
        collection: Collection,
        index_name: &str,
        lower: &str,
        upper: &str,
    ) -> Result<Vec<JsonValue>, StoreError> {
        let index = collection
            .indexes()
            .iter()
            .find(|i| i.name == index_name)
            .ok_or_else(|| StoreError::Schema(format!("no index '{index_name}' on '{collection}'")))?;

        let txn = self.db.begin_read()?;
        let index_table = txn.open_multimap_table(index.table)?;
        let mut ids = Vec::new();
        for item in index_table.range(lower..=upper)? {
            let (_, values) = item?;
            for guard in values {
                ids.push(guard?.value().to_string());
            }
        }
        drop(index_table);

        let table = txn.open_table(collection.table())?;
        let mut records = Vec::new();
        for id in ids {
            if let Some(guard) = table.get(id.as_str())? {
                records.push(serde_json::from_str(guard.value())?);
            }
        }
        Ok(records)
    }

    /// Writes a metadata entry, stamping it with the current time.
    pub fn metadata_set(&self, key: &str, value: JsonValue) -> Result<(), StoreError> {
        let entry = MetadataEntry { value, updated_at: now_ms() };
        let json = serde_json::to_string(&entry)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(METADATA_TABLE)?;
            table.insert(key, json.as_str())?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn metadata_get(&self, key: &str) -> Result<Option<MetadataEntry>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(METADATA_TABLE)?;
        match table.get(key)? {
            Some(guard) => Ok(Some(serde_json::from_str(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Records the pull timestamp for a collection.
    pub fn set_last_sync(&self, collection: Collection) -> Result<(), StoreError> {
        self.metadata_set(&format!("{LAST_SYNC_PREFIX}{collection}"), now_ms().into())
    }

    /// Last pull timestamp for a collection, if it has ever been synced.
    pub fn last_sync(&self, collection: Collection) -> Result<Option<u64>, StoreError> {
        Ok(self
            .metadata_get(&format!("{LAST_SYNC_PREFIX}{collection}"))?
            .and_then(|entry| entry.value.as_u64()))
    }

    /// All `lastSync_<collection>` timestamps, keyed by collection name.
    pub fn last_sync_map(&self) -> Result<HashMap<String, u64>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(METADATA_TABLE)?;
        let mut map = HashMap::new();
        for item in table.iter()? {
            let (key, value) = item?;
            let Some(name) = key.value().strip_prefix(LAST_SYNC_PREFIX) else {
                continue;
            };
            let entry: MetadataEntry = match serde_json::from_str(value.value()) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("corrupt metadata entry '{}': {e}", key.value());
                    continue;
                }
            };
            if let Some(ts) = entry.value.as_u64() {
                map.insert(name.to_string(), ts);
            }
        }
        Ok(map)
    }

    pub fn set_logged_in(&self, logged_in: bool) -> Result<(), StoreError> {
        self.metadata_set(LOGGED_IN_KEY, if logged_in { "true" } else { "false" }.into())
    }

    pub fn is_logged_in(&self) -> Result<bool, StoreError> {
        Ok(self
            .metadata_get(LOGGED_IN_KEY)?
            .and_then(|entry| entry.value.as_str().map(|v| v == "true"))
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collections::COMPOUND_SEPARATOR;
    use serde_json::json;

    fn open_store() -> (tempfile::TempDir, LocalStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LocalStore::open(dir.path().join("offline.redb")).expect("open store");
        (dir, store)
    }

    #[test]
    fn put_then_get_round_trips() {
        let (_dir, store) = open_store();
        let record = json!({"id": "s1", "name": "Alice", "rollNo": "R1"});
        store.put(Collection::Students, &record).unwrap();
        assert_eq!(store.get(Collection::Students, "s1").unwrap(), Some(record));
        assert_eq!(store.get(Collection::Students, "missing").unwrap(), None);
    }

    #[test]
    fn put_replaces_by_key_atomically() {
        let (_dir, store) = open_store();
        store.put(Collection::Students, &json!({"id": "s1", "name": "Alice"})).unwrap();
        store.put(Collection::Students, &json!({"id": "s1", "name": "Alicia"})).unwrap();
        let stored = store.get(Collection::Students, "s1").unwrap().unwrap();
        assert_eq!(stored["name"], "Alicia");
        assert_eq!(store.get_all(Collection::Students).unwrap().len(), 1);
    }

    #[test]
    fn put_rejects_missing_key() {
        let (_dir, store) = open_store();
        let err = store.put(Collection::Students, &json!({"name": "NoId"})).unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey));
        let err = store.put(Collection::Students, &json!({"id": "", "name": "Empty"})).unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey));
    }

    #[test]
    fn delete_is_idempotent() {
        let (_dir, store) = open_store();
        store.put(Collection::Pcs, &json!({"id": "p1", "pcNumber": 1})).unwrap();
        store.delete(Collection::Pcs, "p1").unwrap();
        store.delete(Collection::Pcs, "p1").unwrap();
        assert_eq!(store.get(Collection::Pcs, "p1").unwrap(), None);
    }

    #[test]
    fn bulk_put_skips_invalid_records_without_aborting() {
        let (_dir, store) = open_store();
        let batch = vec![
            json!({"id": "s1", "name": "A"}),
            json!({"name": "B"}),
            json!({"id": "", "name": "C"}),
            json!({"id": "s2", "name": "D"}),
        ];
        let results = store.bulk_put(Collection::Students, &batch).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.ok));

        let mut ids: Vec<String> = store
            .get_all(Collection::Students)
            .unwrap()
            .iter()
            .map(|r| r["id"].as_str().unwrap().to_string())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["s1", "s2"]);
    }

    #[test]
    fn index_lookup_tracks_updates_and_deletes() {
        let (_dir, store) = open_store();
        store.put(Collection::Students, &json!({"id": "s1", "batchId": "b1"})).unwrap();
        store.put(Collection::Students, &json!({"id": "s2", "batchId": "b1"})).unwrap();
        assert_eq!(store.get_by_index(Collection::Students, "batchId", "b1").unwrap().len(), 2);

        // Moving s2 to another batch must drop the stale index entry.
        store.put(Collection::Students, &json!({"id": "s2", "batchId": "b2"})).unwrap();
        assert_eq!(store.get_by_index(Collection::Students, "batchId", "b1").unwrap().len(), 1);
        assert_eq!(store.get_by_index(Collection::Students, "batchId", "b2").unwrap().len(), 1);

        store.delete(Collection::Students, "s1").unwrap();
        assert!(store.get_by_index(Collection::Students, "batchId", "b1").unwrap().is_empty());
    }

    #[test]
    fn unknown_index_is_a_schema_error() {
        let (_dir, store) = open_store();
        let err = store.get_by_index(Collection::Students, "nosuch", "x").unwrap_err();
        assert!(matches!(err, StoreError::Schema(_)));
    }

    #[test]
    fn range_query_is_inclusive() {
        let (_dir, store) = open_store();
        for (id, date) in [("a1", "2024-06-01"), ("a2", "2024-06-02"), ("a3", "2024-06-05")] {
            store
                .put(Collection::Attendance, &json!({"id": id, "date": date, "studentId": "s1"}))
                .unwrap();
        }
        let hits = store
            .get_by_range(Collection::Attendance, "date", "2024-06-01", "2024-06-02")
            .unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn compound_index_scopes_by_date_prefix() {
        let (_dir, store) = open_store();
        store
            .put(Collection::LabBookings, &json!({"id": "lb1", "pcId": "p1", "date": "2024-06-01", "timeSlot": "09:00"}))
            .unwrap();
        store
            .put(Collection::LabBookings, &json!({"id": "lb2", "pcId": "p2", "date": "2024-06-02", "timeSlot": "09:00"}))
            .unwrap();
        let key = format!("2024-06-01{COMPOUND_SEPARATOR}09:00");
        let hits = store.get_by_index(Collection::LabBookings, "date_timeSlot", &key).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["id"], "lb1");
    }

    #[test]
    fn clear_wipes_records_and_indexes() {
        let (_dir, store) = open_store();
        store.put(Collection::Students, &json!({"id": "s1", "batchId": "b1"})).unwrap();
        store.clear(Collection::Students).unwrap();
        assert!(store.get_all(Collection::Students).unwrap().is_empty());
        assert!(store.get_by_index(Collection::Students, "batchId", "b1").unwrap().is_empty());
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offline.redb");
        {
            let store = LocalStore::open(&path).unwrap();
            store.put(Collection::Batches, &json!({"id": "b1", "name": "Morning"})).unwrap();
        }
        let store = LocalStore::open(&path).unwrap();
        assert!(store.get(Collection::Batches, "b1").unwrap().is_some());
    }

    #[test]
    fn metadata_round_trips_and_tracks_last_sync() {
        let (_dir, store) = open_store();
        assert_eq!(store.last_sync(Collection::Students).unwrap(), None);
        store.set_last_sync(Collection::Students).unwrap();
        let ts = store.last_sync(Collection::Students).unwrap().unwrap();
        assert!(ts > 0);

        let map = store.last_sync_map().unwrap();
        assert_eq!(map.get("students"), Some(&ts));
        assert!(map.get("batches").is_none());
    }

    #[test]
    fn logged_in_flag_defaults_to_false() {
        let (_dir, store) = open_store();
        assert!(!store.is_logged_in().unwrap());
        store.set_logged_in(true).unwrap();
        assert!(store.is_logged_in().unwrap());
        store.set_logged_in(false).unwrap();
        assert!(!store.is_logged_in().unwrap());
    }
}
