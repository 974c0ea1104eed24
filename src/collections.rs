//! Domain collection catalog: table definitions, secondary indexes, and the
//! URL routing table consulted by the client façade.
//!
//! Records are opaque JSON documents; the layer reads only the `id` key and
//! the indexed fields named here. Adding a collection means adding a variant,
//! its tables, and (if the façade should see it) a [`Route`] entry.

use redb::{MultimapTableDefinition, TableDefinition};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Tags for the domain collections mirrored on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Collection {
    #[serde(rename = "students")]
    Students,
    #[serde(rename = "batches")]
    Batches,
    #[serde(rename = "teachers")]
    Teachers,
    #[serde(rename = "pcs")]
    Pcs,
    #[serde(rename = "attendance")]
    Attendance,
    #[serde(rename = "labBookings")]
    LabBookings,
}

/// Separator joining the parts of a compound index value. Low enough to sort
/// before any printable character, so date-prefixed ranges stay contiguous.
pub(crate) const COMPOUND_SEPARATOR: char = '\u{1f}';

/// A named secondary index over one or more record fields.
pub struct IndexDef {
    pub name: &'static str,
    pub fields: &'static [&'static str],
    pub(crate) table: MultimapTableDefinition<'static, &'static str, &'static str>,
}

impl IndexDef {
    /// Extracts the index value for a record, or `None` if any indexed field
    /// is absent or not representable as a string.
    pub(crate) fn value_of(&self, record: &JsonValue) -> Option<String> {
        let mut parts = Vec::with_capacity(self.fields.len());
        for field in self.fields {
            parts.push(field_as_string(record.get(*field)?)?);
        }
        Some(parts.join(&COMPOUND_SEPARATOR.to_string()))
    }
}

fn field_as_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

const STUDENTS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("students");
const BATCHES_TABLE: TableDefinition<&str, &str> = TableDefinition::new("batches");
const TEACHERS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("teachers");
const PCS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("pcs");
const ATTENDANCE_TABLE: TableDefinition<&str, &str> = TableDefinition::new("attendance");
const LAB_BOOKINGS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("labBookings");

const STUDENT_INDEXES: &[IndexDef] = &[
    IndexDef { name: "rollNo", fields: &["rollNo"], table: MultimapTableDefinition::new("students.rollNo") },
    IndexDef { name: "batchId", fields: &["batchId"], table: MultimapTableDefinition::new("students.batchId") },
    IndexDef { name: "name", fields: &["name"], table: MultimapTableDefinition::new("students.name") },
];

const BATCH_INDEXES: &[IndexDef] = &[
    IndexDef { name: "name", fields: &["name"], table: MultimapTableDefinition::new("batches.name") },
    IndexDef { name: "createdBy", fields: &["createdBy"], table: MultimapTableDefinition::new("batches.createdBy") },
];

const TEACHER_INDEXES: &[IndexDef] = &[
    IndexDef { name: "email", fields: &["email"], table: MultimapTableDefinition::new("teachers.email") },
    IndexDef { name: "name", fields: &["name"], table: MultimapTableDefinition::new("teachers.name") },
];

const PC_INDEXES: &[IndexDef] = &[
    IndexDef { name: "pcNumber", fields: &["pcNumber"], table: MultimapTableDefinition::new("pcs.pcNumber") },
    IndexDef { name: "rowNumber", fields: &["rowNumber"], table: MultimapTableDefinition::new("pcs.rowNumber") },
    IndexDef { name: "status", fields: &["status"], table: MultimapTableDefinition::new("pcs.status") },
];

const ATTENDANCE_INDEXES: &[IndexDef] = &[
    IndexDef { name: "studentId", fields: &["studentId"], table: MultimapTableDefinition::new("attendance.studentId") },
    IndexDef { name: "batchId", fields: &["batchId"], table: MultimapTableDefinition::new("attendance.batchId") },
    IndexDef { name: "date", fields: &["date"], table: MultimapTableDefinition::new("attendance.date") },
    IndexDef { name: "date_studentId", fields: &["date", "studentId"], table: MultimapTableDefinition::new("attendance.date_studentId") },
];

const LAB_BOOKING_INDEXES: &[IndexDef] = &[
    IndexDef { name: "pcId", fields: &["pcId"], table: MultimapTableDefinition::new("labBookings.pcId") },
    IndexDef { name: "date", fields: &["date"], table: MultimapTableDefinition::new("labBookings.date") },
    IndexDef { name: "timeSlot", fields: &["timeSlot"], table: MultimapTableDefinition::new("labBookings.timeSlot") },
    IndexDef { name: "date_timeSlot", fields: &["date", "timeSlot"], table: MultimapTableDefinition::new("labBookings.date_timeSlot") },
];

impl Collection {
    /// Every domain collection, in schema order.
    pub const ALL: [Collection; 6] = [
        Collection::Students,
        Collection::Batches,
        Collection::Teachers,
        Collection::Pcs,
        Collection::Attendance,
        Collection::LabBookings,
    ];

    /// Slowly-changing catalogs refreshed whole by the pull phase.
    pub const REFERENCE: [Collection; 4] = [
        Collection::Students,
        Collection::Batches,
        Collection::Teachers,
        Collection::Pcs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Students => "students",
            Collection::Batches => "batches",
            Collection::Teachers => "teachers",
            Collection::Pcs => "pcs",
            Collection::Attendance => "attendance",
            Collection::LabBookings => "labBookings",
        }
    }

    pub(crate) fn table(&self) -> TableDefinition<'static, &'static str, &'static str> {
        match self {
            Collection::Students => STUDENTS_TABLE,
            Collection::Batches => BATCHES_TABLE,
            Collection::Teachers => TEACHERS_TABLE,
            Collection::Pcs => PCS_TABLE,
            Collection::Attendance => ATTENDANCE_TABLE,
            Collection::LabBookings => LAB_BOOKINGS_TABLE,
        }
    }

    pub(crate) fn indexes(&self) -> &'static [IndexDef] {
        match self {
            Collection::Students => STUDENT_INDEXES,
            Collection::Batches => BATCH_INDEXES,
            Collection::Teachers => TEACHER_INDEXES,
            Collection::Pcs => PC_INDEXES,
            Collection::Attendance => ATTENDANCE_INDEXES,
            Collection::LabBookings => LAB_BOOKING_INDEXES,
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the façade's URL routing table.
///
/// `cacheable` reads are persisted into the local store on success;
/// `queueable` writes are replay-safe and may be queued while offline.
/// Endpoints that match no route behave as pure pass-through.
pub struct Route {
    pub prefix: &'static str,
    pub collection: Collection,
    pub cacheable: bool,
    pub queueable: bool,
}

pub const ROUTES: &[Route] = &[
    Route { prefix: "/api/students", collection: Collection::Students, cacheable: true, queueable: true },
    Route { prefix: "/api/batches", collection: Collection::Batches, cacheable: true, queueable: false },
    Route { prefix: "/api/users/teachers", collection: Collection::Teachers, cacheable: true, queueable: false },
    Route { prefix: "/api/users/profile", collection: Collection::Teachers, cacheable: true, queueable: false },
    Route { prefix: "/api/lab/pcs", collection: Collection::Pcs, cacheable: true, queueable: false },
    Route { prefix: "/api/lab/bookings", collection: Collection::LabBookings, cacheable: false, queueable: true },
    Route { prefix: "/api/attendance", collection: Collection::Attendance, cacheable: false, queueable: true },
];

/// Endpoint path with any query string removed.
pub(crate) fn endpoint_path(endpoint: &str) -> &str {
    endpoint.split('?').next().unwrap_or(endpoint)
}

/// Looks up the routing table entry for an endpoint. A route matches the
/// exact path or any subpath (`/api/students/s1`).
pub fn route_for(endpoint: &str) -> Option<&'static Route> {
    let path = endpoint_path(endpoint);
    ROUTES.iter().find(|route| {
        path.strip_prefix(route.prefix)
            .map_or(false, |rest| rest.is_empty() || rest.starts_with('/'))
    })
}

/// Extracts the primary key of a record, if present and non-empty.
pub(crate) fn record_id(record: &JsonValue) -> Option<String> {
    record
        .get("id")
        .and_then(JsonValue::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn route_matches_exact_and_subpath() {
        assert_eq!(route_for("/api/students").map(|r| r.collection), Some(Collection::Students));
        assert_eq!(route_for("/api/students/s1").map(|r| r.collection), Some(Collection::Students));
        assert_eq!(route_for("/api/attendance/bulk").map(|r| r.collection), Some(Collection::Attendance));
        assert!(route_for("/api/studentsextra").is_none());
        assert!(route_for("/api/notifications").is_none());
    }

    #[test]
    fn route_ignores_query_string() {
        let route = route_for("/api/lab/bookings?date=2024-06-01").unwrap();
        assert_eq!(route.collection, Collection::LabBookings);
        assert!(route.queueable);
        assert!(!route.cacheable);
    }

    #[test]
    fn queueable_set_is_replay_safe_tags_only() {
        let queueable: Vec<_> = ROUTES.iter().filter(|r| r.queueable).map(|r| r.collection).collect();
        assert_eq!(
            queueable,
            vec![Collection::Students, Collection::LabBookings, Collection::Attendance]
        );
    }

    #[test]
    fn compound_index_value_joins_fields() {
        let idx = ATTENDANCE_INDEXES.iter().find(|i| i.name == "date_studentId").unwrap();
        let record = json!({"id": "a1", "date": "2024-06-01", "studentId": "s1"});
        assert_eq!(idx.value_of(&record), Some(format!("2024-06-01{COMPOUND_SEPARATOR}s1")));

        let partial = json!({"id": "a2", "date": "2024-06-01"});
        assert_eq!(idx.value_of(&partial), None);
    }

    #[test]
    fn numeric_fields_index_as_strings() {
        let idx = PC_INDEXES.iter().find(|i| i.name == "pcNumber").unwrap();
        assert_eq!(idx.value_of(&json!({"id": "p1", "pcNumber": 12})), Some("12".to_string()));
    }

    #[test]
    fn record_id_rejects_empty_and_missing() {
        assert_eq!(record_id(&json!({"id": "x"})), Some("x".to_string()));
        assert_eq!(record_id(&json!({"id": ""})), None);
        assert_eq!(record_id(&json!({"name": "n"})), None);
        assert_eq!(record_id(&json!({"id": 7})), None);
    }

    #[test]
    fn collection_serde_uses_wire_names() {
        assert_eq!(serde_json::to_string(&Collection::LabBookings).unwrap(), "\"labBookings\"");
        let parsed: Collection = serde_json::from_str("\"attendance\"").unwrap();
        assert_eq!(parsed, Collection::Attendance);
    }
}
