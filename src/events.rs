//! Observable events fanned out through the connectivity monitor.

use serde::Serialize;

use crate::collections::Collection;

/// Events delivered to subscribers of the connectivity monitor.
///
/// `Online` and `Offline` originate from host connectivity transitions;
/// the rest are forwarded from the sync engine and the client façade, which
/// publish through the monitor so the UI has a single subscription point.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OfflineEvent {
    Online,
    Offline,
    SyncStart,
    #[serde(rename_all = "camelCase")]
    SyncComplete {
        success: bool,
        success_count: usize,
        failure_count: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    OperationQueued { seq: u64, collection: Collection },
}

impl OfflineEvent {
    /// Event tag as it appears on the wire, handy for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            OfflineEvent::Online => "online",
            OfflineEvent::Offline => "offline",
            OfflineEvent::SyncStart => "syncStart",
            OfflineEvent::SyncComplete { .. } => "syncComplete",
            OfflineEvent::OperationQueued { .. } => "operationQueued",
        }
    }
}
