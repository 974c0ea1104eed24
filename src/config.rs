//! Sync engine configuration.

use serde::{Deserialize, Serialize};

/// Options recognised by the sync engine. All durations are milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncOptions {
    /// Pull is skipped for a collection synced more recently than this.
    pub stale_after_ms: u64,
    /// Periodic drain interval while online.
    pub periodic_interval_ms: u64,
    /// Window of dates pulled for attendance and lab bookings.
    pub recent_transactional_days: u32,
    /// Per-operation retry budget before an entry is parked as FAILED.
    pub max_retries: u32,
    /// Timeout applied to every remote request.
    pub request_timeout_ms: u64,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            stale_after_ms: 300_000,
            periodic_interval_ms: 30_000,
            recent_transactional_days: 7,
            max_retries: 3,
            request_timeout_ms: 10_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let options = SyncOptions::default();
        assert_eq!(options.stale_after_ms, 300_000);
        assert_eq!(options.periodic_interval_ms, 30_000);
        assert_eq!(options.recent_transactional_days, 7);
        assert_eq!(options.max_retries, 3);
        assert_eq!(options.request_timeout_ms, 10_000);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let options: SyncOptions = serde_json::from_str(r#"{"staleAfterMs": 1000}"#).unwrap();
        assert_eq!(options.stale_after_ms, 1000);
        assert_eq!(options.max_retries, 3);
    }
}
