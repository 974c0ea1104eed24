//! Error taxonomy for the offline data layer.
//!
//! Two families: [`StoreError`] for anything the local database reports and
//! [`TransportError`] for the remote side. Retry exhaustion is not an error
//! value; it is the FAILED terminal state on the queue entry itself.

use thiserror::Error;

/// Failures raised by the local store.
///
/// The redb error family is converted wholesale so store code can use `?`
/// without per-site mapping.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The underlying database could not be opened. The layer degrades to
    /// pass-through mode when construction hits this.
    #[error("local store unavailable: {0}")]
    Unavailable(#[from] redb::DatabaseError),

    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A record arrived without a non-empty string `id`. Single writes reject
    /// it; bulk writes skip the record and keep going.
    #[error("record is missing a non-empty `id` key")]
    InvalidKey,

    /// Schema migration failed or the on-device version is ahead of this
    /// build. Fatal at startup.
    #[error("schema error: {0}")]
    Schema(String),
}

/// Failures raised when talking to the remote server.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The remote was unreachable: connect failure, timeout, reset. This is
    /// the only class of failure that triggers cache fallback or queueing.
    #[error("network unavailable: {0}")]
    Network(String),

    /// The server answered with a non-2xx status. A real server answer is
    /// surfaced to the caller, never queued.
    #[error("remote rejected request with status {status}")]
    Rejected { status: u16 },
}

impl TransportError {
    /// True for failures that mean "the network is down" rather than "the
    /// server said no".
    pub fn is_network(&self) -> bool {
        matches!(self, TransportError::Network(_))
    }
}
