use thiserror::Error;

pub type Result<T> = std::result::Result<T, PagingError>;

/// Errors raised by the residency tables and the free-page pool.
///
/// Every variant except [`PagingError::PoolExhausted`] is a protocol
/// invariant violation: the caller asked about a key the table cannot hold
/// unless a device message was lost or reordered. The table variants carry a
/// rendered dump of the offending table so the fatal path prints full
/// diagnostics without needing the table itself.
#[derive(Debug, Error)]
pub enum PagingError {
    #[error("{table}: lookup of missing key {key}\n{dump}")]
    MissingKey {
        table: &'static str,
        key: String,
        dump: String,
    },

    #[error("{table}: duplicate insert of key {key}\n{dump}")]
    DuplicateKey {
        table: &'static str,
        key: String,
        dump: String,
    },

    #[error("free-page pool exhausted ({capacity} device pages all resident)")]
    PoolExhausted { capacity: usize },

    #[error("{table}: pending-table overflow (capacity {capacity})")]
    PendingOverflow {
        table: &'static str,
        capacity: usize,
    },

    #[error("{table}: clear of key {key} that is not pending")]
    PendingMissing { table: &'static str, key: String },
}
