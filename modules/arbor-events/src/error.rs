use thiserror::Error;

/// Result type alias for history operations.
pub type Result<T> = std::result::Result<T, HistoryError>;

#[derive(Debug, Error)]
pub enum HistoryError {
    /// Partition or event absent. Stream reads treat a missing partition as
    /// empty; single-entity lookups return this.
    #[error("not found: {0}")]
    NotFound(String),

    /// An explicit expected sequence did not match the next free slot.
    #[error("concurrency conflict on {partition}: expected sequence {expected}, next free is {actual}")]
    ConcurrencyConflict {
        partition: String,
        expected: i64,
        actual: i64,
    },

    /// Transient storage failure. Retry with the same event id.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A stored record could not be decoded.
    #[error("decode failure: {0}")]
    DecodeFailure(String),

    #[error("invalid partition id: {0}")]
    InvalidPartition(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl HistoryError {
    /// True for failures a caller may retry unchanged (same event id).
    pub fn is_retryable(&self) -> bool {
        matches!(self, HistoryError::StorageUnavailable(_))
    }
}

impl From<sqlx::Error> for HistoryError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::ColumnNotFound(_) => {
                HistoryError::DecodeFailure(err.to_string())
            }
            _ => HistoryError::StorageUnavailable(err.to_string()),
        }
    }
}
