use thiserror::Error;

/// Failures reported by a [`JobStore`](crate::store::JobStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store refused to write a row, e.g. a constraint was violated.
    #[error("validation failed: {0}")]
    Validation(String),
    /// The underlying storage engine failed.
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(error: rusqlite::Error) -> Self {
        match error {
            rusqlite::Error::SqliteFailure(code, message)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Self::Validation(
                    message.unwrap_or_else(|| code.to_string()),
                )
            },
            other => Self::Backend(other.to_string()),
        }
    }
}

/// Errors surfaced by [`Queue`](crate::Queue) and [`Job`](crate::Job).
///
/// "Nothing matched" is never an error: lookups return `Ok(None)` instead.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The store rejected a new job.
    #[error("job rejected by store: {0}")]
    Validation(String),
    /// The operation isn't allowed in the job's current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    /// Mutation of a read-only value was attempted.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
    /// A payload couldn't be encoded or decoded.
    #[error("payload serialisation failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}
