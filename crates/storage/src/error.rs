use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Corrupt stored {field}: {message}")]
    Corrupt { field: &'static str, message: String },
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Batch-level failure. Row-level failures are counted, not returned.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("Store unavailable at batch start: {0}")]
    Unavailable(#[source] StoreError),
}
