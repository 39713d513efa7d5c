use thiserror::Error;

use crate::ports::{QueueError, StoreError};
use crate::services::{ProcessingError, RelayError};
use crate::use_cases::ingest_batch::IngestError;

/// Top-level error for the binary surface.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Processing error: {0}")]
    Processing(#[from] ProcessingError),

    #[error("Ingestion error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl AppError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Store(e) => is_transient_store(e),
            AppError::Queue(QueueError::Redis(e)) => {
                e.is_io_error() || e.is_timeout() || e.is_connection_dropped()
            }
            AppError::Queue(_) => false,
            AppError::Relay(RelayError::Fetch(e)) => is_transient_store(e),
            AppError::Relay(RelayError::MarkPublished { source, .. }) => is_transient_store(source),
            AppError::Processing(e) => e.is_conflict(),
            AppError::Ingest(_) | AppError::NotFound(_) => false,
        }
    }
}

fn is_transient_store(e: &StoreError) -> bool {
    match e {
        StoreError::Conflict(_) => true,
        StoreError::Database(sqlx::Error::Io(_))
        | StoreError::Database(sqlx::Error::PoolTimedOut)
        | StoreError::Database(sqlx::Error::PoolClosed) => true,
        _ => false,
    }
}
