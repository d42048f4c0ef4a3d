use thiserror::Error;

/// Errors surfaced to callers of the upload queue.
///
/// Delivery failures are not errors; they travel as [`super::UploadOutcome`] values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Invalid drive record: {0}")]
    InvalidRecord(String),
}

impl QueueError {
    pub(crate) fn storage(err: anyhow::Error) -> Self {
        QueueError::Storage(format!("{:#}", err))
    }
}
