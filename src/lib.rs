//! Drive Uploader Library
//!
//! Durable, constraint-gated background delivery of recorded drive sessions.
//! A host application builds a [`DriveRecord`], hands it to an [`UploadQueue`],
//! and the queue persists it, waits for connectivity, and drives it through an
//! [`UploadExecutor`] and a [`RetryPolicy`] until a terminal outcome.

pub mod config;
pub mod logging;
pub mod sqlite_persistence;
pub mod upload_queue;

// Re-export commonly used types for convenience
pub use config::{FileConfig, UploadQueueSettings, UploaderConfig};
pub use upload_queue::{
    create_upload_queue, ConnectivitySignal, DriveRecord, Job, JobEvent, JobInfo, JobState,
    JobStore, QueueError, QueueProcessor, RetryDecision, RetryPolicy, SqliteJobStore,
    UploadExecutor, UploadOutcome, UploadQueue,
};
