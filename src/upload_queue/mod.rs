//! Upload queue module
//!
//! Durable queue that delivers drive records through a host-supplied executor,
//! retrying transient failures under a bounded policy and only while the
//! network constraint holds.

mod connectivity;
mod error;
mod executor;
mod job_store;
mod models;
mod processor;
mod queue;
mod retry_policy;
mod schema;

pub use connectivity::ConnectivitySignal;
pub use error::QueueError;
pub use executor::{ScriptedExecutor, UploadExecutor};
#[cfg(feature = "mock")]
pub use job_store::MockJobStore;
pub use job_store::{JobStore, SqliteJobStore};
pub use models::*;
pub use processor::QueueProcessor;
pub use queue::{create_upload_queue, UploadQueue};
pub use retry_policy::{BackoffKind, RetryDecision, RetryPolicy, UnknownBackoffKind};
pub use schema::UPLOAD_JOBS_VERSIONED_SCHEMAS;
