//! Common test infrastructure
//!
//! Tests should only import from this module, not from internal submodules.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{drive_record, TestQueue};
//!
//! #[tokio::test]
//! async fn test_delivers() {
//!     let queue = TestQueue::spawn_delivering().await;
//!     let job_id = queue.queue.enqueue(drive_record("s1")).unwrap();
//!     queue.wait_for_terminal(&job_id).await;
//! }
//! ```

mod constants;
mod fixtures;

pub use constants::*;
pub use fixtures::{drive_record, fast_settings, TestQueue};
