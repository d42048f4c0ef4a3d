//! The network-facing side of the queue.
//!
//! The embedding application supplies the transport by implementing
//! [`UploadExecutor`]; the queue owns retries and scheduling.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use super::models::{DriveRecord, UploadOutcome};

/// Performs a single delivery attempt.
///
/// One call is one attempt; implementations must not retry internally.
/// Re-delivering an already delivered drive must be harmless on the remote side.
/// The queue cancels an attempt by dropping its future, so implementations
/// should not rely on running to completion.
#[async_trait]
pub trait UploadExecutor: Send + Sync {
    async fn attempt(&self, record: &DriveRecord) -> UploadOutcome;
}

/// Executor that replays a scripted list of outcomes.
///
/// Once the script runs out every further attempt reports `fallback`.
/// Useful for hosts that want to wire the queue before a transport exists, and in tests.
pub struct ScriptedExecutor {
    script: Mutex<VecDeque<UploadOutcome>>,
    fallback: UploadOutcome,
    latency: Duration,
    attempts: AtomicUsize,
    seen_sessions: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new(script: Vec<UploadOutcome>, fallback: UploadOutcome) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            latency: Duration::ZERO,
            attempts: AtomicUsize::new(0),
            seen_sessions: Mutex::new(Vec::new()),
        }
    }

    /// Executor that delivers every attempt.
    pub fn always_delivered() -> Self {
        Self::new(Vec::new(), UploadOutcome::Delivered)
    }

    /// Executor that fails every attempt with the given outcome.
    pub fn always(outcome: UploadOutcome) -> Self {
        Self::new(Vec::new(), outcome)
    }

    /// Make every attempt take `latency` before reporting.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Number of attempts started so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Session ids in the order they were attempted.
    pub fn seen_sessions(&self) -> Vec<String> {
        self.seen_sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl UploadExecutor for ScriptedExecutor {
    async fn attempt(&self, record: &DriveRecord) -> UploadOutcome {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.seen_sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.session_id().to_string());

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}
