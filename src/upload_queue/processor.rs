//! Background loop that drives upload jobs to a terminal state.
//!
//! The processor:
//! 1. Dispatches every due job whose constraints hold, up to `num_workers` at once
//! 2. Runs each attempt in its own task, cancellable through a per-job token
//! 3. Routes the outcome through the retry policy
//! 4. Sleeps until the next retry gate, a connectivity change, a queue command, or shutdown

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::executor::UploadExecutor;
use super::models::{DriveRecord, JobEvent, JobState, UploadOutcome};
use super::queue::{QueueCommand, QueueShared};
use super::retry_policy::{RetryDecision, RetryPolicy};

/// How long shutdown waits for each interrupted attempt task to exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Failure reason recorded for an attempt that panicked instead of reporting.
const PANICKED_ATTEMPT_REASON: &str = "attempt task panicked";

pub struct QueueProcessor {
    shared: Arc<QueueShared>,
    executor: Arc<dyn UploadExecutor>,
    policy: RetryPolicy,
    connectivity: watch::Receiver<bool>,
    commands: mpsc::UnboundedReceiver<QueueCommand>,
    workers: Arc<Semaphore>,
    shutdown: CancellationToken,
    running_handles: HashMap<String, JoinHandle<()>>,
}

impl QueueProcessor {
    pub(crate) fn new(
        shared: Arc<QueueShared>,
        executor: Arc<dyn UploadExecutor>,
        connectivity: watch::Receiver<bool>,
        commands: mpsc::UnboundedReceiver<QueueCommand>,
        shutdown: CancellationToken,
    ) -> Self {
        let policy = RetryPolicy::new(&shared.settings);
        let workers = Arc::new(Semaphore::new(shared.settings.num_workers.max(1)));
        Self {
            shared,
            executor,
            policy,
            connectivity,
            commands,
            workers,
            shutdown,
            running_handles: HashMap::new(),
        }
    }

    /// Run until the shutdown token is cancelled.
    ///
    /// Attempts still in flight at shutdown are interrupted. They count as
    /// neither success nor failure, and the stored job is left as it was so
    /// the next start picks it up again.
    pub async fn run(mut self) {
        info!(
            "Upload queue processor started ({} workers, {} jobs loaded)",
            self.shared.settings.num_workers.max(1),
            self.shared.lock_state().jobs.len()
        );

        let mut connectivity_open = true;

        loop {
            self.cleanup_finished_attempts().await;

            if self.shutdown.is_cancelled() {
                break;
            }

            self.dispatch_due_jobs();

            let sleep_duration = self.time_until_next_retry();
            debug!("Upload queue sleeping for {:?}", sleep_duration);

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Upload queue processor received shutdown signal");
                    break;
                }
                Some(command) = self.commands.recv() => match command {
                    QueueCommand::JobAdded(job_id) => {
                        debug!("Upload queue woken: job {} added", job_id);
                    }
                    QueueCommand::AttemptFinished(job_id) => {
                        debug!("Upload queue woken: attempt for job {} finished", job_id);
                    }
                },
                changed = self.connectivity.changed(), if connectivity_open => {
                    match changed {
                        Ok(()) => {
                            let connected = *self.connectivity.borrow_and_update();
                            info!("Connectivity changed: connected={}", connected);
                        }
                        Err(_) => {
                            warn!("Connectivity signal dropped, keeping last known value");
                            connectivity_open = false;
                        }
                    }
                }
                _ = tokio::time::sleep(sleep_duration) => {}
            }
        }

        self.shutdown_attempts().await;
        info!("Upload queue processor stopped");
    }

    fn is_connected(&self) -> bool {
        *self.connectivity.borrow()
    }

    /// Start an attempt for every due job, oldest gate first, while workers are free.
    fn dispatch_due_jobs(&mut self) {
        let now = Utc::now();
        let connected = self.is_connected();

        let mut guard = self.shared.lock_state();
        let state = &mut *guard;

        let mut due: Vec<(DateTime<Utc>, String)> = state
            .jobs
            .values()
            .filter(|job| job.is_due(now) && !state.in_flight.contains_key(&job.job_id))
            .filter(|job| connected || !job.constraints.requires_network)
            .map(|job| {
                (
                    job.scheduled_not_before.unwrap_or(job.created_at),
                    job.job_id.clone(),
                )
            })
            .collect();
        due.sort();

        for (_, job_id) in due {
            let permit = match Arc::clone(&self.workers).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    debug!("All upload workers busy, deferring remaining jobs");
                    break;
                }
            };
            let Some(job) = state.jobs.get_mut(&job_id) else {
                continue;
            };

            job.state = JobState::Running;
            job.updated_at = now;
            let attempt = job.attempt_count.saturating_add(1);
            let record = job.payload.clone();

            let token = self.shutdown.child_token();
            state.in_flight.insert(job_id.clone(), token.clone());

            info!(
                "Starting upload attempt {} for job {} (session {})",
                attempt,
                job_id,
                record.session_id()
            );
            self.shared.emit(JobEvent::AttemptStarted {
                job_id: job_id.clone(),
                attempt,
            });

            let handle = tokio::spawn(run_attempt(
                Arc::clone(&self.shared),
                Arc::clone(&self.executor),
                self.policy.clone(),
                job_id.clone(),
                record,
                token,
                permit,
            ));
            self.running_handles.insert(job_id, handle);
        }
    }

    /// Time until the earliest future retry gate, bounded by the idle poll interval.
    fn time_until_next_retry(&self) -> Duration {
        let now = Utc::now();
        let idle = self.shared.settings.idle_poll_interval;

        let state = self.shared.lock_state();
        state
            .jobs
            .values()
            .filter(|job| matches!(job.state, JobState::Pending | JobState::Retrying))
            .filter_map(|job| job.scheduled_not_before)
            .filter(|at| *at > now)
            .filter_map(|at| (at - now).to_std().ok())
            .min()
            .map_or(idle, |until| until.min(idle))
    }

    async fn cleanup_finished_attempts(&mut self) {
        let finished: Vec<String> = self
            .running_handles
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(job_id, _)| job_id.clone())
            .collect();

        for job_id in finished {
            if let Some(handle) = self.running_handles.remove(&job_id) {
                if let Err(e) = handle.await {
                    error!("Upload attempt task for job {} panicked: {}", job_id, e);
                    record_panicked_attempt(&self.shared, &self.policy, &job_id);
                }
            }
        }
    }

    async fn shutdown_attempts(&mut self) {
        if self.running_handles.is_empty() {
            return;
        }
        info!(
            "Interrupting {} in-flight upload attempts",
            self.running_handles.len()
        );

        // Attempt tokens are children of the shutdown token and are already cancelled
        for (job_id, handle) in self.running_handles.drain() {
            if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
                warn!("Upload attempt for job {} did not stop in time", job_id);
            }
        }
    }
}

async fn run_attempt(
    shared: Arc<QueueShared>,
    executor: Arc<dyn UploadExecutor>,
    policy: RetryPolicy,
    job_id: String,
    record: DriveRecord,
    token: CancellationToken,
    permit: OwnedSemaphorePermit,
) {
    // A panicking executor must still count as an attempt
    let attempt = tokio::spawn(async move { executor.attempt(&record).await });
    let abort = attempt.abort_handle();
    let outcome = tokio::select! {
        biased;
        _ = token.cancelled() => {
            abort.abort();
            None
        }
        joined = attempt => Some(match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Upload executor for job {} failed: {}", job_id, e);
                UploadOutcome::TransientFailure(PANICKED_ATTEMPT_REASON.to_string())
            }
        }),
    };
    drop(permit);

    finish_attempt(&shared, &policy, &job_id, outcome);
    shared.wake(QueueCommand::AttemptFinished(job_id));
}

/// Apply the result of one attempt. `None` means the attempt was interrupted.
fn finish_attempt(
    shared: &QueueShared,
    policy: &RetryPolicy,
    job_id: &str,
    outcome: Option<UploadOutcome>,
) {
    let mut guard = shared.lock_state();
    let state = &mut *guard;
    state.in_flight.remove(job_id);

    let Some(job) = state.jobs.get_mut(job_id) else {
        warn!("Upload attempt finished for unknown job {}", job_id);
        return;
    };
    let session_id = job.payload.session_id().to_string();

    // Cancelled by the caller: the stored row is already gone
    if job.state == JobState::Cancelled {
        state.jobs.remove(job_id);
        info!("Cancelled upload job {} (session {})", job_id, session_id);
        shared.emit(JobEvent::Cancelled {
            job_id: job_id.to_string(),
            session_id,
        });
        return;
    }

    let Some(outcome) = outcome else {
        job.state = job.idle_state();
        debug!(
            "Upload attempt for job {} interrupted, back to {}",
            job_id, job.state
        );
        return;
    };

    let now = Utc::now();
    job.attempt_count = job.attempt_count.saturating_add(1);
    job.updated_at = now;
    let attempt_count = job.attempt_count;

    let reason = match outcome.failure_reason() {
        None => {
            if let Err(e) = shared.store.delete_job(job_id) {
                error!("Failed to purge delivered upload job {}: {:#}", job_id, e);
            }
            state.jobs.remove(job_id);
            info!(
                "Upload job {} (session {}) delivered after {} attempts",
                job_id, session_id, attempt_count
            );
            shared.emit(JobEvent::Succeeded {
                job_id: job_id.to_string(),
                session_id,
                attempt_count,
            });
            return;
        }
        Some(reason) => reason.to_string(),
    };
    job.last_error = Some(reason.clone());

    match policy.decide(attempt_count, &outcome) {
        RetryDecision::RetryAfter(delay) => {
            job.state = JobState::Retrying;
            job.scheduled_not_before = Some(
                chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|delta| now.checked_add_signed(delta))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC),
            );
            if let Err(e) = shared.store.save_job(job) {
                error!("Failed to persist retry state of upload job {}: {:#}", job_id, e);
            }
            warn!(
                "Upload job {} attempt {} failed ({}), retrying in {:?}",
                job_id, attempt_count, reason, delay
            );
            shared.emit(JobEvent::RetryScheduled {
                job_id: job_id.to_string(),
                attempt_count,
                delay,
                reason,
            });
        }
        RetryDecision::GiveUp => {
            if let Err(e) = shared.store.delete_job(job_id) {
                error!("Failed to purge failed upload job {}: {:#}", job_id, e);
            }
            state.jobs.remove(job_id);
            warn!(
                "Upload job {} (session {}) failed after {} attempts: {}",
                job_id, session_id, attempt_count, reason
            );
            shared.emit(JobEvent::Failed {
                job_id: job_id.to_string(),
                session_id,
                attempt_count,
                reason,
            });
        }
    }
}

/// Count an attempt whose task died before reporting as a transient failure,
/// so `max_attempts` still bounds the job.
fn record_panicked_attempt(shared: &QueueShared, policy: &RetryPolicy, job_id: &str) {
    let never_reported = shared.lock_state().in_flight.contains_key(job_id);
    if never_reported {
        finish_attempt(
            shared,
            policy,
            job_id,
            Some(UploadOutcome::TransientFailure(
                PANICKED_ATTEMPT_REASON.to_string(),
            )),
        );
    }
}
