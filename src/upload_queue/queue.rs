//! Caller-facing handle of the upload queue.
//!
//! [`UploadQueue`] and the [`QueueProcessor`] share one in-memory job set, the
//! job store behind it, and the event channel. Every mutation of a job happens
//! while holding the state lock, and the store write for that mutation happens
//! inside the same critical section, so the in-memory view and the store never
//! disagree about a job for longer than a single store call.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::connectivity::ConnectivitySignal;
use super::error::QueueError;
use super::executor::UploadExecutor;
use super::job_store::JobStore;
use super::models::{DriveRecord, Job, JobConstraints, JobEvent, JobInfo, JobState};
use super::processor::QueueProcessor;
use crate::config::UploadQueueSettings;

/// How many cancelled job ids are remembered so a repeated `cancel` stays a no-op.
const CANCELLED_MEMORY: usize = 256;

/// Wake-up reasons sent to the processor loop.
#[derive(Debug)]
pub(crate) enum QueueCommand {
    JobAdded(String),
    AttemptFinished(String),
}

#[derive(Default)]
pub(crate) struct QueueState {
    /// Live jobs. A job cancelled mid-attempt stays here as `Cancelled` until its attempt task exits.
    pub jobs: HashMap<String, Job>,
    /// Cancellation handle of every attempt currently in flight.
    pub in_flight: HashMap<String, CancellationToken>,
    pub cancelled: VecDeque<String>,
}

impl QueueState {
    pub(crate) fn remember_cancelled(&mut self, job_id: &str) {
        if self.cancelled.len() >= CANCELLED_MEMORY {
            self.cancelled.pop_front();
        }
        self.cancelled.push_back(job_id.to_string());
    }
}

pub(crate) struct QueueShared {
    pub state: Mutex<QueueState>,
    pub store: Arc<dyn JobStore>,
    pub events: broadcast::Sender<JobEvent>,
    pub commands: mpsc::UnboundedSender<QueueCommand>,
    pub settings: UploadQueueSettings,
}

impl QueueShared {
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish an event. Having no subscribers is fine.
    pub(crate) fn emit(&self, event: JobEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn wake(&self, command: QueueCommand) {
        if self.commands.send(command).is_err() {
            debug!("Upload queue processor is gone, dropping wake-up");
        }
    }
}

/// Handle used by the host to enqueue drives and observe jobs.
///
/// Cheap to clone. All methods are synchronous and never wait on the network.
#[derive(Clone)]
pub struct UploadQueue {
    shared: Arc<QueueShared>,
}

impl UploadQueue {
    /// Persist a new upload job for `record` and return its id.
    ///
    /// If a live job already wraps the same session, its id is returned and
    /// nothing new is created.
    pub fn enqueue(&self, record: DriveRecord) -> Result<String, QueueError> {
        let mut state = self.shared.lock_state();

        if let Some(existing) = state
            .jobs
            .values()
            .find(|job| !job.state.is_terminal() && job.payload.session_id() == record.session_id())
        {
            debug!(
                "Session {} already has upload job {}, keeping it",
                record.session_id(),
                existing.job_id
            );
            return Ok(existing.job_id.clone());
        }

        let job = Job::new(
            Uuid::new_v4().to_string(),
            record,
            JobConstraints {
                requires_network: self.shared.settings.require_network,
            },
        );

        self.shared.store.save_job(&job).map_err(|e| {
            error!(
                "Failed to persist upload job for session {}: {:#}",
                job.payload.session_id(),
                e
            );
            QueueError::storage(e)
        })?;

        let job_id = job.job_id.clone();
        let session_id = job.payload.session_id().to_string();
        state.jobs.insert(job_id.clone(), job);

        info!("Enqueued upload job {} for session {}", job_id, session_id);
        self.shared.emit(JobEvent::Enqueued {
            job_id: job_id.clone(),
            session_id,
        });
        drop(state);

        self.shared.wake(QueueCommand::JobAdded(job_id.clone()));
        Ok(job_id)
    }

    /// Cancel a job.
    ///
    /// A job with no attempt in flight is removed at once. An in-flight attempt
    /// is interrupted and the job is removed when the attempt task exits; it is
    /// never retried. Cancelling an already cancelled job is a no-op.
    pub fn cancel(&self, job_id: &str) -> Result<(), QueueError> {
        let mut guard = self.shared.lock_state();
        let state = &mut *guard;

        if state.cancelled.iter().any(|id| id == job_id) {
            debug!("Upload job {} already cancelled", job_id);
            return Ok(());
        }

        let Some(job) = state.jobs.get_mut(job_id) else {
            return Err(QueueError::NotFound(job_id.to_string()));
        };

        self.shared.store.delete_job(job_id).map_err(|e| {
            error!("Failed to delete cancelled upload job {}: {:#}", job_id, e);
            QueueError::storage(e)
        })?;

        match state.in_flight.get(job_id) {
            Some(token) => {
                info!("Cancelling in-flight upload job {}", job_id);
                job.state = JobState::Cancelled;
                token.cancel();
            }
            None => {
                let session_id = job.payload.session_id().to_string();
                state.jobs.remove(job_id);
                info!("Cancelled upload job {} (session {})", job_id, session_id);
                self.shared.emit(JobEvent::Cancelled {
                    job_id: job_id.to_string(),
                    session_id,
                });
            }
        }
        state.remember_cancelled(job_id);
        Ok(())
    }

    /// Current state of a live job.
    ///
    /// Jobs that reached a terminal state are purged and report `NotFound`.
    pub fn status(&self, job_id: &str) -> Result<JobState, QueueError> {
        self.shared
            .lock_state()
            .jobs
            .get(job_id)
            .map(|job| job.state)
            .ok_or_else(|| QueueError::NotFound(job_id.to_string()))
    }

    pub fn job_info(&self, job_id: &str) -> Result<JobInfo, QueueError> {
        self.shared
            .lock_state()
            .jobs
            .get(job_id)
            .map(JobInfo::from)
            .ok_or_else(|| QueueError::NotFound(job_id.to_string()))
    }

    /// Snapshot of every live job, oldest first.
    pub fn list_jobs(&self) -> Vec<JobInfo> {
        let state = self.shared.lock_state();
        let mut jobs: Vec<&Job> = state.jobs.values().collect();
        jobs.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        jobs.into_iter().map(JobInfo::from).collect()
    }

    /// Observe job events. Only events sent after subscribing are received.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.shared.events.subscribe()
    }
}

/// Build an upload queue over `store`.
///
/// Every `Pending` or `Retrying` job found in the store is loaded before this
/// returns, so recovered jobs are visible through the handle right away. They
/// run once the returned processor is started.
pub fn create_upload_queue(
    store: Arc<dyn JobStore>,
    executor: Arc<dyn UploadExecutor>,
    connectivity: &ConnectivitySignal,
    settings: UploadQueueSettings,
    shutdown: CancellationToken,
) -> Result<(QueueProcessor, UploadQueue), QueueError> {
    let recovered = store.load_all_pending_or_retrying().map_err(|e| {
        error!("Failed to load upload jobs from storage: {:#}", e);
        QueueError::storage(e)
    })?;

    let mut state = QueueState::default();
    for job in recovered {
        debug!(
            "Recovered upload job {} ({}, {} attempts so far)",
            job.job_id, job.state, job.attempt_count
        );
        state.jobs.insert(job.job_id.clone(), job);
    }
    if !state.jobs.is_empty() {
        info!("Recovered {} upload jobs from storage", state.jobs.len());
    }

    if settings.event_capacity == 0 {
        warn!("event_capacity is 0, using 1");
    }
    let (events, _) = broadcast::channel(settings.event_capacity.max(1));
    let (commands, command_rx) = mpsc::unbounded_channel();

    let shared = Arc::new(QueueShared {
        state: Mutex::new(state),
        store,
        events,
        commands,
        settings,
    });

    let processor = QueueProcessor::new(
        Arc::clone(&shared),
        executor,
        connectivity.subscribe(),
        command_rx,
        shutdown,
    );
    let queue = UploadQueue { shared };

    Ok((processor, queue))
}
