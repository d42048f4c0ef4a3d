//! Data models for the upload queue.
//!
//! Defines drive records, jobs, job states, attempt outcomes and job events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::QueueError;

/// One completed trip waiting to be delivered.
///
/// Immutable once built; retries re-read the same record. Deserializing goes
/// through [`DriveRecordBuilder::build`], so stored payloads are validated too.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "DriveRecordBuilder")]
pub struct DriveRecord {
    session_id: String,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
    user_id: String,
    history_storage_path: String,
    drive_mode: String,
    app_version: String,
    app_mode: String,
    nav_sdk_version: String,
    nav_native_sdk_version: String,
    app_session_id: String,
}

impl DriveRecord {
    pub fn builder() -> DriveRecordBuilder {
        DriveRecordBuilder::default()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn ended_at(&self) -> DateTime<Utc> {
        self.ended_at
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Opaque reference to the local recording artifact.
    pub fn history_storage_path(&self) -> &str {
        &self.history_storage_path
    }

    pub fn drive_mode(&self) -> &str {
        &self.drive_mode
    }

    pub fn app_version(&self) -> &str {
        &self.app_version
    }

    pub fn app_mode(&self) -> &str {
        &self.app_mode
    }

    pub fn nav_sdk_version(&self) -> &str {
        &self.nav_sdk_version
    }

    pub fn nav_native_sdk_version(&self) -> &str {
        &self.nav_native_sdk_version
    }

    pub fn app_session_id(&self) -> &str {
        &self.app_session_id
    }
}

/// Builder for [`DriveRecord`]. Every field is required.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DriveRecordBuilder {
    session_id: Option<String>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    user_id: Option<String>,
    history_storage_path: Option<String>,
    drive_mode: Option<String>,
    app_version: Option<String>,
    app_mode: Option<String>,
    nav_sdk_version: Option<String>,
    nav_native_sdk_version: Option<String>,
    app_session_id: Option<String>,
}

impl DriveRecordBuilder {
    pub fn session_id(mut self, value: impl Into<String>) -> Self {
        self.session_id = Some(value.into());
        self
    }

    pub fn started_at(mut self, value: DateTime<Utc>) -> Self {
        self.started_at = Some(value);
        self
    }

    pub fn ended_at(mut self, value: DateTime<Utc>) -> Self {
        self.ended_at = Some(value);
        self
    }

    pub fn user_id(mut self, value: impl Into<String>) -> Self {
        self.user_id = Some(value.into());
        self
    }

    pub fn history_storage_path(mut self, value: impl Into<String>) -> Self {
        self.history_storage_path = Some(value.into());
        self
    }

    pub fn drive_mode(mut self, value: impl Into<String>) -> Self {
        self.drive_mode = Some(value.into());
        self
    }

    pub fn app_version(mut self, value: impl Into<String>) -> Self {
        self.app_version = Some(value.into());
        self
    }

    pub fn app_mode(mut self, value: impl Into<String>) -> Self {
        self.app_mode = Some(value.into());
        self
    }

    pub fn nav_sdk_version(mut self, value: impl Into<String>) -> Self {
        self.nav_sdk_version = Some(value.into());
        self
    }

    pub fn nav_native_sdk_version(mut self, value: impl Into<String>) -> Self {
        self.nav_native_sdk_version = Some(value.into());
        self
    }

    pub fn app_session_id(mut self, value: impl Into<String>) -> Self {
        self.app_session_id = Some(value.into());
        self
    }

    /// Validate and build the record.
    pub fn build(self) -> Result<DriveRecord, QueueError> {
        fn required(field: &str, value: Option<String>) -> Result<String, QueueError> {
            match value {
                Some(v) if !v.trim().is_empty() => Ok(v),
                _ => Err(QueueError::InvalidRecord(format!("{} is required", field))),
            }
        }

        let started_at = self
            .started_at
            .ok_or_else(|| QueueError::InvalidRecord("started_at is required".to_string()))?;
        let ended_at = self
            .ended_at
            .ok_or_else(|| QueueError::InvalidRecord("ended_at is required".to_string()))?;
        if ended_at < started_at {
            return Err(QueueError::InvalidRecord(format!(
                "ended_at ({}) is before started_at ({})",
                ended_at.to_rfc3339(),
                started_at.to_rfc3339()
            )));
        }

        Ok(DriveRecord {
            session_id: required("session_id", self.session_id)?,
            started_at,
            ended_at,
            user_id: required("user_id", self.user_id)?,
            history_storage_path: required("history_storage_path", self.history_storage_path)?,
            drive_mode: required("drive_mode", self.drive_mode)?,
            app_version: required("app_version", self.app_version)?,
            app_mode: required("app_mode", self.app_mode)?,
            nav_sdk_version: required("nav_sdk_version", self.nav_sdk_version)?,
            nav_native_sdk_version: required("nav_native_sdk_version", self.nav_native_sdk_version)?,
            app_session_id: required("app_session_id", self.app_session_id)?,
        })
    }
}

impl TryFrom<DriveRecordBuilder> for DriveRecord {
    type Error = QueueError;

    fn try_from(builder: DriveRecordBuilder) -> Result<Self, Self::Error> {
        builder.build()
    }
}

/// State of an upload job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Running,
    Retrying,
    Succeeded, // terminal
    Failed,    // terminal
    Cancelled, // terminal
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn as_db_str(&self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Retrying => "RETRYING",
            JobState::Succeeded => "SUCCEEDED",
            JobState::Failed => "FAILED",
            JobState::Cancelled => "CANCELLED",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(JobState::Pending),
            "RUNNING" => Some(JobState::Running),
            "RETRYING" => Some(JobState::Retrying),
            "SUCCEEDED" => Some(JobState::Succeeded),
            "FAILED" => Some(JobState::Failed),
            "CANCELLED" => Some(JobState::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

/// Preconditions that must hold before an attempt is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConstraints {
    pub requires_network: bool,
}

impl Default for JobConstraints {
    fn default() -> Self {
        Self {
            requires_network: true,
        }
    }
}

/// The durable unit of work wrapping one [`DriveRecord`].
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub job_id: String,
    pub payload: DriveRecord,
    /// Completed attempts so far.
    pub attempt_count: u32,
    pub state: JobState,
    pub constraints: JobConstraints,
    /// No attempt is made before this instant. `None` means right away.
    pub scheduled_not_before: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Reason reported by the last failed attempt.
    pub last_error: Option<String>,
}

impl Job {
    pub fn new(job_id: String, payload: DriveRecord, constraints: JobConstraints) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            payload,
            attempt_count: 0,
            state: JobState::Pending,
            constraints,
            scheduled_not_before: None,
            created_at: now,
            updated_at: now,
            last_error: None,
        }
    }

    /// True if the job is waiting for dispatch and its time gate has passed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, JobState::Pending | JobState::Retrying)
            && self.scheduled_not_before.map_or(true, |at| at <= now)
    }

    /// The state a job falls back to when an attempt is abandoned without an outcome.
    pub fn idle_state(&self) -> JobState {
        if self.attempt_count == 0 {
            JobState::Pending
        } else {
            JobState::Retrying
        }
    }
}

/// Result of a single delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Delivered,
    /// Network blip, remote 5xx, timeout. Retryable.
    TransientFailure(String),
    /// Remote rejected the payload. Never retried.
    PermanentFailure(String),
}

impl UploadOutcome {
    pub fn failure_reason(&self) -> Option<&str> {
        match self {
            UploadOutcome::Delivered => None,
            UploadOutcome::TransientFailure(reason) | UploadOutcome::PermanentFailure(reason) => {
                Some(reason)
            }
        }
    }
}

/// Notifications published to queue observers.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Enqueued {
        job_id: String,
        session_id: String,
    },
    AttemptStarted {
        job_id: String,
        /// 1-based number of the attempt being made.
        attempt: u32,
    },
    RetryScheduled {
        job_id: String,
        attempt_count: u32,
        delay: Duration,
        reason: String,
    },
    Succeeded {
        job_id: String,
        session_id: String,
        attempt_count: u32,
    },
    Failed {
        job_id: String,
        session_id: String,
        attempt_count: u32,
        reason: String,
    },
    Cancelled {
        job_id: String,
        session_id: String,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::Enqueued { job_id, .. }
            | JobEvent::AttemptStarted { job_id, .. }
            | JobEvent::RetryScheduled { job_id, .. }
            | JobEvent::Succeeded { job_id, .. }
            | JobEvent::Failed { job_id, .. }
            | JobEvent::Cancelled { job_id, .. } => job_id,
        }
    }

    /// True for events after which the job no longer exists.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobEvent::Succeeded { .. } | JobEvent::Failed { .. } | JobEvent::Cancelled { .. }
        )
    }
}

/// Point-in-time view of a job for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub job_id: String,
    pub session_id: String,
    pub state: JobState,
    pub attempt_count: u32,
    pub requires_network: bool,
    pub scheduled_not_before: Option<String>,
    pub created_at: String,
    pub last_error: Option<String>,
}

impl From<&Job> for JobInfo {
    fn from(job: &Job) -> Self {
        JobInfo {
            job_id: job.job_id.clone(),
            session_id: job.payload.session_id().to_string(),
            state: job.state,
            attempt_count: job.attempt_count,
            requires_network: job.constraints.requires_network,
            scheduled_not_before: job.scheduled_not_before.map(|at| at.to_rfc3339()),
            created_at: job.created_at.to_rfc3339(),
            last_error: job.last_error.clone(),
        }
    }
}
