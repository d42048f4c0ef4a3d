//! Durable storage for upload jobs.
//!
//! Only live jobs are stored. A job row is written on enqueue and after every
//! failed attempt that will be retried, and deleted when the job reaches a
//! terminal state.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{error, info, warn};

use super::models::{DriveRecord, Job, JobConstraints, JobState};
use super::schema::UPLOAD_JOBS_VERSIONED_SCHEMAS;
use crate::sqlite_persistence::prepare_database;

/// Storage collaborator for the upload queue, keyed by job id.
#[cfg_attr(feature = "mock", mockall::automock)]
pub trait JobStore: Send + Sync {
    /// Insert the job or overwrite the stored copy with the same id.
    fn save_job(&self, job: &Job) -> Result<()>;

    /// Every stored job whose state is `Pending` or `Retrying`, oldest first.
    ///
    /// Rows that cannot be decoded into a valid job are dropped from storage.
    fn load_all_pending_or_retrying(&self) -> Result<Vec<Job>>;

    /// Remove a job. Deleting an id that is not stored is not an error.
    fn delete_job(&self, job_id: &str) -> Result<()>;

    fn get_job(&self, job_id: &str) -> Result<Option<Job>>;
}

/// SQLite-backed job store.
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStore {
    /// Open the database at `db_path`, creating or migrating the schema as needed.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(&db_path).with_context(|| {
            format!("Failed to open upload job database at {:?}", db_path.as_ref())
        })?;
        prepare_database(&conn, UPLOAD_JOBS_VERSIONED_SCHEMAS, "upload jobs")?;
        info!("Opened upload job database at {:?}", db_path.as_ref());

        Ok(SqliteJobStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Store that lives as long as the process. Jobs do not survive a restart.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        prepare_database(&conn, UPLOAD_JOBS_VERSIONED_SCHEMAS, "upload jobs")?;

        Ok(SqliteJobStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn row_to_stored_job(row: &rusqlite::Row) -> rusqlite::Result<StoredJob> {
        Ok(StoredJob {
            job_id: row.get("job_id")?,
            payload: row.get("payload")?,
            state: row.get("state")?,
            attempt_count: row.get("attempt_count")?,
            requires_network: row.get("requires_network")?,
            scheduled_not_before: row.get("scheduled_not_before")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            last_error: row.get("last_error")?,
        })
    }
}

/// A row as read from `upload_jobs`, before the payload is decoded.
struct StoredJob {
    job_id: String,
    payload: String,
    state: String,
    attempt_count: u32,
    requires_network: bool,
    scheduled_not_before: Option<i64>,
    created_at: i64,
    updated_at: i64,
    last_error: Option<String>,
}

impl StoredJob {
    fn into_job(self) -> Result<Job> {
        let payload: DriveRecord = serde_json::from_str(&self.payload)
            .with_context(|| format!("Corrupt payload for job {}", self.job_id))?;
        let state = JobState::from_db_str(&self.state)
            .ok_or_else(|| anyhow!("Unknown state {:?} for job {}", self.state, self.job_id))?;

        Ok(Job {
            payload,
            attempt_count: self.attempt_count,
            state,
            constraints: JobConstraints {
                requires_network: self.requires_network,
            },
            scheduled_not_before: self.scheduled_not_before.map(from_millis).transpose()?,
            created_at: from_millis(self.created_at)?,
            updated_at: from_millis(self.updated_at)?,
            last_error: self.last_error,
            job_id: self.job_id,
        })
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow!("Timestamp out of range: {}", ms))
}

impl JobStore for SqliteJobStore {
    fn save_job(&self, job: &Job) -> Result<()> {
        let payload = serde_json::to_string(&job.payload)
            .with_context(|| format!("Failed to serialize payload for job {}", job.job_id))?;

        let conn = self.lock();
        conn.execute(
            r#"INSERT INTO upload_jobs (
                job_id, session_id, payload, state, attempt_count, requires_network,
                scheduled_not_before, created_at, updated_at, last_error
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(job_id) DO UPDATE SET
                state = excluded.state,
                attempt_count = excluded.attempt_count,
                requires_network = excluded.requires_network,
                scheduled_not_before = excluded.scheduled_not_before,
                updated_at = excluded.updated_at,
                last_error = excluded.last_error"#,
            params![
                job.job_id,
                job.payload.session_id(),
                payload,
                job.state.as_db_str(),
                job.attempt_count,
                job.constraints.requires_network,
                job.scheduled_not_before.map(|at| at.timestamp_millis()),
                job.created_at.timestamp_millis(),
                job.updated_at.timestamp_millis(),
                job.last_error,
            ],
        )
        .with_context(|| format!("Failed to save job {}", job.job_id))?;
        Ok(())
    }

    fn load_all_pending_or_retrying(&self) -> Result<Vec<Job>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            r#"SELECT * FROM upload_jobs
               WHERE state IN ('PENDING', 'RETRYING')
               ORDER BY created_at ASC"#,
        )?;
        let rows = stmt
            .query_map([], Self::row_to_stored_job)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to load upload jobs")?;

        let mut jobs = Vec::with_capacity(rows.len());
        let mut unreadable = Vec::new();
        for row in rows {
            let job_id = row.job_id.clone();
            match row.into_job() {
                Ok(job) => jobs.push(job),
                // One unreadable row must not block recovery of the rest
                Err(e) => {
                    warn!("Dropping unreadable upload job {}: {:#}", job_id, e);
                    unreadable.push(job_id);
                }
            }
        }

        for job_id in unreadable {
            if let Err(e) = conn.execute("DELETE FROM upload_jobs WHERE job_id = ?1", [&job_id]) {
                error!("Failed to drop unreadable upload job {}: {}", job_id, e);
            }
        }
        Ok(jobs)
    }

    fn delete_job(&self, job_id: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute("DELETE FROM upload_jobs WHERE job_id = ?1", [job_id])
            .with_context(|| format!("Failed to delete job {}", job_id))?;
        Ok(())
    }

    fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT * FROM upload_jobs WHERE job_id = ?1",
                [job_id],
                Self::row_to_stored_job,
            )
            .optional()
            .with_context(|| format!("Failed to read job {}", job_id))?;

        row.map(StoredJob::into_job).transpose()
    }
}
