//! Database schema for upload_jobs.db.

use crate::sqlite_column;
use crate::sqlite_persistence::{SqlType, Table, VersionedSchema};

/// One row per live upload job. Terminal jobs are deleted, never stored.
const UPLOAD_JOBS_TABLE_V0: Table = Table {
    name: "upload_jobs",
    columns: &[
        sqlite_column!("job_id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("session_id", &SqlType::Text, non_null = true),
        // DriveRecord as JSON
        sqlite_column!("payload", &SqlType::Text, non_null = true),
        sqlite_column!("state", &SqlType::Text, non_null = true),
        sqlite_column!(
            "attempt_count",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!(
            "requires_network",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("1")
        ),
        sqlite_column!("scheduled_not_before", &SqlType::Integer),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!("updated_at", &SqlType::Integer, non_null = true),
        sqlite_column!("last_error", &SqlType::Text),
    ],
    indices: &[
        ("idx_upload_jobs_state", "state"),
        ("idx_upload_jobs_session", "session_id"),
    ],
};

pub const UPLOAD_JOBS_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[UPLOAD_JOBS_TABLE_V0],
    migration: None,
}];
