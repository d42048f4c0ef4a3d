//! End-to-end tests for the upload queue
//!
//! Each test runs a real processor over a SQLite job store and a scripted executor.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{drive_record, fast_settings, TestQueue, TEST_TIMEOUT};
use drive_uploader::upload_queue::ScriptedExecutor;
use drive_uploader::{
    create_upload_queue, ConnectivitySignal, FileConfig, Job, JobEvent, JobState, JobStore,
    QueueError, SqliteJobStore, UploadOutcome, UploaderConfig,
};
use mockall::mock;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

mock! {
    pub Store {}

    impl JobStore for Store {
        fn save_job(&self, job: &Job) -> anyhow::Result<()>;
        fn load_all_pending_or_retrying(&self) -> anyhow::Result<Vec<Job>>;
        fn delete_job(&self, job_id: &str) -> anyhow::Result<()>;
        fn get_job(&self, job_id: &str) -> anyhow::Result<Option<Job>>;
    }
}

fn transient(reason: &str) -> UploadOutcome {
    UploadOutcome::TransientFailure(reason.to_string())
}

// ============================================================================
// Delivery and retry
// ============================================================================

#[tokio::test]
async fn test_session_delivered_on_third_attempt() {
    let mut tq =
        TestQueue::spawn_scripted(vec![transient("HTTP 503"), transient("timeout")]).await;

    let job_id = tq.queue.enqueue(drive_record("s1")).unwrap();

    assert_eq!(
        tq.wait_for_terminal(&job_id).await,
        JobEvent::Succeeded {
            job_id: job_id.clone(),
            session_id: "s1".to_string(),
            attempt_count: 3,
        }
    );
    assert_eq!(tq.executor.attempts(), 3);
    assert_eq!(tq.executor.seen_sessions(), vec!["s1", "s1", "s1"]);
}

#[tokio::test]
async fn test_always_transient_fails_after_max_attempts() {
    let mut tq = TestQueue::spawn(
        ScriptedExecutor::always(transient("HTTP 502")),
        Arc::new(SqliteJobStore::in_memory().unwrap()),
        true,
        fast_settings(),
    )
    .await;

    let job_id = tq.queue.enqueue(drive_record("s1")).unwrap();

    assert_eq!(
        tq.wait_for_terminal(&job_id).await,
        JobEvent::Failed {
            job_id: job_id.clone(),
            session_id: "s1".to_string(),
            attempt_count: 3,
            reason: "HTTP 502".to_string(),
        }
    );

    // Give the processor a chance to misbehave before counting attempts
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(tq.executor.attempts(), 3);
    assert!(tq.store.get_job(&job_id).unwrap().is_none());
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let mut tq = TestQueue::spawn_scripted(vec![UploadOutcome::PermanentFailure(
        "HTTP 401".to_string(),
    )])
    .await;

    let job_id = tq.queue.enqueue(drive_record("s1")).unwrap();

    match tq.wait_for_terminal(&job_id).await {
        JobEvent::Failed {
            attempt_count,
            reason,
            ..
        } => {
            assert_eq!(attempt_count, 1);
            assert_eq!(reason, "HTTP 401");
        }
        other => panic!("expected Failed, got {:?}", other),
    }
    assert_eq!(tq.executor.attempts(), 1);
}

#[tokio::test]
async fn test_retry_events_in_order() {
    let mut tq = TestQueue::spawn_scripted(vec![transient("HTTP 503")]).await;
    let job_id = tq.queue.enqueue(drive_record("s1")).unwrap();

    let mut seen = Vec::new();
    tokio::time::timeout(TEST_TIMEOUT, async {
        loop {
            let event = tq.events.recv().await.unwrap();
            let terminal = event.is_terminal();
            seen.push(event);
            if terminal {
                break;
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(
        seen,
        vec![
            JobEvent::Enqueued {
                job_id: job_id.clone(),
                session_id: "s1".to_string(),
            },
            JobEvent::AttemptStarted {
                job_id: job_id.clone(),
                attempt: 1,
            },
            JobEvent::RetryScheduled {
                job_id: job_id.clone(),
                attempt_count: 1,
                delay: Duration::from_millis(10),
                reason: "HTTP 503".to_string(),
            },
            JobEvent::AttemptStarted {
                job_id: job_id.clone(),
                attempt: 2,
            },
            JobEvent::Succeeded {
                job_id,
                session_id: "s1".to_string(),
                attempt_count: 2,
            },
        ]
    );
}

// ============================================================================
// Status
// ============================================================================

#[tokio::test]
async fn test_status_after_enqueue_is_pending_or_running() {
    let tq = TestQueue::spawn_delivering().await;
    let job_id = tq.queue.enqueue(drive_record("s1")).unwrap();

    // The job may already be gone if the attempt won the race
    match tq.queue.status(&job_id) {
        Ok(state) => assert!(matches!(state, JobState::Pending | JobState::Running)),
        Err(QueueError::NotFound(_)) => {}
        Err(e) => panic!("unexpected error: {}", e),
    }
}

#[tokio::test]
async fn test_status_not_found_after_success() {
    let mut tq = TestQueue::spawn_delivering().await;
    let job_id = tq.queue.enqueue(drive_record("s1")).unwrap();

    tq.wait_for_terminal(&job_id).await;

    assert_eq!(
        tq.queue.status(&job_id),
        Err(QueueError::NotFound(job_id.clone()))
    );
    assert!(tq.queue.list_jobs().is_empty());
}

#[tokio::test]
async fn test_job_info_while_waiting_for_network() {
    let tq = TestQueue::spawn(
        ScriptedExecutor::always_delivered(),
        Arc::new(SqliteJobStore::in_memory().unwrap()),
        false,
        fast_settings(),
    )
    .await;
    let job_id = tq.queue.enqueue(drive_record("s1")).unwrap();

    let info = tq.queue.job_info(&job_id).unwrap();
    assert_eq!(info.state, JobState::Pending);
    assert_eq!(info.attempt_count, 0);
    assert_eq!(info.session_id, "s1");
    assert!(info.requires_network);
    assert!(info.last_error.is_none());
}

// ============================================================================
// Connectivity
// ============================================================================

#[tokio::test]
async fn test_job_waits_for_connectivity() {
    let mut tq = TestQueue::spawn(
        ScriptedExecutor::always_delivered(),
        Arc::new(SqliteJobStore::in_memory().unwrap()),
        false,
        fast_settings(),
    )
    .await;

    let job_id = tq.queue.enqueue(drive_record("s1")).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(tq.queue.status(&job_id).unwrap(), JobState::Pending);
    assert_eq!(tq.executor.attempts(), 0);

    tq.connectivity.set_connected(true);

    assert!(matches!(
        tq.wait_for_terminal(&job_id).await,
        JobEvent::Succeeded { .. }
    ));
}

#[tokio::test]
async fn test_retry_waits_for_connectivity_to_return() {
    let settings = drive_uploader::UploadQueueSettings {
        initial_backoff: Duration::from_millis(150),
        max_backoff: Duration::from_millis(500),
        ..fast_settings()
    };
    let mut tq = TestQueue::spawn(
        ScriptedExecutor::new(vec![transient("no route to host")], UploadOutcome::Delivered),
        Arc::new(SqliteJobStore::in_memory().unwrap()),
        true,
        settings,
    )
    .await;

    let job_id = tq.queue.enqueue(drive_record("s1")).unwrap();
    tq.wait_for_attempts(1).await;
    tq.connectivity.set_connected(false);

    // Well past the retry gate
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(tq.queue.status(&job_id).unwrap(), JobState::Retrying);
    assert_eq!(tq.executor.attempts(), 1);

    tq.connectivity.set_connected(true);
    assert!(matches!(
        tq.wait_for_terminal(&job_id).await,
        JobEvent::Succeeded { attempt_count: 2, .. }
    ));
}

#[tokio::test]
async fn test_job_without_network_requirement_runs_offline() {
    let settings = drive_uploader::UploadQueueSettings {
        require_network: false,
        ..fast_settings()
    };
    let mut tq = TestQueue::spawn(
        ScriptedExecutor::always_delivered(),
        Arc::new(SqliteJobStore::in_memory().unwrap()),
        false,
        settings,
    )
    .await;

    let job_id = tq.queue.enqueue(drive_record("s1")).unwrap();
    assert!(matches!(
        tq.wait_for_terminal(&job_id).await,
        JobEvent::Succeeded { .. }
    ));
}

// ============================================================================
// Unique work per session
// ============================================================================

#[tokio::test]
async fn test_same_session_enqueued_twice_runs_once() {
    let mut tq = TestQueue::spawn(
        ScriptedExecutor::always_delivered(),
        Arc::new(SqliteJobStore::in_memory().unwrap()),
        false,
        fast_settings(),
    )
    .await;

    let first = tq.queue.enqueue(drive_record("s1")).unwrap();
    let second = tq.queue.enqueue(drive_record("s1")).unwrap();
    assert_eq!(first, second);

    tq.connectivity.set_connected(true);
    tq.wait_for_terminal(&first).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(tq.executor.attempts(), 1);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancel_pending_job_twice() {
    let mut tq = TestQueue::spawn(
        ScriptedExecutor::always_delivered(),
        Arc::new(SqliteJobStore::in_memory().unwrap()),
        false,
        fast_settings(),
    )
    .await;
    let job_id = tq.queue.enqueue(drive_record("s1")).unwrap();

    tq.queue.cancel(&job_id).unwrap();
    tq.queue.cancel(&job_id).unwrap();

    assert!(matches!(
        tq.wait_for_terminal(&job_id).await,
        JobEvent::Cancelled { .. }
    ));
    assert!(matches!(
        tq.queue.status(&job_id),
        Err(QueueError::NotFound(_))
    ));

    // Coming back online must not resurrect it
    tq.connectivity.set_connected(true);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(tq.executor.attempts(), 0);
    assert!(tq.store.load_all_pending_or_retrying().unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_in_flight_attempt() {
    let mut tq = TestQueue::spawn(
        ScriptedExecutor::always_delivered().with_latency(Duration::from_secs(60)),
        Arc::new(SqliteJobStore::in_memory().unwrap()),
        true,
        fast_settings(),
    )
    .await;
    let job_id = tq.queue.enqueue(drive_record("s1")).unwrap();
    tq.wait_for_attempts(1).await;
    assert_eq!(tq.queue.status(&job_id).unwrap(), JobState::Running);

    tq.queue.cancel(&job_id).unwrap();

    assert_eq!(
        tq.wait_for_terminal(&job_id).await,
        JobEvent::Cancelled {
            job_id: job_id.clone(),
            session_id: "s1".to_string(),
        }
    );
    tq.queue.cancel(&job_id).unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(tq.executor.attempts(), 1);
    assert!(tq.store.get_job(&job_id).unwrap().is_none());
}

#[tokio::test]
async fn test_cancel_unknown_job_is_not_found() {
    let tq = TestQueue::spawn_delivering().await;
    assert_eq!(
        tq.queue.cancel("does-not-exist"),
        Err(QueueError::NotFound("does-not-exist".to_string()))
    );
}

// ============================================================================
// Recovery
// ============================================================================

#[tokio::test]
async fn test_persisted_retrying_job_resumes_after_restart() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("upload_jobs.db");

    // A previous process left a job waiting for its second attempt
    {
        let store = SqliteJobStore::new(&db_path).unwrap();
        let mut job = Job::new(
            "job-from-last-run".to_string(),
            drive_record("s1"),
            Default::default(),
        );
        job.state = JobState::Retrying;
        job.attempt_count = 1;
        job.scheduled_not_before = Some(Utc::now() - chrono::Duration::seconds(1));
        job.last_error = Some("HTTP 503".to_string());
        store.save_job(&job).unwrap();
    }

    let mut tq = TestQueue::spawn_on_disk(&db_path, ScriptedExecutor::always_delivered()).await;

    assert_eq!(
        tq.wait_for_terminal("job-from-last-run").await,
        JobEvent::Succeeded {
            job_id: "job-from-last-run".to_string(),
            session_id: "s1".to_string(),
            attempt_count: 2,
        }
    );
    assert!(tq.store.load_all_pending_or_retrying().unwrap().is_empty());
}

#[tokio::test]
async fn test_interrupted_attempt_resumes_after_restart() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("upload_jobs.db");

    let job_id = {
        let mut tq = TestQueue::spawn_on_disk(
            &db_path,
            ScriptedExecutor::always_delivered().with_latency(Duration::from_secs(60)),
        )
        .await;
        let job_id = tq.queue.enqueue(drive_record("s1")).unwrap();
        tq.wait_for_attempts(1).await;
        tq.shutdown().await;
        job_id
    };

    let mut tq = TestQueue::spawn_on_disk(&db_path, ScriptedExecutor::always_delivered()).await;

    // The interrupted attempt did not count
    assert_eq!(
        tq.wait_for_terminal(&job_id).await,
        JobEvent::Succeeded {
            job_id: job_id.clone(),
            session_id: "s1".to_string(),
            attempt_count: 1,
        }
    );
}

#[tokio::test]
async fn test_invalid_stored_record_is_dropped_on_restart() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("upload_jobs.db");

    {
        let store = SqliteJobStore::new(&db_path).unwrap();
        for (job_id, session_id) in [("valid", "s1"), ("tampered", "s2")] {
            let job = Job::new(job_id.to_string(), drive_record(session_id), Default::default());
            store.save_job(&job).unwrap();
        }
    }

    // Well-formed JSON that no longer passes record validation
    {
        let conn = rusqlite::Connection::open(&db_path).unwrap();
        let payload: String = conn
            .query_row(
                "SELECT payload FROM upload_jobs WHERE job_id = 'tampered'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        let mut payload: serde_json::Value = serde_json::from_str(&payload).unwrap();
        payload["history_storage_path"] = serde_json::json!("");
        conn.execute(
            "UPDATE upload_jobs SET payload = ?1 WHERE job_id = 'tampered'",
            [payload.to_string()],
        )
        .unwrap();
    }

    let mut tq = TestQueue::spawn_on_disk(&db_path, ScriptedExecutor::always_delivered()).await;

    assert!(matches!(
        tq.wait_for_terminal("valid").await,
        JobEvent::Succeeded { attempt_count: 1, .. }
    ));
    assert_eq!(tq.executor.attempts(), 1);
    assert!(matches!(
        tq.queue.status("tampered"),
        Err(QueueError::NotFound(_))
    ));
    assert!(tq.store.get_job("tampered").unwrap().is_none());
}

// ============================================================================
// Storage failures
// ============================================================================

#[tokio::test]
async fn test_enqueue_surfaces_storage_error() {
    let mut store = MockStore::new();
    store
        .expect_load_all_pending_or_retrying()
        .returning(|| Ok(Vec::new()));
    store
        .expect_save_job()
        .returning(|_| Err(anyhow::anyhow!("database is locked")));

    let tq = TestQueue::spawn(
        ScriptedExecutor::always_delivered(),
        Arc::new(store),
        true,
        fast_settings(),
    )
    .await;

    let err = tq.queue.enqueue(drive_record("s1")).unwrap_err();
    assert_eq!(err, QueueError::Storage("database is locked".to_string()));
    assert!(tq.queue.list_jobs().is_empty());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(tq.executor.attempts(), 0);
}

#[tokio::test]
async fn test_cancel_surfaces_storage_error_and_keeps_job() {
    let mut store = MockStore::new();
    store
        .expect_load_all_pending_or_retrying()
        .returning(|| Ok(Vec::new()));
    store.expect_save_job().returning(|_| Ok(()));
    store
        .expect_delete_job()
        .returning(|_| Err(anyhow::anyhow!("disk I/O error")));

    let tq = TestQueue::spawn(
        ScriptedExecutor::always_delivered(),
        Arc::new(store),
        false,
        fast_settings(),
    )
    .await;
    let job_id = tq.queue.enqueue(drive_record("s1")).unwrap();

    assert_eq!(
        tq.queue.cancel(&job_id),
        Err(QueueError::Storage("disk I/O error".to_string()))
    );
    assert_eq!(tq.queue.status(&job_id).unwrap(), JobState::Pending);
}

#[tokio::test]
async fn test_startup_fails_when_store_cannot_be_read() {
    let mut store = MockStore::new();
    store
        .expect_load_all_pending_or_retrying()
        .returning(|| Err(anyhow::anyhow!("no such table: upload_jobs")));

    let result = create_upload_queue(
        Arc::new(store),
        Arc::new(ScriptedExecutor::always_delivered()),
        &ConnectivitySignal::new(true),
        fast_settings(),
        CancellationToken::new(),
    );

    assert!(matches!(result, Err(QueueError::Storage(_))));
}

// ============================================================================
// Configuration
// ============================================================================

#[tokio::test]
async fn test_queue_built_from_file_config() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("uploads.db");
    let toml = format!(
        r#"
        db_path = "{}"

        [upload_queue]
        max_attempts = 2
        backoff = "exponential"
        initial_backoff_secs = 0
        max_backoff_secs = 1
        "#,
        db_path.display()
    );

    let config = UploaderConfig::resolve(Some(FileConfig::parse(&toml).unwrap()), None).unwrap();
    assert_eq!(config.upload_queue.max_attempts, 2);

    let mut tq = TestQueue::spawn(
        ScriptedExecutor::always(transient("HTTP 500")),
        Arc::new(SqliteJobStore::new(&config.db_path).unwrap()),
        true,
        config.upload_queue,
    )
    .await;

    let job_id = tq.queue.enqueue(drive_record("s1")).unwrap();
    assert!(matches!(
        tq.wait_for_terminal(&job_id).await,
        JobEvent::Failed { attempt_count: 2, .. }
    ));
}
