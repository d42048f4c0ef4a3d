use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use drive_uploader::upload_queue::{BackoffKind, ScriptedExecutor};
use drive_uploader::{
    create_upload_queue, ConnectivitySignal, DriveRecord, JobEvent, JobStore, SqliteJobStore,
    UploadOutcome, UploadQueue, UploadQueueSettings,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::constants::{TEST_APP_SESSION_ID, TEST_BACKOFF, TEST_TIMEOUT, TEST_USER_ID};

pub fn drive_record(session_id: &str) -> DriveRecord {
    DriveRecord::builder()
        .session_id(session_id)
        .started_at(Utc.with_ymd_and_hms(2024, 6, 14, 7, 30, 0).unwrap())
        .ended_at(Utc.with_ymd_and_hms(2024, 6, 14, 8, 5, 0).unwrap())
        .user_id(TEST_USER_ID)
        .history_storage_path(format!("/data/copilot/{}.pbf.gz", session_id))
        .drive_mode("active-guidance")
        .app_version("1.4.0")
        .app_mode("mbx-debug")
        .nav_sdk_version("2.17.0")
        .nav_native_sdk_version("124.0.0")
        .app_session_id(TEST_APP_SESSION_ID)
        .build()
        .unwrap()
}

pub fn fast_settings() -> UploadQueueSettings {
    UploadQueueSettings {
        max_attempts: 3,
        backoff: BackoffKind::Fixed,
        initial_backoff: TEST_BACKOFF,
        max_backoff: Duration::from_millis(100),
        idle_poll_interval: Duration::from_millis(200),
        ..UploadQueueSettings::default()
    }
}

/// A running queue with its processor task, executor and store.
pub struct TestQueue {
    pub queue: UploadQueue,
    pub executor: Arc<ScriptedExecutor>,
    pub store: Arc<dyn JobStore>,
    pub connectivity: ConnectivitySignal,
    /// Subscribed before the processor starts, so no event is missed.
    pub events: broadcast::Receiver<JobEvent>,
    shutdown: CancellationToken,
    processor: Option<JoinHandle<()>>,
}

impl TestQueue {
    pub async fn spawn(
        executor: ScriptedExecutor,
        store: Arc<dyn JobStore>,
        connected: bool,
        settings: UploadQueueSettings,
    ) -> Self {
        let executor = Arc::new(executor);
        let connectivity = ConnectivitySignal::new(connected);
        let shutdown = CancellationToken::new();

        let (processor, queue) = create_upload_queue(
            Arc::clone(&store),
            executor.clone(),
            &connectivity,
            settings,
            shutdown.clone(),
        )
        .unwrap();
        let events = queue.subscribe();
        let processor = tokio::spawn(processor.run());

        Self {
            queue,
            executor,
            store,
            connectivity,
            events,
            shutdown,
            processor: Some(processor),
        }
    }

    /// Connected queue over an in-memory store that runs `script` then delivers.
    pub async fn spawn_scripted(script: Vec<UploadOutcome>) -> Self {
        Self::spawn(
            ScriptedExecutor::new(script, UploadOutcome::Delivered),
            Arc::new(SqliteJobStore::in_memory().unwrap()),
            true,
            fast_settings(),
        )
        .await
    }

    pub async fn spawn_delivering() -> Self {
        Self::spawn_scripted(Vec::new()).await
    }

    /// Queue over an on-disk store at `db_path`.
    pub async fn spawn_on_disk(db_path: &Path, executor: ScriptedExecutor) -> Self {
        Self::spawn(
            executor,
            Arc::new(SqliteJobStore::new(db_path).unwrap()),
            true,
            fast_settings(),
        )
        .await
    }

    /// Wait for the terminal event of `job_id`, skipping everything else.
    pub async fn wait_for_terminal(&mut self, job_id: &str) -> JobEvent {
        let events = &mut self.events;
        tokio::time::timeout(TEST_TIMEOUT, async {
            loop {
                let event = events.recv().await.unwrap();
                if event.is_terminal() && event.job_id() == job_id {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for a terminal event")
    }

    /// Wait until the executor has started at least `count` attempts.
    pub async fn wait_for_attempts(&self, count: usize) {
        tokio::time::timeout(TEST_TIMEOUT, async {
            while self.executor.attempts() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for upload attempts");
    }

    /// Stop the processor and wait for it to exit.
    pub async fn shutdown(&mut self) {
        self.shutdown.cancel();
        if let Some(processor) = self.processor.take() {
            tokio::time::timeout(TEST_TIMEOUT, processor)
                .await
                .expect("processor did not stop")
                .unwrap();
        }
    }
}

impl Drop for TestQueue {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
