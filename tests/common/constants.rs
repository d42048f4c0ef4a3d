use std::time::Duration;

pub const TEST_USER_ID: &str = "user-42";
pub const TEST_APP_SESSION_ID: &str = "app-session-7";

/// Backoff used by queues in tests. Short enough to run three attempts quickly.
pub const TEST_BACKOFF: Duration = Duration::from_millis(10);

/// Upper bound for any single wait in a test.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);
