mod file_config;

pub use file_config::{FileConfig, UploadQueueConfig};

use crate::upload_queue::BackoffKind;
use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct UploaderConfig {
    pub db_path: PathBuf,
    pub logging_level: String,
    pub upload_queue: UploadQueueSettings,
}

impl UploaderConfig {
    /// Resolve configuration from an optional TOML file config.
    /// File values win; `fallback_db_path` is used only when the file names no database.
    pub fn resolve(file_config: Option<FileConfig>, fallback_db_path: Option<PathBuf>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_path = file
            .db_path
            .map(PathBuf::from)
            .or(fallback_db_path)
            .ok_or_else(|| anyhow::anyhow!("db_path must be specified in config file or by the host"))?;

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                bail!("Database directory does not exist: {:?}", parent);
            }
        }

        let logging_level = file.logging_level.unwrap_or_else(|| "info".to_string());

        let defaults = UploadQueueSettings::default();
        let uq = file.upload_queue.unwrap_or_default();
        let backoff = match uq.backoff {
            Some(name) => name.parse::<BackoffKind>()?,
            None => defaults.backoff,
        };

        let upload_queue = UploadQueueSettings {
            max_attempts: uq.max_attempts.unwrap_or(defaults.max_attempts),
            backoff,
            initial_backoff: uq
                .initial_backoff_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.initial_backoff),
            max_backoff: uq
                .max_backoff_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_backoff),
            backoff_multiplier: uq.backoff_multiplier.unwrap_or(defaults.backoff_multiplier),
            num_workers: uq.num_workers.unwrap_or(defaults.num_workers),
            idle_poll_interval: uq
                .idle_poll_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_poll_interval),
            event_capacity: uq.event_capacity.unwrap_or(defaults.event_capacity),
            require_network: uq.require_network.unwrap_or(defaults.require_network),
        };
        upload_queue.validate()?;

        Ok(Self {
            db_path,
            logging_level,
            upload_queue,
        })
    }
}

#[derive(Debug, Clone)]
pub struct UploadQueueSettings {
    /// Hard ceiling on delivery attempts per job.
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Size of the attempt worker pool.
    pub num_workers: usize,
    /// Upper bound on how long the processor sleeps without any wake-up.
    pub idle_poll_interval: Duration,
    /// Buffer size of the job event broadcast channel.
    pub event_capacity: usize,
    /// Whether new jobs wait for network connectivity.
    pub require_network: bool,
}

impl Default for UploadQueueSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffKind::Fixed,
            initial_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(5 * 60 * 60), // 5 hours
            backoff_multiplier: 2.0,
            num_workers: 1,
            idle_poll_interval: Duration::from_secs(60),
            event_capacity: 256,
            require_network: true,
        }
    }
}

impl UploadQueueSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            bail!("max_attempts must be at least 1");
        }
        if self.num_workers == 0 {
            bail!("num_workers must be at least 1");
        }
        if self.event_capacity == 0 {
            bail!("event_capacity must be at least 1");
        }
        if !(self.backoff_multiplier >= 1.0) {
            bail!(
                "backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            );
        }
        if self.initial_backoff > self.max_backoff {
            bail!(
                "initial_backoff ({:?}) exceeds max_backoff ({:?})",
                self.initial_backoff,
                self.max_backoff
            );
        }
        Ok(())
    }
}
