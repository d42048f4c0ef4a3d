//! Tracing initialisation for hosts embedding the uploader.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable that overrides the configured level.
pub const LOG_LEVEL_ENV: &str = "LOG_LEVEL";

/// Install a fmt subscriber filtered by `LOG_LEVEL`, falling back to `default_level`
/// ("error", "warn", "info", "debug" or "trace").
///
/// Returns false if a global subscriber was already installed.
pub fn init_tracing(default_level: &str) -> bool {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(parse_level(default_level).into())
                .with_env_var(LOG_LEVEL_ENV)
                .from_env_lossy(),
        )
        .try_init()
        .is_ok()
}

fn parse_level(level: &str) -> LevelFilter {
    level.parse().unwrap_or(LevelFilter::INFO)
}
