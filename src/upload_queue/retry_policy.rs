//! Retry policy for failed upload attempts.
//!
//! Decides between another attempt after a delay and giving up for good.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use super::models::UploadOutcome;
use crate::config::UploadQueueSettings;

/// Shape of the delay curve between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffKind {
    /// Same delay before every retry.
    #[default]
    Fixed,
    /// `initial * n`
    Linear,
    /// `initial * multiplier^(n - 1)`
    Exponential,
}

impl BackoffKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackoffKind::Fixed => "fixed",
            BackoffKind::Linear => "linear",
            BackoffKind::Exponential => "exponential",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown backoff kind: {0}")]
pub struct UnknownBackoffKind(pub String);

impl FromStr for BackoffKind {
    type Err = UnknownBackoffKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fixed" => Ok(BackoffKind::Fixed),
            "linear" => Ok(BackoffKind::Linear),
            "exponential" => Ok(BackoffKind::Exponential),
            _ => Err(UnknownBackoffKind(s.to_string())),
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Hard ceiling on the number of attempts.
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    pub initial_backoff: Duration,
    /// Cap applied to every computed delay.
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// Create a new RetryPolicy from queue settings.
    pub fn new(settings: &UploadQueueSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            backoff: settings.backoff,
            initial_backoff: settings.initial_backoff,
            max_backoff: settings.max_backoff,
            backoff_multiplier: settings.backoff_multiplier,
        }
    }

    /// Decide the follow-up to an attempt.
    ///
    /// `attempt_count` is the number of attempts already made, including the one
    /// that produced `outcome`.
    pub fn decide(&self, attempt_count: u32, outcome: &UploadOutcome) -> RetryDecision {
        match outcome {
            UploadOutcome::TransientFailure(_) if attempt_count < self.max_attempts => {
                RetryDecision::RetryAfter(self.delay_for(attempt_count))
            }
            _ => RetryDecision::GiveUp,
        }
    }

    /// Delay before the retry that follows attempt number `attempt_count`.
    ///
    /// Non-decreasing in `attempt_count` and never above `max_backoff`.
    pub fn delay_for(&self, attempt_count: u32) -> Duration {
        let n = attempt_count.max(1);
        let delay = match self.backoff {
            BackoffKind::Fixed => self.initial_backoff,
            BackoffKind::Linear => self
                .initial_backoff
                .checked_mul(n)
                .unwrap_or(self.max_backoff),
            BackoffKind::Exponential if n == 1 => self.initial_backoff,
            BackoffKind::Exponential => {
                let exponent = i32::try_from(n - 1).unwrap_or(i32::MAX);
                let secs = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(exponent);
                if secs.is_nan() || secs <= 0.0 {
                    Duration::ZERO
                } else if secs >= self.max_backoff.as_secs_f64() {
                    self.max_backoff
                } else {
                    Duration::from_secs_f64(secs)
                }
            }
        };
        delay.min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&UploadQueueSettings::default())
    }
}
