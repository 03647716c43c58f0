//! Retry policy for cache calls

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{HaError, HaResult};

use super::duration_ms;

/// Exponential backoff for transiently unavailable backends
///
/// All attempts of one call share the adapter's single operation timeout, so
/// a generous policy only ever shortens under a tight timeout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts per call, the first one included
    pub max_attempts: u32,
    #[serde(rename = "initial_backoff_ms", with = "duration_ms")]
    pub initial_backoff: Duration,
    #[serde(rename = "max_backoff_ms", with = "duration_ms")]
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Randomize each delay by ±10%
    pub use_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Fail on the first error
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay before attempt `attempt + 1`, given the delay used before `attempt`
    pub fn next_backoff(&self, current: Duration) -> Duration {
        let next = current.mul_f64(self.backoff_multiplier);
        next.min(self.max_backoff)
    }

    /// Apply jitter to a delay
    pub fn jittered(&self, delay: Duration) -> Duration {
        if !self.use_jitter {
            return delay;
        }
        let jitter = (rand::random::<f64>() - 0.5) * 0.2;
        delay.mul_f64(1.0 + jitter)
    }

    pub fn validate(&self) -> HaResult<()> {
        if self.max_attempts == 0 {
            return Err(HaError::config("retry.max_attempts must be at least 1"));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(HaError::config("retry.backoff_multiplier must be at least 1.0"));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(HaError::config("retry.initial_backoff must not exceed retry.max_backoff"));
        }
        Ok(())
    }
}
