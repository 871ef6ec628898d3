use std::future::Future;
use std::time::Duration;

use crate::error::TrackerError;

/// Exponential backoff for transient tracker failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Delay before attempt `attempt` (0-indexed); the first attempt never waits.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let base = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        Duration::from_secs_f64(base.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempts run out. The last error is returned.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, what: &str, mut op: F) -> Result<T, TrackerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TrackerError>>,
{
    let mut attempt = 0;
    loop {
        if attempt > 0 {
            tokio::time::sleep(config.delay_for_attempt(attempt)).await;
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < config.max_attempts => {
                tracing::debug!(%err, attempt, request = what, "retrying tracker request");
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
