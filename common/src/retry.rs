// Delivery retry policy with exponential backoff and jitter
//
// Used for outbound notifications; worker runs themselves are never retried
// here, a failed run waits for its next regular trigger.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// RetryStrategy decides how long to wait before the next attempt
pub trait RetryStrategy: Send + Sync {
    /// Delay before attempt `attempt + 1`, where `attempt` counts failures so
    /// far (starting at 1). `None` once the attempt budget is spent.
    fn next_delay(&self, attempt: u32) -> Option<Duration>;

    /// Total number of attempts, the first one included
    fn max_attempts(&self) -> u32;
}

/// Exponential backoff: base, base*3, base*9, ... capped, plus jitter
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    /// Jitter factor in [0.0, 1.0]
    jitter_factor: f64,
    max_attempts: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.1,
            max_attempts: 3,
        }
    }
}

impl ExponentialBackoff {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    pub fn with_config(
        base_delay: Duration,
        max_delay: Duration,
        jitter_factor: f64,
        max_attempts: u32,
    ) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
            max_attempts: max_attempts.max(1),
        }
    }

    fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let factor = 3_u32.saturating_pow(exponent);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn with_jitter(&self, delay: Duration) -> Duration {
        if self.jitter_factor == 0.0 {
            return delay;
        }
        let range_ms = (delay.as_millis() as f64 * self.jitter_factor) as u64;
        if range_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=range_ms))
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        Some(self.with_jitter(self.base_delay_for(attempt)))
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Fixed delay between attempts
#[derive(Debug, Clone)]
pub struct FixedDelay {
    delay: Duration,
    max_attempts: u32,
}

impl FixedDelay {
    pub fn new(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts: max_attempts.max(1),
        }
    }
}

impl RetryStrategy for FixedDelay {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        (attempt < self.max_attempts).then_some(self.delay)
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Run `operation` until it succeeds or the strategy gives up; returns the
/// last error on exhaustion.
pub async fn retry_with<S, F, Fut, T, E>(strategy: &S, what: &str, mut operation: F) -> Result<T, E>
where
    S: RetryStrategy + ?Sized,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => match strategy.next_delay(attempt) {
                Some(delay) => {
                    warn!(
                        attempt,
                        max_attempts = strategy.max_attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "{what} failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => return Err(e),
            },
        }
    }
}
