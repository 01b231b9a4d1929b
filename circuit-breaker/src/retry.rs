//! Retries layered on top of a breaker.
//!
//! The breaker itself never retries. `RetryPolicy` wraps
//! [`CircuitBreaker::execute`] and gives up as soon as the breaker starts
//! rejecting calls.

use crate::{CircuitBreaker, Clock, ConfigError, Error};
use rand::Rng;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
    ) -> Result<Self, ConfigError> {
        if max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }

        Ok(Self {
            max_attempts,
            base_delay,
            max_delay: max_delay.max(base_delay),
        })
    }

    /// Fixed delay between attempts.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Result<Self, ConfigError> {
        Self::new(max_attempts, delay, delay)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to wait before `attempt` (1-based). The first attempt never
    /// waits; later ones back off exponentially from `base_delay`, capped at
    /// `max_delay`, plus up to 10% jitter.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let factor = 2u32.saturating_pow(attempt - 2);
        let capped = self.base_delay.saturating_mul(factor).min(self.max_delay);

        let jitter_range = u64::try_from(capped.as_millis()).unwrap_or(u64::MAX) / 10;
        let jitter = if jitter_range > 0 {
            rand::rng().random_range(0..jitter_range)
        } else {
            0
        };

        capped.saturating_add(Duration::from_millis(jitter))
    }

    /// Call `operation` through `breaker` until it succeeds, the breaker
    /// rejects, or attempts run out. Returns the last outcome.
    pub fn run<C, F, T, E>(
        &self,
        breaker: &CircuitBreaker<C>,
        mut operation: F,
    ) -> Result<T, Error<E>>
    where
        C: Clock,
        F: FnMut() -> Result<T, E>,
    {
        let mut attempt = 1;
        loop {
            match breaker.execute(&mut operation) {
                Ok(value) => return Ok(value),
                Err(err @ Error::Rejected(_)) => return Err(err),
                Err(err) if attempt >= self.max_attempts => return Err(err),
                Err(_) => {
                    attempt += 1;
                    let delay = self.delay_before(attempt);
                    tracing::warn!(
                        breaker = %breaker.name(),
                        attempt = attempt - 1,
                        max_attempts = self.max_attempts,
                        delay_secs = delay.as_secs_f64(),
                        "attempt failed, retrying"
                    );
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                }
            }
        }
    }
}
