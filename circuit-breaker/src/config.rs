//! Breaker configuration.

use crate::ConfigError;
use serde::Deserialize;
use std::time::Duration;

/// Failure threshold and reset timeout, fixed for the lifetime of a breaker.
///
/// Deserializes from `{ "failure_threshold": 5, "reset_timeout_ms": 10000 }`.
/// Missing fields take their [`Default`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker from closed to open.
    pub failure_threshold: u32,
    /// How long the breaker stays open before a trial call is admitted.
    #[serde(rename = "reset_timeout_ms", with = "millis")]
    pub reset_timeout: Duration,
}

impl BreakerConfig {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Result<Self, ConfigError> {
        let config = Self {
            failure_threshold,
            reset_timeout,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::ZeroFailureThreshold);
        }
        if self.reset_timeout.is_zero() {
            return Err(ConfigError::ZeroResetTimeout);
        }
        Ok(())
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(10),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
