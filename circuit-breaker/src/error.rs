//! Error types.

use std::time::Duration;
use thiserror::Error;

/// Why a call was turned away without running the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CircuitOpenError {
    #[error("circuit is open, next trial allowed in {remaining:?}")]
    Open { remaining: Duration },
    #[error("circuit is half-open and a trial call is already in flight")]
    TrialInFlight,
}

/// Outcome of a guarded call that did not succeed.
#[derive(Debug, Error)]
pub enum Error<E> {
    #[error("call rejected: {0}")]
    Rejected(#[from] CircuitOpenError),
    /// The operation ran and failed; its error is passed through untouched.
    #[error("{0}")]
    Operation(E),
}

impl<E> Error<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, Error::Rejected(_))
    }

    pub fn into_operation(self) -> Option<E> {
        match self {
            Error::Operation(e) => Some(e),
            Error::Rejected(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("failure threshold must be greater than zero")]
    ZeroFailureThreshold,
    #[error("reset timeout must be greater than zero")]
    ZeroResetTimeout,
    #[error("retry policy must allow at least one attempt")]
    ZeroAttempts,
}
