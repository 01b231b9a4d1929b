//! Transition observers.

use crate::{CircuitState, Transition};
use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Receives every state transition of the breaker it is attached to.
///
/// Called synchronously on the thread that caused the transition, after the
/// breaker's internal lock has been released. A panic inside a listener is
/// caught and logged; it never reaches the caller of `execute` and never
/// undoes the transition being reported.
pub trait Listener: Send + Sync {
    fn on_transition(&self, transition: &Transition);
}

impl<F> Listener for F
where
    F: Fn(&Transition) + Send + Sync,
{
    fn on_transition(&self, transition: &Transition) {
        self(transition)
    }
}

#[derive(Debug, Default)]
struct OpenTime {
    opened_at: Option<Instant>,
    last: Option<Duration>,
    total: Duration,
    times_opened: u64,
}

/// Tracks how long the breaker spends open.
///
/// An open period starts on any transition into `Open` and ends on the next
/// transition out of it (to `HalfOpen`, or to `Closed` through a reset).
#[derive(Debug, Default)]
pub struct OpenTimeTracker {
    inner: Mutex<OpenTime>,
}

impl OpenTimeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sum of all completed open periods.
    pub fn total_open(&self) -> Duration {
        self.inner.lock().total
    }

    /// Length of the most recently completed open period.
    pub fn last_open(&self) -> Option<Duration> {
        self.inner.lock().last
    }

    pub fn times_opened(&self) -> u64 {
        self.inner.lock().times_opened
    }

    /// Start of the open period in progress, if any.
    pub fn open_since(&self) -> Option<Instant> {
        self.inner.lock().opened_at
    }
}

impl Listener for OpenTimeTracker {
    fn on_transition(&self, transition: &Transition) {
        let mut inner = self.inner.lock();

        if transition.to == CircuitState::Open {
            inner.opened_at = Some(transition.at);
            inner.times_opened += 1;
            tracing::info!(from = %transition.from, to = %transition.to, "circuit state changed");
            return;
        }

        let Some(opened_at) = inner.opened_at.take() else {
            return;
        };
        let open_for = transition.at.saturating_duration_since(opened_at);
        inner.last = Some(open_for);
        inner.total += open_for;

        tracing::info!(
            from = %transition.from,
            to = %transition.to,
            open_secs = open_for.as_secs_f64(),
            "circuit state changed"
        );
    }
}
