//! Thread-safe circuit breaker
//!
//! ```text
//! Closed --(failure_threshold consecutive failures)--> Open
//! Open --(call arrives, reset_timeout elapsed)--> HalfOpen
//! HalfOpen --(trial succeeds)--> Closed
//! HalfOpen --(trial fails)--> Open
//! ```
//!
//! Bookkeeping lives behind one mutex that is never held while the guarded
//! operation runs. The open timeout is checked lazily when a call arrives;
//! there is no background timer.

use crate::{
    BreakerConfig, CircuitOpenError, CircuitState, Clock, ConfigError, Error, Listener,
    MonotonicClock, Transition,
};
use parking_lot::Mutex;
use std::fmt;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEFAULT_NAME: &str = "circuit-breaker";

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    // Bumped on every transition; outcomes of permits from an older
    // generation are discarded.
    generation: u64,
}

impl Inner {
    fn new() -> Self {
        Inner {
            state: CircuitState::Closed,
            failure_count: 0,
            opened_at: None,
            trial_in_flight: false,
            generation: 0,
        }
    }

    fn transition(&mut self, to: CircuitState, now: Instant) -> Transition {
        let from = self.state;
        self.state = to;
        self.generation += 1;

        match to {
            CircuitState::Closed => {
                self.failure_count = 0;
                self.opened_at = None;
                self.trial_in_flight = false;
            }
            CircuitState::Open => {
                self.opened_at = Some(now);
                self.trial_in_flight = false;
            }
            CircuitState::HalfOpen => {}
        }

        Transition { from, to, at: now }
    }

    fn check_invariants(&self, failure_threshold: u32) {
        match self.state {
            CircuitState::Closed => {
                debug_assert!(self.failure_count < failure_threshold);
                debug_assert!(self.opened_at.is_none());
                debug_assert!(!self.trial_in_flight);
            }
            CircuitState::Open => {
                debug_assert!(self.opened_at.is_some());
                debug_assert!(!self.trial_in_flight);
            }
            CircuitState::HalfOpen => {
                debug_assert!(self.opened_at.is_some());
            }
        }
    }
}

/// Transitions waiting to be handed to listeners, in the order they happened.
#[derive(Debug, Default)]
struct Delivery {
    queue: VecDeque<Pending>,
    draining: bool,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    transition: Transition,
    failures: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PermitKind {
    Closed,
    Trial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
}

/// Guards calls to one protected resource.
///
/// Share it between threads behind an `Arc` (or a plain reference with
/// scoped threads). Each protected resource should get its own breaker.
pub struct CircuitBreaker<C: Clock = MonotonicClock> {
    name: String,
    config: BreakerConfig,
    clock: C,
    inner: Mutex<Inner>,
    // Lock order: `inner` before `delivery`.
    delivery: Mutex<Delivery>,
    listeners: Vec<Arc<dyn Listener>>,
}

impl CircuitBreaker<MonotonicClock> {
    /// Create a breaker with the given thresholds on the monotonic clock
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Result<Self, ConfigError> {
        Self::builder(BreakerConfig::new(failure_threshold, reset_timeout)?).build()
    }

    pub fn builder(config: BreakerConfig) -> Builder<MonotonicClock> {
        Builder {
            config,
            name: None,
            clock: MonotonicClock,
            listeners: Vec::new(),
        }
    }
}

impl<C: Clock> CircuitBreaker<C> {
    pub fn with_clock(
        failure_threshold: u32,
        reset_timeout: Duration,
        clock: C,
    ) -> Result<Self, ConfigError> {
        CircuitBreaker::builder(BreakerConfig::new(failure_threshold, reset_timeout)?)
            .clock(clock)
            .build()
    }

    /// Run `operation` through the breaker.
    ///
    /// Returns the operation's value on success, its error unchanged in
    /// [`Error::Operation`] on failure, or [`Error::Rejected`] without running
    /// it when the circuit is open or a half-open trial is already running.
    pub fn execute<F, T, E>(&self, operation: F) -> Result<T, Error<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let permit = self.try_acquire()?;

        match operation() {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                permit.failure();
                Err(Error::Operation(e))
            }
        }
    }

    /// Ask for permission to run one call.
    ///
    /// The caller runs the operation itself and reports the outcome on the
    /// returned [`Permit`]. Dropping the permit without reporting counts as a
    /// failure.
    pub fn try_acquire(&self) -> Result<Permit<'_, C>, CircuitOpenError> {
        let now = self.clock.now();
        let mut transitioned = false;

        let admitted = {
            let mut inner = self.inner.lock();
            let admitted = match inner.state {
                CircuitState::Closed => Ok(PermitKind::Closed),
                CircuitState::Open => {
                    let elapsed = inner
                        .opened_at
                        .map_or(self.config.reset_timeout, |at| {
                            now.saturating_duration_since(at)
                        });
                    if elapsed >= self.config.reset_timeout {
                        let transition = inner.transition(CircuitState::HalfOpen, now);
                        self.enqueue(&inner, transition);
                        transitioned = true;
                        inner.trial_in_flight = true;
                        Ok(PermitKind::Trial)
                    } else {
                        Err(CircuitOpenError::Open {
                            remaining: self.config.reset_timeout - elapsed,
                        })
                    }
                }
                CircuitState::HalfOpen => {
                    if inner.trial_in_flight {
                        Err(CircuitOpenError::TrialInFlight)
                    } else {
                        inner.trial_in_flight = true;
                        Ok(PermitKind::Trial)
                    }
                }
            };
            inner.check_invariants(self.config.failure_threshold);
            admitted.map(|kind| (kind, inner.generation))
        };

        if transitioned {
            self.deliver();
        }

        match admitted {
            Ok((kind, generation)) => Ok(Permit {
                breaker: self,
                kind,
                generation,
                settled: false,
            }),
            Err(rejection) => {
                tracing::debug!(breaker = %self.name, reason = %rejection, "call rejected");
                Err(rejection)
            }
        }
    }

    /// Force the breaker back to closed, clearing the failure count.
    ///
    /// Permits issued before the reset are invalidated: their outcomes are
    /// ignored.
    pub fn reset(&self) {
        let now = self.clock.now();
        let transitioned = {
            let mut inner = self.inner.lock();
            if inner.state == CircuitState::Closed {
                inner.failure_count = 0;
                inner.generation += 1;
                false
            } else {
                let transition = inner.transition(CircuitState::Closed, now);
                self.enqueue(&inner, transition);
                true
            }
        };

        if transitioned {
            self.deliver();
        }
    }

    /// Current state. An open breaker whose timeout has elapsed still reports
    /// `Open` until the next call arrives.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn record(&self, kind: PermitKind, generation: u64, outcome: Outcome) {
        let now = self.clock.now();
        let transitioned = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                tracing::trace!(breaker = %self.name, ?outcome, "ignoring stale outcome");
                return;
            }

            let transition = match (kind, outcome) {
                (PermitKind::Closed, Outcome::Success) => {
                    inner.failure_count = 0;
                    None
                }
                (PermitKind::Closed, Outcome::Failure) => {
                    inner.failure_count += 1;
                    if inner.failure_count >= self.config.failure_threshold {
                        Some(inner.transition(CircuitState::Open, now))
                    } else {
                        None
                    }
                }
                (PermitKind::Trial, Outcome::Success) => {
                    Some(inner.transition(CircuitState::Closed, now))
                }
                (PermitKind::Trial, Outcome::Failure) => {
                    Some(inner.transition(CircuitState::Open, now))
                }
            };
            inner.check_invariants(self.config.failure_threshold);
            if let Some(transition) = transition {
                self.enqueue(&inner, transition);
            }
            transition.is_some()
        };

        if transitioned {
            self.deliver();
        }
    }

    // Called with `inner` held so the queue order is the transition order.
    fn enqueue(&self, inner: &Inner, transition: Transition) {
        self.delivery.lock().queue.push_back(Pending {
            transition,
            failures: inner.failure_count,
        });
    }

    /// Drain queued transitions to listeners, one thread at a time.
    ///
    /// If another thread is already draining, it picks up whatever was queued
    /// here; this also covers a listener that itself causes a transition.
    fn deliver(&self) {
        {
            let mut delivery = self.delivery.lock();
            if delivery.draining {
                return;
            }
            delivery.draining = true;
        }

        loop {
            let pending = {
                let mut delivery = self.delivery.lock();
                match delivery.queue.pop_front() {
                    Some(pending) => pending,
                    None => {
                        delivery.draining = false;
                        return;
                    }
                }
            };
            self.notify(pending);
        }
    }

    fn notify(&self, pending: Pending) {
        let transition = pending.transition;
        match transition.to {
            CircuitState::Open => tracing::warn!(
                breaker = %self.name,
                from = %transition.from,
                failures = pending.failures,
                threshold = self.config.failure_threshold,
                reset_timeout_secs = self.config.reset_timeout.as_secs_f64(),
                "circuit opened"
            ),
            CircuitState::HalfOpen => {
                tracing::info!(breaker = %self.name, "circuit half-open, admitting trial call")
            }
            CircuitState::Closed => {
                tracing::info!(breaker = %self.name, from = %transition.from, "circuit closed")
            }
        }

        for listener in &self.listeners {
            let result =
                panic::catch_unwind(AssertUnwindSafe(|| listener.on_transition(&transition)));
            if result.is_err() {
                tracing::error!(
                    breaker = %self.name,
                    from = %transition.from,
                    to = %transition.to,
                    "transition listener panicked"
                );
            }
        }
    }
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &inner.state)
            .field("failure_count", &inner.failure_count)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// Builder for [`CircuitBreaker`].
pub struct Builder<C: Clock = MonotonicClock> {
    config: BreakerConfig,
    name: Option<String>,
    clock: C,
    listeners: Vec<Arc<dyn Listener>>,
}

impl<C: Clock> Builder<C> {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn listener(mut self, listener: Arc<dyn Listener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn clock<D: Clock>(self, clock: D) -> Builder<D> {
        Builder {
            config: self.config,
            name: self.name,
            clock,
            listeners: self.listeners,
        }
    }

    pub fn build(self) -> Result<CircuitBreaker<C>, ConfigError> {
        self.config.validate()?;

        Ok(CircuitBreaker {
            name: self.name.unwrap_or_else(|| DEFAULT_NAME.to_string()),
            config: self.config,
            clock: self.clock,
            inner: Mutex::new(Inner::new()),
            delivery: Mutex::new(Delivery::default()),
            listeners: self.listeners,
        })
    }
}

/// Permission to run a single call, obtained from
/// [`CircuitBreaker::try_acquire`].
#[must_use = "dropping a permit without reporting counts as a failure"]
pub struct Permit<'a, C: Clock> {
    breaker: &'a CircuitBreaker<C>,
    kind: PermitKind,
    generation: u64,
    settled: bool,
}

impl<C: Clock> Permit<'_, C> {
    /// Whether this permit is the half-open trial call.
    pub fn is_trial(&self) -> bool {
        self.kind == PermitKind::Trial
    }

    pub fn success(mut self) {
        self.settle(Outcome::Success);
    }

    pub fn failure(mut self) {
        self.settle(Outcome::Failure);
    }

    fn settle(&mut self, outcome: Outcome) {
        self.settled = true;
        self.breaker.record(self.kind, self.generation, outcome);
    }
}

impl<C: Clock> Drop for Permit<'_, C> {
    fn drop(&mut self) {
        if !self.settled {
            self.settle(Outcome::Failure);
        }
    }
}

impl<C: Clock> fmt::Debug for Permit<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit")
            .field("kind", &self.kind)
            .field("generation", &self.generation)
            .finish()
    }
}
