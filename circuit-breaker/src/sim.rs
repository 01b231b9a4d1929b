//! Simulation harness for the circuit breaker

#[cfg(test)]
mod tests {
    use crate::{
        CircuitBreaker, CircuitOpenError, CircuitState, Clock, Error, Listener, ManualClock,
        OpenTimeTracker, Transition,
    };
    use parking_lot::Mutex;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::{Duration, Instant};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Step {
        Success,
        Failure,
        Tick,
    }

    const TICK: Duration = Duration::from_millis(1);

    fn generate_random_steps(seed: u64, count: usize) -> Vec<Step> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut steps = Vec::with_capacity(count);

        for _ in 0..count {
            let choice = rng.random_range(0..3);
            steps.push(match choice {
                0 => Step::Success,
                1 => Step::Failure,
                _ => Step::Tick,
            });
        }

        steps
    }

    /// Straight-line model of the breaker, used as the oracle.
    #[derive(Debug)]
    struct Model {
        state: CircuitState,
        failures: u32,
        opened_at: Option<Instant>,
        threshold: u32,
        timeout: Duration,
    }

    impl Model {
        fn call(&mut self, now: Instant, succeeds: bool) -> (bool, CircuitState) {
            if self.state == CircuitState::Open {
                let opened_at = self.opened_at.unwrap();
                if now.duration_since(opened_at) < self.timeout {
                    return (false, self.state);
                }
                self.state = CircuitState::HalfOpen;
            }

            match (self.state, succeeds) {
                (CircuitState::Closed, true) => self.failures = 0,
                (CircuitState::Closed, false) => {
                    self.failures += 1;
                    if self.failures >= self.threshold {
                        self.state = CircuitState::Open;
                        self.opened_at = Some(now);
                    }
                }
                (CircuitState::HalfOpen, true) => {
                    self.state = CircuitState::Closed;
                    self.failures = 0;
                    self.opened_at = None;
                }
                (CircuitState::HalfOpen, false) => {
                    self.state = CircuitState::Open;
                    self.opened_at = Some(now);
                }
                (CircuitState::Open, _) => unreachable!(),
            }
            (true, self.state)
        }
    }

    #[test]
    fn test_random_sequence_matches_model() {
        let threshold = 10;
        let timeout = TICK * 5;
        let seed = 42;
        let count = 100_000;
        let clock = ManualClock::new(Instant::now());
        let cb = CircuitBreaker::with_clock(threshold, timeout, clock.clone()).unwrap();
        let mut model = Model {
            state: CircuitState::Closed,
            failures: 0,
            opened_at: None,
            threshold,
            timeout,
        };
        let invoked = AtomicUsize::new(0);

        for step in generate_random_steps(seed, count) {
            let succeeds = match step {
                Step::Tick => {
                    clock.advance(TICK);
                    continue;
                }
                Step::Success => true,
                Step::Failure => false,
            };

            let before = invoked.load(Ordering::Relaxed);
            let result = cb.execute(|| {
                invoked.fetch_add(1, Ordering::Relaxed);
                if succeeds {
                    Ok(())
                } else {
                    Err(())
                }
            });
            let ran = invoked.load(Ordering::Relaxed) > before;

            let (expected_ran, expected_state) = model.call(clock.now(), succeeds);
            assert_eq!(ran, expected_ran, "step: {:?}", step);
            assert_eq!(cb.state(), expected_state, "step: {:?}", step);
            assert_eq!(matches!(result, Err(Error::Rejected(_))), !ran);

            if cb.state() == CircuitState::Closed {
                assert!(cb.failure_count() < threshold);
                assert_eq!(cb.failure_count(), model.failures, "step: {:?}", step);
            }
        }
    }

    #[test]
    fn test_random_sequence_with_sparse_failures_never_opens() {
        // with threshold 3 and at most two failures between successes the
        // circuit can never open
        let clock = ManualClock::new(Instant::now());
        let cb = CircuitBreaker::with_clock(3, TICK, clock).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let mut run = 0;

        for _ in 0..10_000 {
            let fail = run < 2 && rng.random_bool(0.6);
            if fail {
                run += 1;
                cb.execute(|| Err::<(), _>(())).unwrap_err();
            } else {
                run = 0;
                cb.execute(|| Ok::<_, ()>(())).unwrap();
            }
            assert_eq!(cb.state(), CircuitState::Closed);
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(CircuitState, CircuitState)>>,
    }

    impl Listener for Recorder {
        fn on_transition(&self, transition: &Transition) {
            self.seen.lock().push((transition.from, transition.to));
        }
    }

    #[test]
    fn test_concurrent_callers_get_exactly_one_trial() {
        let threads = 16;
        let clock = ManualClock::new(Instant::now());
        let recorder = Arc::new(Recorder::default());
        let cb = CircuitBreaker::builder(
            crate::BreakerConfig::new(1, Duration::from_secs(5)).unwrap(),
        )
        .clock(clock.clone())
        .listener(recorder.clone())
        .build()
        .unwrap();

        cb.execute(|| Err::<(), _>(())).unwrap_err();
        clock.advance(Duration::from_secs(5));

        let invoked = AtomicUsize::new(0);
        let rejected = AtomicUsize::new(0);
        let arrived = Barrier::new(threads);
        // keeps the trial running until every other caller has been turned away
        let release = Barrier::new(2);

        thread::scope(|s| {
            for _ in 0..threads {
                s.spawn(|| {
                    arrived.wait();
                    let result = cb.execute(|| {
                        invoked.fetch_add(1, Ordering::SeqCst);
                        release.wait();
                        Ok::<_, ()>(())
                    });
                    match result {
                        Ok(()) => {}
                        Err(Error::Rejected(CircuitOpenError::TrialInFlight)) => {
                            if rejected.fetch_add(1, Ordering::SeqCst) + 1 == threads - 1 {
                                release.wait();
                            }
                        }
                        Err(other) => panic!("unexpected outcome: {:?}", other),
                    }
                });
            }
        });

        assert_eq!(invoked.load(Ordering::SeqCst), 1);
        assert_eq!(rejected.load(Ordering::SeqCst), threads - 1);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(
            *recorder.seen.lock(),
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[test]
    fn test_slow_operation_does_not_block_fast_fail() {
        let clock = ManualClock::new(Instant::now());
        let cb = CircuitBreaker::with_clock(1, Duration::from_secs(5), clock.clone()).unwrap();
        cb.execute(|| Err::<(), _>(())).unwrap_err();
        clock.advance(Duration::from_secs(5));

        let trial_started = Barrier::new(2);
        let checked = Barrier::new(2);

        thread::scope(|s| {
            s.spawn(|| {
                cb.execute(|| {
                    trial_started.wait();
                    checked.wait();
                    Err::<(), _>(())
                })
                .unwrap_err();
            });

            trial_started.wait();
            // the trial is blocked inside the operation; state reads and
            // rejections must still go through
            assert_eq!(cb.state(), CircuitState::HalfOpen);
            assert_eq!(
                cb.try_acquire().unwrap_err(),
                CircuitOpenError::TrialInFlight
            );
            checked.wait();
        });

        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_concurrent_failures_open_once() {
        let threads = 8;
        let per_thread = 50;
        let clock = ManualClock::new(Instant::now());
        let tracker = Arc::new(OpenTimeTracker::new());
        let cb = CircuitBreaker::builder(
            crate::BreakerConfig::new(20, Duration::from_secs(60)).unwrap(),
        )
        .clock(clock)
        .listener(tracker.clone())
        .build()
        .unwrap();
        let invoked = AtomicUsize::new(0);

        thread::scope(|s| {
            for _ in 0..threads {
                s.spawn(|| {
                    for _ in 0..per_thread {
                        let _ = cb.execute(|| {
                            invoked.fetch_add(1, Ordering::Relaxed);
                            Err::<(), _>(())
                        });
                    }
                });
            }
        });

        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(tracker.times_opened(), 1);
        // every call admitted while closed may run; none after the trip
        assert!(invoked.load(Ordering::Relaxed) < threads * per_thread);
        assert!(invoked.load(Ordering::Relaxed) >= 20);
    }

    #[test]
    fn test_open_time_tracked_across_recovery() {
        let clock = ManualClock::new(Instant::now());
        let tracker = Arc::new(OpenTimeTracker::new());
        let cb = CircuitBreaker::builder(
            crate::BreakerConfig::new(2, Duration::from_secs(10)).unwrap(),
        )
        .name("HTTP GET")
        .clock(clock.clone())
        .listener(tracker.clone())
        .build()
        .unwrap();

        cb.execute(|| Err::<(), _>(())).unwrap_err();
        cb.execute(|| Err::<(), _>(())).unwrap_err();
        clock.advance(Duration::from_secs(12));
        cb.execute(|| Ok::<_, ()>(())).unwrap();

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(tracker.last_open(), Some(Duration::from_secs(12)));
        assert_eq!(tracker.total_open(), Duration::from_secs(12));
    }
}
