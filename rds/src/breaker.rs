//! Consecutive-failure circuit breaker.
//!
//! Shared by the controller plane (one breaker guarding the appliance
//! channel) and the node plane (one breaker per staged volume to stop
//! retry storms against a wedged device).

use parking_lot::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    /// Numeric encoding used by the breaker state gauges.
    pub fn as_gauge(&self) -> i64 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::Open => 1,
            BreakerState::HalfOpen => 2,
        }
    }
}

#[derive(Debug)]
enum Inner {
    Closed { failures: u32, last_failure: Option<Instant> },
    Open { since: Instant },
    HalfOpen,
}

/// Opens after `threshold` consecutive failures inside the rolling
/// `window`; stays open for `cooldown`, then lets a single probe
/// through. The probe's outcome closes or re-opens the breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    window: Duration,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(
        name: &str,
        threshold: u32,
        window: Duration,
        cooldown: Duration,
    ) -> Self {
        Self {
            name: name.to_string(),
            threshold: threshold.max(1),
            window,
            cooldown,
            inner: Mutex::new(Inner::Closed {
                failures: 0,
                last_failure: None,
            }),
        }
    }

    /// May an attempt proceed right now? Transitioning out of `Open`
    /// and claiming the half-open probe slot are one atomic step.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock();
        match &*inner {
            Inner::Closed { .. } => true,
            Inner::Open { since } => {
                if since.elapsed() >= self.cooldown {
                    debug!("breaker '{}' half-open, probing", self.name);
                    *inner = Inner::HalfOpen;
                    true
                } else {
                    false
                }
            }
            // a probe is already in flight
            Inner::HalfOpen => false,
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock();
        if matches!(&*inner, Inner::HalfOpen | Inner::Open { .. }) {
            info!("breaker '{}' closed", self.name);
        }
        *inner = Inner::Closed {
            failures: 0,
            last_failure: None,
        };
    }

    pub fn on_failure(&self) {
        let mut inner = self.inner.lock();
        match &mut *inner {
            Inner::Closed {
                failures,
                last_failure,
            } => {
                let now = Instant::now();
                let stale = last_failure
                    .map(|at| now.duration_since(at) > self.window)
                    .unwrap_or(false);
                *failures = if stale { 1 } else { *failures + 1 };
                *last_failure = Some(now);
                if *failures >= self.threshold {
                    warn!(
                        "breaker '{}' open after {} consecutive failures",
                        self.name, failures
                    );
                    *inner = Inner::Open { since: now };
                }
            }
            Inner::HalfOpen => {
                warn!("breaker '{}' re-opened, probe failed", self.name);
                *inner = Inner::Open {
                    since: Instant::now(),
                };
            }
            Inner::Open { .. } => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        match &*self.inner.lock() {
            Inner::Closed { .. } => BreakerState::Closed,
            Inner::Open { .. } => BreakerState::Open,
            Inner::HalfOpen => BreakerState::HalfOpen,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown: Duration) -> CircuitBreaker {
        CircuitBreaker::new("test", threshold, Duration::from_secs(60), cooldown)
    }

    #[test]
    fn opens_after_threshold_failures() {
        let b = breaker(3, Duration::from_secs(30));
        assert!(b.allow());
        b.on_failure();
        b.on_failure();
        assert_eq!(b.state(), BreakerState::Closed);
        b.on_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.allow());
    }

    #[test]
    fn success_resets_the_failure_count() {
        let b = breaker(3, Duration::from_secs(30));
        b.on_failure();
        b.on_failure();
        b.on_success();
        b.on_failure();
        b.on_failure();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_allows_exactly_one_probe() {
        let b = breaker(1, Duration::from_millis(10));
        b.on_failure();
        assert!(!b.allow());
        std::thread::sleep(Duration::from_millis(20));
        assert!(b.allow());
        // second caller must wait for the probe verdict
        assert!(!b.allow());
    }

    #[test]
    fn probe_outcome_decides_state() {
        let b = breaker(1, Duration::from_millis(10));
        b.on_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert!(b.allow());
        b.on_failure();
        assert_eq!(b.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(20));
        assert!(b.allow());
        b.on_success();
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.allow());
    }
}
