use manifold_config::CircuitBreakerConfig;
use manifold_primitives::{GatewayError, UpstreamId};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU8, Ordering},
    time::Instant,
};
use tracing::debug;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Lock-free view of a breaker's state for observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerSnapshot {
    /// Requests flow normally.
    Closed,
    /// All requests are rejected.
    Open,
    /// Exactly one probe is admitted.
    HalfOpen,
}

#[derive(Debug)]
enum State {
    Closed { outcomes: VecDeque<bool> },
    Open { since: Instant },
    HalfOpen { probe_inflight: bool },
}

/// Per-upstream circuit breaker.
///
/// Closed tracks a rolling window of outcomes and opens once the failure
/// ratio crosses the configured threshold. Open rejects everything until
/// `half_open_after` elapses, then admits exactly one probe; the probe's
/// outcome decides between closing and re-opening.
#[derive(Debug)]
pub struct CircuitBreaker {
    upstream: UpstreamId,
    config: CircuitBreakerConfig,
    state: Mutex<State>,
    /// Mirror of the state tag so observers never take the lock.
    tag: AtomicU8,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(upstream: UpstreamId, config: CircuitBreakerConfig) -> Self {
        Self {
            upstream,
            config,
            state: Mutex::new(State::Closed { outcomes: VecDeque::new() }),
            tag: AtomicU8::new(STATE_CLOSED),
        }
    }

    /// Lock-free state peek.
    pub fn snapshot(&self) -> BreakerSnapshot {
        match self.tag.load(Ordering::Acquire) {
            STATE_OPEN => BreakerSnapshot::Open,
            STATE_HALF_OPEN => BreakerSnapshot::HalfOpen,
            _ => BreakerSnapshot::Closed,
        }
    }

    /// Admits or rejects a request. Returns `true` if the caller holds the
    /// half-open probe slot and must resolve it.
    ///
    /// An `open` breaker transitions to half-open once the cool-down has
    /// elapsed, admitting the caller as the single probe.
    pub fn try_acquire(&self) -> Result<bool, GatewayError> {
        let mut state = self.state.lock();
        match &mut *state {
            State::Closed { .. } => Ok(false),
            State::Open { since } => {
                if since.elapsed() >= self.config.half_open_after {
                    debug!(target: "upstream::breaker", upstream = %self.upstream, "entering half-open");
                    *state = State::HalfOpen { probe_inflight: true };
                    self.tag.store(STATE_HALF_OPEN, Ordering::Release);
                    Ok(true)
                } else {
                    Err(GatewayError::circuit_open(&self.upstream))
                }
            }
            State::HalfOpen { probe_inflight } => {
                if *probe_inflight {
                    Err(GatewayError::circuit_open(&self.upstream))
                } else {
                    *probe_inflight = true;
                    Ok(true)
                }
            }
        }
    }

    /// Records a successful outcome. Closes the breaker if this was the
    /// half-open probe.
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        match &mut *state {
            State::Closed { outcomes } => {
                Self::push_outcome(&self.config, outcomes, true);
            }
            State::HalfOpen { .. } => {
                debug!(target: "upstream::breaker", upstream = %self.upstream, "probe succeeded, closing");
                *state = State::Closed { outcomes: VecDeque::new() };
                self.tag.store(STATE_CLOSED, Ordering::Release);
            }
            State::Open { .. } => {}
        }
    }

    /// Records a failed outcome. May open the breaker.
    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        match &mut *state {
            State::Closed { outcomes } => {
                Self::push_outcome(&self.config, outcomes, false);
                let failures = outcomes.iter().filter(|ok| !**ok).count();
                if outcomes.len() >= self.config.min_samples &&
                    failures as f64 / outcomes.len() as f64 >= self.config.failure_ratio
                {
                    debug!(
                        target: "upstream::breaker",
                        upstream = %self.upstream,
                        failures,
                        samples = outcomes.len(),
                        "failure ratio crossed, opening"
                    );
                    *state = State::Open { since: Instant::now() };
                    self.tag.store(STATE_OPEN, Ordering::Release);
                }
            }
            State::HalfOpen { .. } => {
                debug!(target: "upstream::breaker", upstream = %self.upstream, "probe failed, re-opening");
                *state = State::Open { since: Instant::now() };
                self.tag.store(STATE_OPEN, Ordering::Release);
            }
            State::Open { .. } => {}
        }
    }

    /// Releases a half-open probe slot whose outcome was never recorded,
    /// e.g. a cancelled hedge attempt.
    pub fn release_probe(&self) {
        let mut state = self.state.lock();
        if let State::HalfOpen { probe_inflight } = &mut *state {
            *probe_inflight = false;
        }
    }

    fn push_outcome(config: &CircuitBreakerConfig, outcomes: &mut VecDeque<bool>, ok: bool) {
        outcomes.push_back(ok);
        while outcomes.len() > config.sample_window {
            outcomes.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn breaker(half_open_after: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            UpstreamId::new("a"),
            CircuitBreakerConfig {
                failure_ratio: 0.5,
                sample_window: 10,
                min_samples: 4,
                half_open_after,
            },
        )
    }

    #[test]
    fn opens_on_failure_ratio() {
        let breaker = breaker(Duration::from_secs(300));
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.snapshot(), BreakerSnapshot::Closed);
        breaker.record_failure();
        assert_eq!(breaker.snapshot(), BreakerSnapshot::Open);
        assert!(breaker.try_acquire().is_err());
    }

    #[test]
    fn half_open_admits_one_probe() {
        let breaker = breaker(Duration::ZERO);
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert_eq!(breaker.snapshot(), BreakerSnapshot::Open);

        // cool-down of zero: next acquire is the probe
        assert!(breaker.try_acquire().is_ok());
        assert_eq!(breaker.snapshot(), BreakerSnapshot::HalfOpen);
        assert!(breaker.try_acquire().is_err());

        breaker.record_success();
        assert_eq!(breaker.snapshot(), BreakerSnapshot::Closed);
        assert!(breaker.try_acquire().is_ok());
    }

    #[test]
    fn failed_probe_reopens() {
        let breaker = breaker(Duration::ZERO);
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert!(breaker.try_acquire().is_ok());
        breaker.record_failure();
        assert_eq!(breaker.snapshot(), BreakerSnapshot::Open);
    }

    #[test]
    fn released_probe_can_be_retaken() {
        let breaker = breaker(Duration::ZERO);
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert!(breaker.try_acquire().is_ok());
        assert!(breaker.try_acquire().is_err());
        breaker.release_probe();
        assert!(breaker.try_acquire().is_ok());
    }
}
