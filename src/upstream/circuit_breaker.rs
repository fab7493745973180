use crate::config::CircuitBreakerConfig;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Failure tracker guarding one backend target.
///
/// The state machine lives behind a per-target mutex so transitions are
/// total-ordered; every critical section is a couple of compares. A
/// breaker built from an absent or disabled config never trips — it
/// behaves as permanently Closed.
pub struct CircuitBreaker {
    inner: Option<Breaker>,
}

struct Breaker {
    failure_threshold: u32,
    success_threshold: u32,
    open_duration: Duration,
    state: Mutex<BreakerState>,
}

/// Closed → Open → HalfOpen → Closed/Open, each state carrying exactly
/// the data it needs.
enum BreakerState {
    /// Normal traffic; counts the current failure streak.
    Closed { failures: u32 },
    /// Target excluded from selection since `since`.
    Open { since: Instant },
    /// Probing; counts successes toward closing.
    HalfOpen { successes: u32 },
}

impl CircuitBreaker {
    /// Build from the upstream's breaker config. `None` (or
    /// `enabled: false`) yields the no-op breaker.
    pub fn from_config(config: Option<&CircuitBreakerConfig>) -> Self {
        let inner = config.filter(|cb| cb.enabled).map(|cb| Breaker {
            failure_threshold: cb.failure_threshold.max(1),
            success_threshold: cb.success_threshold.max(1),
            open_duration: Duration::from_secs(cb.open_duration_secs),
            state: Mutex::new(BreakerState::Closed { failures: 0 }),
        });
        Self { inner }
    }

    pub fn disabled() -> Self {
        Self { inner: None }
    }

    /// Whether a request may go to the guarded target.
    ///
    /// Closed admits everything. Open rejects until the open duration
    /// has elapsed; the first caller past the deadline flips the state
    /// to HalfOpen and is admitted as the probe. HalfOpen admits
    /// requests until a probe result settles the state.
    pub fn allow(&self) -> bool {
        let Some(breaker) = &self.inner else {
            return true;
        };
        let mut state = breaker.state.lock().unwrap();
        match *state {
            BreakerState::Closed { .. } | BreakerState::HalfOpen { .. } => true,
            BreakerState::Open { since } => {
                if since.elapsed() >= breaker.open_duration {
                    *state = BreakerState::HalfOpen { successes: 0 };
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let Some(breaker) = &self.inner else {
            return;
        };
        let mut state = breaker.state.lock().unwrap();
        match *state {
            BreakerState::Closed { ref mut failures } => *failures = 0,
            BreakerState::HalfOpen { successes } => {
                let successes = successes + 1;
                if successes >= breaker.success_threshold {
                    *state = BreakerState::Closed { failures: 0 };
                    tracing::info!(
                        "circuit_breaker: closed (recovered after {} successes)",
                        successes
                    );
                } else {
                    *state = BreakerState::HalfOpen { successes };
                }
            }
            BreakerState::Open { .. } => {}
        }
    }

    pub fn record_failure(&self) {
        let Some(breaker) = &self.inner else {
            return;
        };
        let mut state = breaker.state.lock().unwrap();
        match *state {
            BreakerState::Closed { failures } => {
                let failures = failures + 1;
                if failures >= breaker.failure_threshold {
                    *state = BreakerState::Open {
                        since: Instant::now(),
                    };
                    tracing::warn!(
                        "circuit_breaker: opened (after {} consecutive failures)",
                        failures
                    );
                } else {
                    *state = BreakerState::Closed { failures };
                }
            }
            BreakerState::HalfOpen { .. } => {
                *state = BreakerState::Open {
                    since: Instant::now(),
                };
                tracing::warn!("circuit_breaker: re-opened (probe failed in half-open)");
            }
            BreakerState::Open { .. } => {}
        }
    }

    /// Human-readable state for the admin health listing. The no-op
    /// breaker reads as "closed".
    pub fn state_name(&self) -> &'static str {
        match &self.inner {
            None => "closed",
            Some(breaker) => match *breaker.state.lock().unwrap() {
                BreakerState::Closed { .. } => "closed",
                BreakerState::Open { .. } => "open",
                BreakerState::HalfOpen { .. } => "half_open",
            },
        }
    }
}
