//! Circuit breaker for remote targets.
//!
//! Stops calling a target that keeps failing and periodically lets a
//! single trial through to find out whether it has recovered.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use relay_types::DispatchError;

use crate::config::CircuitBreakerConfig;

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,

    /// Requests fail fast.
    Open,

    /// Cool-down elapsed; one trial decides whether to close again.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    last_transition: DateTime<Utc>,
}

/// Circuit breaker for a single target.
///
/// - Closed: calls allowed; `failure_threshold` consecutive failures open it.
/// - Open: calls rejected until `cool_down` has elapsed.
/// - Half-Open: exactly one trial is admitted. Success closes the circuit,
///   failure re-opens it.
#[derive(Debug)]
pub struct CircuitBreaker {
    target: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(target: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            target: target.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
                last_transition: Utc::now(),
            }),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, moving Open to Half-Open once the cool-down has elapsed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.check_cool_down(&mut inner);
        inner.state
    }

    /// Whether a call would be admitted right now. Does not reserve the trial.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        self.check_cool_down(&mut inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => !inner.trial_in_flight,
        }
    }

    /// Reserve a call slot. In Half-Open only the first caller gets one.
    pub fn try_acquire(&self) -> Option<CallPermit<'_>> {
        let mut inner = self.inner.lock();
        self.check_cool_down(&mut inner);
        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => return None,
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return None;
                }
                inner.trial_in_flight = true;
                debug!(circuit = %self.target, "Circuit breaker admitting trial");
                true
            }
        };
        Some(CallPermit {
            breaker: self,
            trial,
            resolved: false,
        })
    }

    /// Reserve a call slot or fail fast with [`DispatchError::CircuitOpen`].
    pub fn guard(&self) -> Result<CallPermit<'_>, DispatchError> {
        self.try_acquire().ok_or_else(|| DispatchError::CircuitOpen {
            target: self.target.clone(),
        })
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                info!(circuit = %self.target, "Circuit breaker closing after successful trial");
                self.transition_to(&mut inner, CircuitState::Closed);
            }
            CircuitState::Open => {
                debug!(circuit = %self.target, "Success recorded while circuit open");
            }
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        circuit = %self.target,
                        failures = inner.consecutive_failures,
                        "Circuit breaker opening due to failures"
                    );
                    self.transition_to(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                warn!(circuit = %self.target, "Circuit breaker re-opening after failed trial");
                self.transition_to(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Force the circuit to a specific state.
    pub fn force_state(&self, new_state: CircuitState) {
        let mut inner = self.inner.lock();
        info!(
            circuit = %self.target,
            old_state = %inner.state,
            new_state = %new_state,
            "Circuit breaker state forced"
        );
        self.transition_to(&mut inner, new_state);
    }

    pub fn reset(&self) {
        self.force_state(CircuitState::Closed);
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.inner.lock();
        self.check_cool_down(&mut inner);
        CircuitBreakerStats {
            target: self.target.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_transition: inner.last_transition,
        }
    }

    fn release_trial(&self) {
        self.inner.lock().trial_in_flight = false;
    }

    fn check_cool_down(&self, inner: &mut BreakerState) {
        if inner.state != CircuitState::Open {
            return;
        }
        let Some(opened_at) = inner.opened_at else {
            return;
        };
        if opened_at.elapsed() >= self.config.cool_down {
            info!(circuit = %self.target, "Circuit breaker half-open after cool-down");
            self.transition_to(inner, CircuitState::HalfOpen);
        }
    }

    fn transition_to(&self, inner: &mut BreakerState, new_state: CircuitState) {
        inner.state = new_state;
        inner.last_transition = Utc::now();
        inner.trial_in_flight = false;
        match new_state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                inner.opened_at = None;
            }
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::HalfOpen => {}
        }
    }
}

/// A reserved call slot.
///
/// Resolve it with [`succeed`](Self::succeed) or [`fail`](Self::fail).
/// Dropping it unresolved frees a half-open trial without changing state.
#[derive(Debug)]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    resolved: bool,
}

impl CallPermit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn succeed(mut self) {
        self.resolved = true;
        self.breaker.record_success();
    }

    pub fn fail(mut self) {
        self.resolved = true;
        self.breaker.record_failure();
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.resolved {
            self.breaker.release_trial();
        }
    }
}

/// Snapshot of a circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    pub target: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_transition: DateTime<Utc>,
}
