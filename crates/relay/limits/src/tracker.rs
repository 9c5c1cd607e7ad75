//! Per-batch accounting.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use relay_types::{DispatchError, QuotaViolation};

use crate::limiter::ResourceLimiter;
use crate::{from_micros, to_micros};

/// Usage of one settled batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchUsage {
    pub admitted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cache_hits: usize,
    pub cost: f64,
    pub peak_in_flight: usize,
    pub elapsed: Duration,
}

impl BatchUsage {
    pub fn failure_rate(&self) -> f64 {
        let total = self.succeeded + self.failed;
        if total == 0 {
            0.0
        } else {
            self.failed as f64 / total as f64
        }
    }
}

#[derive(Debug)]
struct TrackerState {
    limiter: Arc<ResourceLimiter>,
    admitted: usize,
    depth: u32,
    started: Instant,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    cost_micros: AtomicU64,
    successes: AtomicUsize,
    failures: AtomicUsize,
    cache_hits: AtomicUsize,
    settled: AtomicBool,
    cancel: CancellationToken,
}

/// Accounting handle for one admitted batch. Clones share state.
#[derive(Debug, Clone)]
pub struct LimitTracker {
    state: Arc<TrackerState>,
}

/// RAII marker for one unit in flight.
#[derive(Debug)]
pub struct InFlight {
    state: Arc<TrackerState>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl LimitTracker {
    pub(crate) fn new(limiter: Arc<ResourceLimiter>, admitted: usize, depth: u32) -> Self {
        Self {
            state: Arc::new(TrackerState {
                limiter,
                admitted,
                depth,
                started: Instant::now(),
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
                cost_micros: AtomicU64::new(0),
                successes: AtomicUsize::new(0),
                failures: AtomicUsize::new(0),
                cache_hits: AtomicUsize::new(0),
                settled: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn admitted(&self) -> usize {
        self.state.admitted
    }

    pub fn depth(&self) -> u32 {
        self.state.depth
    }

    pub fn limiter(&self) -> &Arc<ResourceLimiter> {
        &self.state.limiter
    }

    /// Mark a unit as started. The unit stays in flight until the guard drops.
    pub fn begin(&self) -> InFlight {
        let now = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight {
            state: Arc::clone(&self.state),
        }
    }

    pub fn record_success(&self, cost: f64) {
        self.state.successes.fetch_add(1, Ordering::SeqCst);
        self.state
            .cost_micros
            .fetch_add(to_micros(cost), Ordering::SeqCst);
    }

    pub fn record_failure(&self, cost: f64) {
        self.state.failures.fetch_add(1, Ordering::SeqCst);
        self.state
            .cost_micros
            .fetch_add(to_micros(cost), Ordering::SeqCst);
    }

    /// A unit served from the idempotency cache: a success with no cost.
    pub fn record_cache_hit(&self) {
        self.state.successes.fetch_add(1, Ordering::SeqCst);
        self.state.cache_hits.fetch_add(1, Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.state.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn successes(&self) -> usize {
        self.state.successes.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> usize {
        self.state.failures.load(Ordering::SeqCst)
    }

    pub fn cost(&self) -> f64 {
        from_micros(self.state.cost_micros.load(Ordering::SeqCst))
    }

    pub fn elapsed(&self) -> Duration {
        self.state.started.elapsed()
    }

    /// Instant at which the batch exceeds `max_batch_duration`.
    pub fn deadline(&self) -> Instant {
        self.state.started + self.state.limiter.limits().max_batch_duration
    }

    /// Cancel the batch if it has outlived `max_batch_duration`.
    pub fn check_deadline(&self) -> bool {
        if Instant::now() >= self.deadline() && !self.is_cancelled() {
            warn!(
                elapsed_ms = self.elapsed().as_millis() as u64,
                "Batch exceeded max duration, cancelling in-flight units"
            );
            self.cancel();
        }
        self.is_cancelled()
    }

    pub fn cancel(&self) {
        self.state.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancel.is_cancelled()
    }

    /// Token cancelled when the batch is cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.state.cancel.clone()
    }

    pub fn usage(&self) -> BatchUsage {
        BatchUsage {
            admitted: self.state.admitted,
            succeeded: self.successes(),
            failed: self.failures(),
            cache_hits: self.state.cache_hits.load(Ordering::SeqCst),
            cost: self.cost(),
            peak_in_flight: self.peak_in_flight(),
            elapsed: self.elapsed(),
        }
    }

    /// Commit the batch's cost and run the post-batch quota checks.
    ///
    /// Cost is committed exactly once even if `settle` is called again.
    pub fn settle(&self) -> Result<BatchUsage, DispatchError> {
        let usage = self.usage();
        if !self.state.settled.swap(true, Ordering::SeqCst) {
            self.state
                .limiter
                .commit(self.state.cost_micros.load(Ordering::SeqCst));
            info!(
                admitted = usage.admitted,
                succeeded = usage.succeeded,
                failed = usage.failed,
                cost = usage.cost,
                "Batch settled"
            );
        }

        let limits = self.state.limiter.limits();
        if usage.succeeded < limits.min_success_count {
            warn!(
                succeeded = usage.succeeded,
                required = limits.min_success_count,
                "Batch below minimum success count"
            );
            return Err(DispatchError::QuotaExceeded(QuotaViolation::MinSuccess {
                succeeded: usage.succeeded,
                required: limits.min_success_count,
            }));
        }

        let rate = usage.failure_rate();
        if rate > limits.max_failure_rate {
            warn!(rate, max = limits.max_failure_rate, "Batch failure rate exceeded");
            return Err(DispatchError::QuotaExceeded(QuotaViolation::FailureRate {
                rate,
                max: limits.max_failure_rate,
            }));
        }

        Ok(usage)
    }
}
