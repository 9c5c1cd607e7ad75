//! Batch admission against the configured quotas.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use relay_types::{DispatchError, QuotaViolation};

use crate::error::LimitResult;
use crate::limits::ResourceLimits;
use crate::rate_limiter::RateLimiter;
use crate::tracker::LimitTracker;
use crate::{from_micros, to_micros};

/// Process-wide quota authority.
///
/// Holds the cost committed by every settled batch and, when a rate is
/// configured, the shared [`RateLimiter`].
#[derive(Debug)]
pub struct ResourceLimiter {
    limits: ResourceLimits,
    committed_micros: AtomicU64,
    rate_limiter: Option<Arc<RateLimiter>>,
}

impl ResourceLimiter {
    pub fn new(limits: ResourceLimits) -> LimitResult<Arc<Self>> {
        limits.validate()?;
        let rate_limiter = match limits.requests_per_second {
            Some(rps) => Some(Arc::new(RateLimiter::new(rps, limits.burst)?)),
            None => None,
        };
        Ok(Arc::new(Self {
            limits,
            committed_micros: AtomicU64::new(0),
            rate_limiter,
        }))
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn rate_limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.rate_limiter.as_ref()
    }

    /// Cost committed by settled batches.
    pub fn committed_cost(&self) -> f64 {
        from_micros(self.committed_micros.load(Ordering::SeqCst))
    }

    pub fn remaining_budget(&self) -> f64 {
        from_micros(self.remaining_micros())
    }

    fn remaining_micros(&self) -> u64 {
        to_micros(self.limits.max_total_cost)
            .saturating_sub(self.committed_micros.load(Ordering::SeqCst))
    }

    pub(crate) fn commit(&self, micros: u64) {
        self.committed_micros.fetch_add(micros, Ordering::SeqCst);
    }

    /// Admit a batch of `n` tasks at delegation `depth`, or reject it whole.
    #[instrument(skip(self), fields(max_tasks = self.limits.max_total_tasks))]
    pub fn admit(self: &Arc<Self>, n: usize, depth: u32) -> Result<LimitTracker, DispatchError> {
        if n > self.limits.max_total_tasks {
            return Err(self.reject(QuotaViolation::TooManyTasks {
                requested: n,
                max: self.limits.max_total_tasks,
            }));
        }
        if depth > self.limits.max_recursion_depth {
            return Err(self.reject(QuotaViolation::RecursionDepth {
                depth,
                max: self.limits.max_recursion_depth,
            }));
        }

        let projected = to_micros(self.limits.cost_per_task_estimate).saturating_mul(n as u64);
        let remaining = self.remaining_micros();
        if projected > remaining {
            return Err(self.reject(QuotaViolation::CostBudget {
                projected: from_micros(projected),
                remaining: from_micros(remaining),
            }));
        }

        debug!(n, depth, projected = from_micros(projected), "Batch admitted");
        Ok(LimitTracker::new(Arc::clone(self), n, depth))
    }

    fn reject(&self, violation: QuotaViolation) -> DispatchError {
        warn!(%violation, "Batch rejected at admission");
        DispatchError::QuotaExceeded(violation)
    }
}
