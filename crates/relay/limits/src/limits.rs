//! Resource limit configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LimitError, LimitResult};

/// Quotas applied to each batch and to the process-wide budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Total cost the limiter may commit across all settled batches.
    pub max_total_cost: f64,

    /// Maximum units running at once.
    pub max_concurrent: usize,

    /// Maximum tasks in one batch.
    pub max_total_tasks: usize,

    /// Ceiling on any single unit's timeout.
    pub max_task_duration: Duration,

    /// Wall-clock ceiling for a whole batch.
    pub max_batch_duration: Duration,

    /// Sustained dispatch rate. `None` disables rate limiting.
    pub requests_per_second: Option<f64>,

    /// Token bucket capacity.
    pub burst: u32,

    /// Failure ratio above which a settled batch is rejected.
    pub max_failure_rate: f64,

    /// Successes a settled batch must reach.
    pub min_success_count: usize,

    /// Deepest delegation chain admitted.
    pub max_recursion_depth: u32,

    /// Cost assumed per task when projecting a batch against the budget.
    pub cost_per_task_estimate: f64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_total_cost: 100.0,
            max_concurrent: 10,
            max_total_tasks: 1_000,
            max_task_duration: Duration::from_secs(30),
            max_batch_duration: Duration::from_secs(300),
            requests_per_second: None,
            burst: 1,
            max_failure_rate: 1.0,
            min_success_count: 0,
            max_recursion_depth: 3,
            cost_per_task_estimate: 0.01,
        }
    }
}

impl ResourceLimits {
    pub fn with_max_total_cost(mut self, cost: f64) -> Self {
        self.max_total_cost = cost;
        self
    }

    pub fn with_cost_per_task(mut self, cost: f64) -> Self {
        self.cost_per_task_estimate = cost;
        self
    }

    pub fn with_max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n;
        self
    }

    pub fn with_max_total_tasks(mut self, n: usize) -> Self {
        self.max_total_tasks = n;
        self
    }

    pub fn with_rate(mut self, requests_per_second: f64, burst: u32) -> Self {
        self.requests_per_second = Some(requests_per_second);
        self.burst = burst;
        self
    }

    pub fn with_min_success(mut self, n: usize) -> Self {
        self.min_success_count = n;
        self
    }

    pub fn with_max_failure_rate(mut self, rate: f64) -> Self {
        self.max_failure_rate = rate;
        self
    }

    pub fn with_max_recursion_depth(mut self, depth: u32) -> Self {
        self.max_recursion_depth = depth;
        self
    }

    pub fn with_task_duration(mut self, d: Duration) -> Self {
        self.max_task_duration = d;
        self
    }

    pub fn with_batch_duration(mut self, d: Duration) -> Self {
        self.max_batch_duration = d;
        self
    }

    /// Effective timeout for one unit: the requested one, capped at `max_task_duration`.
    pub fn task_timeout(&self, requested: Option<Duration>) -> Duration {
        requested
            .map(|d| d.min(self.max_task_duration))
            .unwrap_or(self.max_task_duration)
    }

    pub fn validate(&self) -> LimitResult<()> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> LimitResult<()> {
            Err(LimitError::InvalidLimit {
                field,
                reason: reason.into(),
            })
        }

        if !self.max_total_cost.is_finite() || self.max_total_cost < 0.0 {
            return invalid("max_total_cost", "must be a finite non-negative number");
        }
        if !self.cost_per_task_estimate.is_finite() || self.cost_per_task_estimate < 0.0 {
            return invalid("cost_per_task_estimate", "must be a finite non-negative number");
        }
        if self.max_concurrent == 0 {
            return invalid("max_concurrent", "must be at least 1");
        }
        if self.burst == 0 {
            return invalid("burst", "must be at least 1");
        }
        if let Some(rps) = self.requests_per_second {
            if !rps.is_finite() || rps <= 0.0 {
                return invalid("requests_per_second", "must be positive");
            }
        }
        if !(0.0..=1.0).contains(&self.max_failure_rate) {
            return invalid("max_failure_rate", "must be within 0.0..=1.0");
        }
        if self.max_task_duration.is_zero() {
            return invalid("max_task_duration", "must be non-zero");
        }
        if self.max_batch_duration.is_zero() {
            return invalid("max_batch_duration", "must be non-zero");
        }
        Ok(())
    }
}
