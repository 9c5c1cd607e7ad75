//! Fan-out batches.
//!
//! A [`BatchRequest`] binds one template to many argument sets. Every
//! resulting [`DispatchTask`] goes through admission, the idempotency cache,
//! a concurrency permit and the batch's recovery policy; each outbound
//! attempt draws its own rate-limit token.
//! Results come back in input order no matter when each task finished.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};

use relay_aggregate::Aggregation;
use relay_limits::{BatchUsage, LimitTracker, ResourceLimiter};
use relay_recovery::PartialOutcome;
use relay_security::fingerprint;
use relay_types::{
    BackendRef, DispatchError, DispatchResult, DispatchTask, ErrorClass, ErrorPolicy, RequestId,
    StepId,
};

use crate::dispatcher::{DispatchContext, HybridDispatcher};

/// One template fanned out over many argument sets.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub request_id: Option<RequestId>,
    pub step_id: Option<StepId>,
    pub target: BackendRef,
    /// Prompt with `{name}` placeholders bound per argument set.
    pub template: Option<String>,
    pub argument_sets: Vec<Map<String, Value>>,
    pub task_timeout: Option<Duration>,
    pub policy: ErrorPolicy,
    pub depth: u32,
    pub aggregation: Option<Aggregation>,
}

impl BatchRequest {
    pub fn new(target: BackendRef, argument_sets: Vec<Map<String, Value>>) -> Self {
        Self {
            request_id: None,
            step_id: None,
            target,
            template: None,
            argument_sets,
            task_timeout: None,
            policy: ErrorPolicy::PartialSuccess,
            depth: 0,
            aggregation: None,
        }
    }

    pub fn for_request(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn with_step(mut self, step_id: StepId) -> Self {
        self.step_id = Some(step_id);
        self
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    pub fn with_policy(mut self, policy: ErrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = Some(aggregation);
        self
    }

    /// One task per argument set, keyed by its idempotency fingerprint.
    pub fn tasks(&self) -> Vec<DispatchTask> {
        self.argument_sets
            .iter()
            .enumerate()
            .map(|(index, arguments)| {
                let mut task = DispatchTask::new(
                    index,
                    self.target.clone(),
                    self.template.clone().unwrap_or_default(),
                    arguments.clone(),
                );
                if let Some(timeout) = self.task_timeout {
                    task = task.with_timeout(timeout);
                }
                let key = fingerprint(&task.target, self.template.as_deref(), &self.input_for(&task));
                task.with_idempotency_key(key)
            })
            .collect()
    }

    /// Value handed to the backend for `task`.
    fn input_for(&self, task: &DispatchTask) -> Value {
        match self.template {
            Some(_) => task.payload(),
            None => Value::Object(task.arguments.clone()),
        }
    }
}

/// Settled batch.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    /// One result per argument set, in input order.
    pub results: Vec<DispatchResult>,
    pub partial: PartialOutcome,
    pub usage: BatchUsage,
    /// The request's aggregation applied to `results`.
    pub aggregate: Option<Value>,
}

/// Runs fan-out batches against a dispatcher under shared resource limits.
#[derive(Debug, Clone)]
pub struct BatchExecutor {
    dispatcher: Arc<HybridDispatcher>,
    limiter: Arc<ResourceLimiter>,
}

impl BatchExecutor {
    pub fn new(dispatcher: Arc<HybridDispatcher>, limiter: Arc<ResourceLimiter>) -> Self {
        Self {
            dispatcher,
            limiter,
        }
    }

    pub fn dispatcher(&self) -> &Arc<HybridDispatcher> {
        &self.dispatcher
    }

    pub fn limiter(&self) -> &Arc<ResourceLimiter> {
        &self.limiter
    }

    /// Run every task of `request` and settle the batch.
    ///
    /// Admission failures are returned before any task starts. Quota checks
    /// on the settled batch (minimum successes, failure rate) run once, after
    /// every task has finished. Under [`ErrorPolicy::Raise`] the first failure
    /// cancels the remaining tasks and is returned as the error.
    #[instrument(skip(self, request), fields(backend = %request.target, tasks = request.argument_sets.len()))]
    pub async fn run(&self, request: BatchRequest) -> Result<BatchOutcome, DispatchError> {
        let tracker = self
            .limiter
            .admit(request.argument_sets.len(), request.depth)?;
        let limits = self.limiter.limits();
        let semaphore = Semaphore::new(limits.max_concurrent.max(1));
        let task_timeout = limits.task_timeout(request.task_timeout);

        let units = request
            .tasks()
            .into_iter()
            .map(|task| self.run_task(&request, task, &tracker, &semaphore, task_timeout));
        let joined = futures::future::join_all(units);
        tokio::pin!(joined);
        let deadline = tokio::time::sleep_until(tracker.deadline());
        tokio::pin!(deadline);

        let mut deadline_expired = false;
        let mut results = tokio::select! {
            results = &mut joined => results,
            _ = &mut deadline => {
                warn!(
                    elapsed_ms = tracker.elapsed().as_millis() as u64,
                    "Batch exceeded max duration, cancelling in-flight tasks"
                );
                deadline_expired = !tracker.is_cancelled();
                tracker.cancel();
                joined.await
            }
        };
        if deadline_expired {
            expire_stragglers(&mut results, limits.max_batch_duration);
        }

        let settled = tracker.settle();
        if matches!(request.policy, ErrorPolicy::Raise) {
            if let Some(error) = first_failure(&results) {
                return Err(error);
            }
        }
        let usage = settled?;

        let partial = PartialOutcome::from_results(&results);
        let aggregate = request.aggregation.as_ref().map(|a| a.apply(&results));
        info!(
            succeeded = usage.succeeded,
            failed = usage.failed,
            cache_hits = usage.cache_hits,
            cost = usage.cost,
            "Batch settled"
        );
        Ok(BatchOutcome {
            results,
            partial,
            usage,
            aggregate,
        })
    }

    async fn run_task(
        &self,
        request: &BatchRequest,
        task: DispatchTask,
        tracker: &LimitTracker,
        semaphore: &Semaphore,
        timeout: Duration,
    ) -> DispatchResult {
        let started = Instant::now();
        let input = request.input_for(&task);
        let template = request.template.as_deref();
        let cancel = tracker.cancellation_token();
        let mut ctx = DispatchContext::new()
            .with_depth(request.depth)
            .with_timeout(timeout)
            .with_cancel(cancel.clone())
            .with_rate_limiter(tracker.limiter().rate_limiter().cloned());
        ctx.request_id = request.request_id.clone();
        ctx.step_id = request.step_id.clone();

        if let Some(hit) = self.dispatcher.cached_output(&ctx, &task.target, template, &input) {
            tracker.record_cache_hit();
            return DispatchResult::succeeded(task.index, task.target, hit);
        }

        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracker.record_failure(0.0);
                return DispatchResult::failed(task.index, task.target, DispatchError::cancelled("batch cancelled"));
            }
            permit = semaphore.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    tracker.record_failure(0.0);
                    return DispatchResult::failed(task.index, task.target, DispatchError::Internal("concurrency gate closed".into()));
                }
            },
        };

        let _in_flight = tracker.begin();
        let outcome = self
            .dispatcher
            .dispatch_with_policy(&ctx, &request.policy, &task.target, template, &input)
            .await;

        match outcome {
            Ok(recovered) => {
                if recovered.value.cache_hit {
                    tracker.record_cache_hit();
                } else {
                    tracker.record_success(recovered.value.cost);
                }
                DispatchResult::succeeded(task.index, recovered.target, recovered.value)
                    .with_attempts(recovered.attempts)
                    .with_trail(recovered.trail)
                    .with_duration(started.elapsed())
            }
            Err(failure) => {
                tracker.record_failure(0.0);
                if matches!(request.policy, ErrorPolicy::Raise) {
                    tracker.cancel();
                }
                DispatchResult::failed(task.index, task.target, failure.error)
                    .with_attempts(failure.attempts)
                    .with_trail(failure.trail)
                    .with_duration(started.elapsed())
            }
        }
    }
}

/// Units cut off by the batch ceiling report a timeout rather than a cancellation.
fn expire_stragglers(results: &mut [DispatchResult], ceiling: Duration) {
    for result in results.iter_mut() {
        if let Some(error) = result.error.as_mut() {
            if error.class() == ErrorClass::Cancelled {
                *error = DispatchError::timeout(ceiling);
            }
        }
    }
}

/// First failure in input order, preferring a root cause over cancellations it triggered.
fn first_failure(results: &[DispatchResult]) -> Option<DispatchError> {
    let errors: Vec<&DispatchError> = results.iter().filter_map(|r| r.error.as_ref()).collect();
    errors
        .iter()
        .find(|e| e.class() != ErrorClass::Cancelled)
        .or_else(|| errors.first())
        .map(|e| (*e).clone())
}
