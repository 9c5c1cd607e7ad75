//! The workflow engine.
//!
//! A run repeatedly takes the ready set (pending steps whose dependencies all
//! have slots), admits it as one batch, dispatches it concurrently, waits
//! for the batch to settle and merges the results into the execution context.
//! Only this loop writes to the context.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use relay_dispatch::{BackendLookup, BatchExecutor, DispatchContext, HybridDispatcher};
use relay_limits::{LimitTracker, ResourceLimiter};
use relay_recovery::{CircuitBreakerRegistry, RecoveryExecutor};
use relay_types::{
    bind_template, DispatchError, ErrorClass, ErrorPolicy, ExecutionContext, FailureCause, Plan,
    PlanResult, RequestId, Slot, Step, StepFailure, StepId,
};

use crate::config::{EngineConfig, FailureMode, RelayConfig};
use crate::error::{ConfigResult, EngineError, EngineResult, RunAborted};
use crate::resolve::{resolve_input, ResolveError};

/// Check a plan's structure before anything runs.
#[instrument(skip(plan), fields(request_id = %plan.request_id, steps = plan.steps.len()))]
pub fn validate_plan(plan: &Plan) -> PlanResult<()> {
    plan.validate().map_err(|error| {
        warn!(%error, "Plan rejected");
        error
    })
}

// ── Run Report ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// Some steps failed under [`FailureMode::ContinueDegraded`].
    Degraded { failed: Vec<StepId> },
}

/// A finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub request_id: RequestId,
    pub context: ExecutionContext,
    pub status: RunStatus,
    /// Steps handed to the dispatcher. Steps failed for an upstream failure are not counted.
    pub steps_dispatched: usize,
    pub total_cost: f64,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn is_complete(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// One error per failed step, in recording order.
    pub fn errors(&self) -> Vec<EngineError> {
        self.context
            .failures()
            .into_iter()
            .map(|failure| match &failure.cause {
                FailureCause::UpstreamFailed { chain } => EngineError::DependencyFailed {
                    step: failure.step_id.clone(),
                    chain: chain.clone(),
                },
                FailureCause::UnresolvedReference { reference } => {
                    EngineError::UnresolvedReference {
                        step: failure.step_id.clone(),
                        reference: reference.clone(),
                    }
                }
                FailureCause::Dispatch { .. } => EngineError::StepFailed(Box::new(failure.clone())),
            })
            .collect()
    }
}

// ── Synthesis ───────────────────────────────────────────────────────

/// Produces the final answer from a completed context. Implemented outside the engine.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(
        &self,
        instruction: Option<&str>,
        context: &ExecutionContext,
    ) -> EngineResult<Value>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedRun {
    pub report: RunReport,
    pub synthesis: Value,
}

// ── Workflow Engine ─────────────────────────────────────────────────

/// Runs plans against a dispatcher under shared resource limits.
#[derive(Debug, Clone)]
pub struct WorkflowEngine {
    dispatcher: Arc<HybridDispatcher>,
    limiter: Arc<ResourceLimiter>,
    /// Concurrency ceiling shared by every run on this engine.
    slots: Arc<Semaphore>,
    config: EngineConfig,
}

impl WorkflowEngine {
    pub fn new(
        dispatcher: Arc<HybridDispatcher>,
        limiter: Arc<ResourceLimiter>,
        config: EngineConfig,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(limiter.limits().max_concurrent.max(1)));
        Self {
            dispatcher,
            limiter,
            slots,
            config,
        }
    }

    /// Assemble an engine and its services from configuration.
    pub fn from_config(config: &RelayConfig, lookup: Arc<dyn BackendLookup>) -> ConfigResult<Self> {
        config.validate()?;
        let limiter = ResourceLimiter::new(config.limits.clone())?;
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));
        let dispatcher = HybridDispatcher::from_config(lookup, &config.dispatcher)?
            .with_recovery(RecoveryExecutor::new(breakers));
        Ok(Self::new(Arc::new(dispatcher), limiter, config.engine.clone()))
    }

    pub fn dispatcher(&self) -> &Arc<HybridDispatcher> {
        &self.dispatcher
    }

    pub fn limiter(&self) -> &Arc<ResourceLimiter> {
        &self.limiter
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Fan-out executor sharing this engine's dispatcher and budget.
    pub fn batch_executor(&self) -> BatchExecutor {
        BatchExecutor::new(Arc::clone(&self.dispatcher), Arc::clone(&self.limiter))
    }

    /// Recovery policy for one step.
    ///
    /// Fallbacks retry each target with the step's retry policy. A step with
    /// neither gets the engine default.
    pub fn policy_for(&self, step: &Step) -> ErrorPolicy {
        if !step.fallbacks.is_empty() {
            ErrorPolicy::Fallback {
                alternatives: step.fallbacks.clone(),
                retry: step.retry.clone(),
            }
        } else if let Some(retry) = &step.retry {
            ErrorPolicy::Retry(retry.clone())
        } else {
            self.config.default_policy.clone()
        }
    }

    /// Run `plan` to completion.
    #[instrument(skip(self, plan), fields(request_id = %plan.request_id, steps = plan.steps.len()))]
    pub async fn run(&self, plan: &Plan) -> Result<RunReport, RunAborted> {
        let started = Instant::now();
        let mut run = RunState {
            context: ExecutionContext::new(plan.request_id.clone()),
            steps_dispatched: 0,
            total_cost: 0.0,
        };

        if let Err(error) = validate_plan(plan) {
            return Err(run.abort(error.into()));
        }

        while run.context.len() < plan.steps.len() {
            let ready: Vec<(usize, &Step)> = plan
                .steps
                .iter()
                .enumerate()
                .filter(|(_, s)| !run.context.contains(&s.id))
                .filter(|(_, s)| s.depends_on.iter().all(|d| run.context.contains(d)))
                .collect();
            if ready.is_empty() {
                return Err(run.abort(EngineError::Internal(
                    "no ready steps in a validated plan".into(),
                )));
            }

            let mut runnable = Vec::new();
            for (order, step) in ready {
                if let Some(chain) = failed_dependency_chain(step, &run.context) {
                    debug!(step = %step.id, "Skipping step with failed dependency");
                    let failure = StepFailure {
                        step_id: step.id.clone(),
                        target: step.target.clone(),
                        attempts: 0,
                        cause: FailureCause::UpstreamFailed { chain },
                        trail: Vec::new(),
                    };
                    if let Err(error) = run.context.record_failure(failure) {
                        return Err(run.abort(error.into()));
                    }
                    continue;
                }
                match resolve_input(&step.input, &step.depends_on, &run.context) {
                    Ok(input) => runnable.push((order, step, input)),
                    Err(ResolveError::Unresolved(reference)) => {
                        return Err(run.abort(EngineError::UnresolvedReference {
                            step: step.id.clone(),
                            reference,
                        }))
                    }
                    Err(ResolveError::DependencyFailed(dependency)) => {
                        return Err(run.abort(EngineError::DependencyFailed {
                            step: step.id.clone(),
                            chain: vec![dependency],
                        }))
                    }
                }
            }
            if runnable.is_empty() {
                continue;
            }

            let first_failure = match self.run_batch(plan, runnable, &mut run).await {
                Ok(first_failure) => first_failure,
                Err(error) => return Err(run.abort(error)),
            };
            if let (FailureMode::AbortAll, Some(failure)) = (self.config.failure_mode, first_failure) {
                warn!(step = %failure.step_id, "Step failed, aborting run");
                return Err(run.abort(EngineError::StepFailed(Box::new(failure))));
            }
        }

        let failed: Vec<StepId> = run
            .context
            .failures()
            .into_iter()
            .map(|f| f.step_id.clone())
            .collect();
        let status = if failed.is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::Degraded { failed }
        };
        info!(
            dispatched = run.steps_dispatched,
            cost = run.total_cost,
            elapsed_ms = started.elapsed().as_millis() as u64,
            degraded = !matches!(status, RunStatus::Completed),
            "Run finished"
        );
        Ok(RunReport {
            request_id: plan.request_id.clone(),
            context: run.context,
            status,
            steps_dispatched: run.steps_dispatched,
            total_cost: run.total_cost,
            elapsed: started.elapsed(),
        })
    }

    /// Run `plan`, then hand its context and synthesis instruction to `synthesizer`.
    pub async fn run_with_synthesis(
        &self,
        plan: &Plan,
        synthesizer: &dyn Synthesizer,
    ) -> Result<SynthesizedRun, RunAborted> {
        let report = self.run(plan).await?;
        match synthesizer
            .synthesize(plan.synthesis.as_deref(), &report.context)
            .await
        {
            Ok(synthesis) => Ok(SynthesizedRun { report, synthesis }),
            Err(error) => Err(RunAborted {
                error,
                partial: report.context,
            }),
        }
    }

    /// Dispatch one ready batch and merge it into the context in plan order.
    ///
    /// Returns the first failed step of the batch, if any.
    async fn run_batch(
        &self,
        plan: &Plan,
        runnable: Vec<(usize, &Step, Value)>,
        run: &mut RunState,
    ) -> EngineResult<Option<StepFailure>> {
        let tracker = self
            .limiter
            .admit(runnable.len(), self.config.depth)
            .map_err(EngineError::Quota)?;
        debug!(batch = runnable.len(), "Dispatching ready steps");

        let mut join_set = JoinSet::new();
        for (order, step, input) in runnable {
            join_set.spawn(
                StepTask {
                    dispatcher: Arc::clone(&self.dispatcher),
                    tracker: tracker.clone(),
                    slots: Arc::clone(&self.slots),
                    request_id: plan.request_id.clone(),
                    order,
                    policy: self.policy_for(step),
                    step: step.clone(),
                    input,
                    depth: self.config.depth,
                }
                .run(),
            );
        }

        let mut outcomes = Vec::new();
        let deadline = tokio::time::sleep_until(tracker.deadline());
        tokio::pin!(deadline);
        let mut deadline_passed = false;
        let mut deadline_expired = false;
        loop {
            let joined = if deadline_passed {
                join_set.join_next().await
            } else {
                tokio::select! {
                    joined = join_set.join_next() => joined,
                    _ = &mut deadline => {
                        warn!("Batch exceeded max duration, cancelling in-flight steps");
                        deadline_expired = !tracker.is_cancelled();
                        tracker.cancel();
                        deadline_passed = true;
                        continue;
                    }
                }
            };
            match joined {
                Some(Ok(outcome)) => outcomes.push(outcome),
                Some(Err(join_error)) => {
                    tracker.cancel();
                    join_set.abort_all();
                    let _ = tracker.settle();
                    return Err(EngineError::Internal(format!("step task failed: {join_error}")));
                }
                None => break,
            }
        }

        let settled = tracker.settle();
        if deadline_expired {
            expire_stragglers(&mut outcomes, self.limiter.limits().max_batch_duration);
        }
        outcomes.sort_by_key(|o| o.order);
        run.steps_dispatched += outcomes.len();

        let mut first_failure = None;
        for outcome in outcomes {
            run.total_cost += outcome.cost;
            match outcome.result {
                Ok(output) => run.context.record_output(outcome.step_id, output)?,
                Err(failure) => {
                    if first_failure.is_none() {
                        first_failure = Some(failure.clone());
                    }
                    run.context.record_failure(failure)?;
                }
            }
        }

        settled.map_err(EngineError::Quota)?;
        Ok(first_failure)
    }
}

struct RunState {
    context: ExecutionContext,
    steps_dispatched: usize,
    total_cost: f64,
}

impl RunState {
    fn abort(self, error: EngineError) -> RunAborted {
        warn!(%error, recorded = self.context.len(), "Run aborted");
        RunAborted {
            error,
            partial: self.context,
        }
    }
}

/// Steps cut off by the batch ceiling fail with a timeout rather than a cancellation.
fn expire_stragglers(outcomes: &mut [StepOutcome], ceiling: Duration) {
    for outcome in outcomes {
        if let Err(StepFailure {
            cause: FailureCause::Dispatch { error },
            ..
        }) = &mut outcome.result
        {
            if error.class() == ErrorClass::Cancelled {
                *error = DispatchError::timeout(ceiling);
            }
        }
    }
}

/// Causal chain through the first failed dependency of `step`, root cause first.
fn failed_dependency_chain(step: &Step, context: &ExecutionContext) -> Option<Vec<StepId>> {
    step.depends_on.iter().find_map(|dependency| match context.slot(dependency) {
        Some(Slot::Failed(failure)) => Some(failure.causal_chain()),
        _ => None,
    })
}

// ── Step Task ───────────────────────────────────────────────────────

/// Everything one spawned step needs.
struct StepTask {
    dispatcher: Arc<HybridDispatcher>,
    tracker: LimitTracker,
    slots: Arc<Semaphore>,
    request_id: RequestId,
    /// Position in the plan, used to merge results deterministically.
    order: usize,
    policy: ErrorPolicy,
    step: Step,
    input: Value,
    depth: u32,
}

struct StepOutcome {
    order: usize,
    step_id: StepId,
    cost: f64,
    result: Result<Value, StepFailure>,
}

impl StepTask {
    async fn run(self) -> StepOutcome {
        let cancel = self.tracker.cancellation_token();
        let limits = self.tracker.limiter().limits();
        let ctx = DispatchContext::for_request(self.request_id.clone())
            .with_step(self.step.id.clone())
            .with_depth(self.depth)
            .with_timeout(limits.task_timeout(self.step.timeout()))
            .with_cancel(cancel.clone())
            .with_rate_limiter(self.tracker.limiter().rate_limiter().cloned());
        let payload = self.payload();

        // Cached steps settle without a slot or a rate token.
        if let Some(hit) = self.dispatcher.cached_output(
            &ctx,
            &self.step.target,
            self.step.template.as_deref(),
            &payload,
        ) {
            self.tracker.record_cache_hit();
            return StepOutcome {
                order: self.order,
                step_id: self.step.id,
                cost: 0.0,
                result: Ok(hit.value),
            };
        }

        let slots = Arc::clone(&self.slots);
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return self.failed(DispatchError::cancelled("batch cancelled"), 0, Vec::new()),
            permit = slots.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return self.failed(DispatchError::Internal("concurrency gate closed".into()), 0, Vec::new()),
            },
        };

        let _in_flight = self.tracker.begin();
        let outcome = self
            .dispatcher
            .dispatch_with_policy(&ctx, &self.policy, &self.step.target, self.step.template.as_deref(), &payload)
            .await;

        match outcome {
            Ok(recovered) => {
                let output = recovered.value;
                if output.cache_hit {
                    self.tracker.record_cache_hit();
                } else {
                    self.tracker.record_success(output.cost);
                }
                StepOutcome {
                    order: self.order,
                    step_id: self.step.id,
                    cost: output.cost,
                    result: Ok(output.value),
                }
            }
            Err(failure) => self.failed(failure.error, failure.attempts, failure.trail),
        }
    }

    /// Input handed to the backend. A templated step gets its bound prompt next to the arguments.
    fn payload(&self) -> Value {
        match &self.step.template {
            Some(template) => {
                let arguments = self.input.as_object().cloned().unwrap_or_default();
                json!({
                    "prompt": bind_template(template, &arguments),
                    "arguments": self.input,
                })
            }
            None => self.input.clone(),
        }
    }

    fn failed(
        self,
        error: DispatchError,
        attempts: u32,
        trail: Vec<relay_types::AttemptFailure>,
    ) -> StepOutcome {
        self.tracker.record_failure(0.0);
        StepOutcome {
            order: self.order,
            step_id: self.step.id.clone(),
            cost: 0.0,
            result: Err(StepFailure {
                step_id: self.step.id,
                target: self.step.target,
                attempts,
                cause: FailureCause::Dispatch { error },
                trail,
            }),
        }
    }
}
