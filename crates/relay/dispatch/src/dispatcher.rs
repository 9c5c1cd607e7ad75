//! The hybrid dispatcher.
//!
//! One entry point for every backend kind. Each call runs the same pipeline:
//!
//! 1. sanitize the template and every string leaf of the input
//! 2. look up the idempotency cache
//! 3. take a rate-limit token, when the context carries a limiter
//! 4. resolve the backend by kind and name
//! 5. invoke it under the call's timeout and cancellation token
//! 6. filter sensitive data out of the output
//! 7. cache the successful output
//!
//! and emits one [`DispatchEvent`] per call.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use relay_limits::RateLimiter;
use relay_recovery::{Recovered, RecoveryExecutor, RecoveryFailure};
use relay_security::{
    fingerprint, IdempotencyCache, ResponseFilter, Sanitizer, SecurityResult,
};
use relay_types::{
    BackendRef, DispatchError, DispatchEvent, DispatchOutput, ErrorPolicy, FaultKind, RequestId,
    StepId,
};

use crate::agent::DelegationRequest;
use crate::backend::Backend;
use crate::config::DispatcherConfig;
use crate::events::{EventSink, NoopEventSink};
use crate::registry::BackendLookup;
use crate::sandbox::SandboxRunner;

// ── Dispatch Context ────────────────────────────────────────────────

/// Per-call context threaded from the engine or batch executor.
#[derive(Debug, Clone, Default)]
pub struct DispatchContext {
    pub request_id: Option<RequestId>,
    pub step_id: Option<StepId>,
    /// 1-based attempt number within the unit's recovery policy.
    pub attempt: u32,
    /// Delegation depth of the caller. Agent calls run at `depth + 1`.
    pub depth: u32,
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
    /// Bucket every outbound attempt draws a token from. Cache hits draw none.
    pub rate: Option<Arc<RateLimiter>>,
}

impl DispatchContext {
    pub fn new() -> Self {
        Self {
            attempt: 1,
            ..Self::default()
        }
    }

    pub fn for_request(request_id: RequestId) -> Self {
        Self {
            request_id: Some(request_id),
            ..Self::new()
        }
    }

    pub fn with_step(mut self, step_id: StepId) -> Self {
        self.step_id = Some(step_id);
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_rate_limiter(mut self, rate: Option<Arc<RateLimiter>>) -> Self {
        self.rate = rate;
        self
    }
}

async fn with_timeout<T, Fut>(timeout: Duration, call: Fut) -> Result<T, DispatchError>
where
    Fut: std::future::Future<Output = Result<T, DispatchError>>,
{
    tokio::time::timeout(timeout, call)
        .await
        .unwrap_or_else(|_| Err(DispatchError::timeout(timeout)))
}

// ── Hybrid Dispatcher ───────────────────────────────────────────────

/// Routes calls to tools, functions, sandboxed code and remote agents.
pub struct HybridDispatcher {
    lookup: Arc<dyn BackendLookup>,
    sanitizer: Arc<Sanitizer>,
    filter: Arc<ResponseFilter>,
    cache: Arc<IdempotencyCache>,
    sandbox: Arc<SandboxRunner>,
    recovery: RecoveryExecutor,
    events: Arc<dyn EventSink>,
    default_timeout: Duration,
}

impl std::fmt::Debug for HybridDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridDispatcher")
            .field("deny_patterns", &self.sanitizer.pattern_count())
            .field("cache", &self.cache.stats())
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

impl HybridDispatcher {
    /// Dispatcher with built-in security rules and default settings.
    pub fn new(lookup: Arc<dyn BackendLookup>) -> Self {
        let config = DispatcherConfig::default();
        Self {
            lookup,
            sanitizer: Arc::new(Sanitizer::with_defaults()),
            filter: Arc::new(ResponseFilter::with_defaults()),
            cache: Arc::new(IdempotencyCache::from_config(&config.security)),
            sandbox: Arc::new(SandboxRunner::new(config.sandbox)),
            recovery: RecoveryExecutor::default(),
            events: Arc::new(NoopEventSink),
            default_timeout: config.default_timeout,
        }
    }

    pub fn from_config(lookup: Arc<dyn BackendLookup>, config: &DispatcherConfig) -> SecurityResult<Self> {
        Ok(Self {
            lookup,
            sanitizer: Arc::new(Sanitizer::from_config(&config.security)?),
            filter: Arc::new(ResponseFilter::from_config(&config.security)?),
            cache: Arc::new(IdempotencyCache::from_config(&config.security)),
            sandbox: Arc::new(SandboxRunner::new(config.sandbox.clone())),
            recovery: RecoveryExecutor::default(),
            events: Arc::new(NoopEventSink),
            default_timeout: config.default_timeout,
        })
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_recovery(mut self, recovery: RecoveryExecutor) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn with_cache(mut self, cache: Arc<IdempotencyCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_sandbox(mut self, sandbox: SandboxRunner) -> Self {
        self.sandbox = Arc::new(sandbox);
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn lookup(&self) -> &Arc<dyn BackendLookup> {
        &self.lookup
    }

    pub fn cache(&self) -> &Arc<IdempotencyCache> {
        &self.cache
    }

    pub fn recovery(&self) -> &RecoveryExecutor {
        &self.recovery
    }

    /// Dispatch one call to `target`.
    ///
    /// `input` is handed to the backend as is. `template` is the prompt text
    /// the input was derived from; it is sanitized and takes part in the
    /// idempotency fingerprint.
    #[instrument(skip(self, ctx, template, input), fields(backend = %target, attempt = ctx.attempt))]
    pub async fn dispatch(
        &self,
        ctx: &DispatchContext,
        target: &BackendRef,
        template: Option<&str>,
        input: &Value,
    ) -> Result<DispatchOutput, DispatchError> {
        if let Err(error) = self.sanitizer.check(template, input) {
            warn!(%error, "Rejected unsafe input");
            self.emit(ctx, target, Duration::ZERO, 0.0, false, Some(&error));
            return Err(error);
        }

        let key = fingerprint(target, template, input);
        if let Some(hit) = self.cache.get(&key) {
            debug!("Served from idempotency cache");
            self.emit(ctx, target, Duration::ZERO, 0.0, true, None);
            return Ok(hit);
        }

        if let Some(rate) = &ctx.rate {
            if let Err(error) = rate.acquire_or_cancel(&ctx.cancel).await {
                self.emit(ctx, target, Duration::ZERO, 0.0, false, Some(&error));
                return Err(error);
            }
        }

        let started = Instant::now();
        let result = self.invoke(ctx, target, &key, input).await;
        let latency = started.elapsed();

        match result {
            Ok((value, cost)) => {
                let filtered = self.filter.filter(value);
                if filtered.is_redacted() {
                    debug!(redactions = filtered.redactions.len(), "Redacted sensitive output");
                }
                let output = DispatchOutput {
                    value: filtered.value,
                    cost,
                    latency,
                    cache_hit: false,
                    redactions: filtered.redactions,
                };
                self.cache.insert(key, &output);
                self.emit(ctx, target, latency, cost, false, None);
                Ok(output)
            }
            Err(error) => {
                self.emit(ctx, target, latency, 0.0, false, Some(&error));
                Err(error)
            }
        }
    }

    /// Dispatch under `policy`, retrying or falling back as it directs.
    pub async fn dispatch_with_policy(
        &self,
        ctx: &DispatchContext,
        policy: &ErrorPolicy,
        target: &BackendRef,
        template: Option<&str>,
        input: &Value,
    ) -> Result<Recovered<DispatchOutput>, RecoveryFailure> {
        self.recovery
            .execute(policy, target, |target, attempt| {
                let ctx = ctx.clone().with_attempt(attempt);
                async move { self.dispatch(&ctx, &target, template, input).await }
            })
            .await
    }

    /// Cached output for this exact call, if any. Emits an event on a hit.
    ///
    /// Lets a batch settle a repeated unit without taking a concurrency slot
    /// or a rate-limit token.
    pub fn cached_output(
        &self,
        ctx: &DispatchContext,
        target: &BackendRef,
        template: Option<&str>,
        input: &Value,
    ) -> Option<DispatchOutput> {
        let hit = self.cache.get(&fingerprint(target, template, input))?;
        self.emit(ctx, target, Duration::ZERO, 0.0, true, None);
        Some(hit)
    }

    async fn invoke(
        &self,
        ctx: &DispatchContext,
        target: &BackendRef,
        key: &str,
        input: &Value,
    ) -> Result<(Value, f64), DispatchError> {
        if ctx.cancel.is_cancelled() {
            return Err(DispatchError::cancelled("batch cancelled"));
        }
        let backend = self.lookup.resolve(target)?;
        let timeout = ctx.timeout.unwrap_or(self.default_timeout);

        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(DispatchError::cancelled("batch cancelled")),
            outcome = self.call_backend(backend, ctx, target, key, input, timeout) => outcome,
        }
    }

    async fn call_backend(
        &self,
        backend: Backend,
        ctx: &DispatchContext,
        target: &BackendRef,
        key: &str,
        input: &Value,
        timeout: Duration,
    ) -> Result<(Value, f64), DispatchError> {
        match backend {
            Backend::Tool(handler) => handler.call(input).map(|value| (value, 0.0)),
            Backend::Function(handler) => {
                with_timeout(timeout, handler.call(input.clone()))
                    .await
                    .map(|value| (value, 0.0))
            }
            Backend::Code(unit) => {
                let run = async {
                    self.sandbox
                        .run(&unit, input, Some(timeout))
                        .await
                        .map_err(|e| e.into_dispatch_error(&target.to_string()))
                };
                with_timeout(timeout, run).await.map(|value| (value, 0.0))
            }
            Backend::Agent(transport) => {
                let request = DelegationRequest {
                    target: target.clone(),
                    payload: input.clone(),
                    idempotency_key: key.to_string(),
                    timeout,
                    depth: ctx.depth + 1,
                };
                let call = async {
                    let response = transport.delegate(request).await?;
                    if response.success {
                        Ok((response.result.unwrap_or(Value::Null), response.cost))
                    } else {
                        Err(DispatchError::ExecutionFault {
                            target: target.to_string(),
                            kind: FaultKind::Exception,
                            reason: response
                                .error
                                .unwrap_or_else(|| "agent reported failure".to_string()),
                        })
                    }
                };
                // Timeouts must settle inside the guard so they count against the circuit.
                self.recovery
                    .call_guarded(target, with_timeout(timeout, call))
                    .await
            }
        }
    }

    fn emit(
        &self,
        ctx: &DispatchContext,
        target: &BackendRef,
        latency: Duration,
        cost: f64,
        cache_hit: bool,
        error: Option<&DispatchError>,
    ) {
        self.events.emit(DispatchEvent {
            request_id: ctx.request_id.clone(),
            step_id: ctx.step_id.clone(),
            target: target.clone(),
            success: error.is_none(),
            latency,
            cost,
            attempt: ctx.attempt,
            cache_hit,
            error: error.map(ToString::to_string),
            at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use parking_lot::Mutex;
    use relay_recovery::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
    use relay_types::RetryPolicy;

    use crate::agent::{AgentTransport, DelegationResponse};
    use crate::backend::{function_fn, tool_fn};
    use crate::events::CollectingEventSink;
    use crate::registry::BackendRegistry;

    struct ScriptedAgent {
        calls: AtomicUsize,
        response: DelegationResponse,
    }

    #[async_trait]
    impl AgentTransport for ScriptedAgent {
        async fn delegate(&self, request: DelegationRequest) -> Result<DelegationResponse, DispatchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(request.depth, 2);
            assert!(!request.idempotency_key.is_empty());
            Ok(self.response.clone())
        }
    }

    struct HangingAgent {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AgentTransport for HangingAgent {
        async fn delegate(&self, _request: DelegationRequest) -> Result<DelegationResponse, DispatchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(DelegationResponse::ok(Value::Null))
        }
    }

    fn dispatcher(registry: BackendRegistry) -> (HybridDispatcher, Arc<CollectingEventSink>) {
        let events = Arc::new(CollectingEventSink::new());
        let dispatcher = HybridDispatcher::new(Arc::new(registry)).with_events(events.clone());
        (dispatcher, events)
    }

    #[tokio::test]
    async fn test_tool_and_function_dispatch() {
        let registry = BackendRegistry::new()
            .with("upper", tool_fn(|input| Ok(json!(input["text"].as_str().unwrap_or("").to_uppercase()))))
            .with("double", function_fn(|input| async move { Ok(json!(input.as_i64().unwrap_or(0) * 2)) }));
        let (dispatcher, events) = dispatcher(registry);
        let ctx = DispatchContext::new();

        let out = dispatcher
            .dispatch(&ctx, &BackendRef::tool("upper"), None, &json!({"text": "hi"}))
            .await
            .unwrap();
        assert_eq!(out.value, json!("HI"));
        assert!(!out.cache_hit);

        let out = dispatcher
            .dispatch(&ctx, &BackendRef::function("double"), None, &json!(21))
            .await
            .unwrap();
        assert_eq!(out.value, json!(42));
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_backend_is_fatal() {
        let (dispatcher, events) = dispatcher(BackendRegistry::new());
        let err = dispatcher
            .dispatch(&DispatchContext::new(), &BackendRef::tool("nope"), None, &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnknownBackend { .. }));
        assert!(!err.is_retryable());
        assert!(!events.events()[0].success);
    }

    #[tokio::test]
    async fn test_timeout_applies_to_slow_function() {
        let registry = BackendRegistry::new().with(
            "slow",
            function_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Value::Null)
            }),
        );
        let (dispatcher, _) = dispatcher(registry);
        let ctx = DispatchContext::new().with_timeout(Duration::from_millis(20));
        let err = dispatcher
            .dispatch(&ctx, &BackendRef::function("slow"), None, &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::Timeout { timeout_ms: 20 });
    }

    #[tokio::test]
    async fn test_cancelled_context_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let registry = BackendRegistry::new().with(
            "count",
            tool_fn(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }),
        );
        let (dispatcher, _) = dispatcher(registry);
        let ctx = DispatchContext::new();
        ctx.cancel.cancel();
        let err = dispatcher
            .dispatch(&ctx, &BackendRef::tool("count"), None, &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Cancelled { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_agent_runs_one_level_deeper_and_reports_cost() {
        let agent = Arc::new(ScriptedAgent {
            calls: AtomicUsize::new(0),
            response: DelegationResponse::ok(json!({"text": "done"})).with_cost(0.25),
        });
        let registry = BackendRegistry::new().with("writer", Backend::Agent(agent.clone()));
        let (dispatcher, _) = dispatcher(registry);
        let ctx = DispatchContext::new().with_depth(1);

        let out = dispatcher
            .dispatch(&ctx, &BackendRef::agent("writer"), Some("Write {topic}"), &json!({"topic": "tides"}))
            .await
            .unwrap();
        assert_eq!(out.value, json!({"text": "done"}));
        assert_eq!(out.cost, 0.25);
        assert_eq!(agent.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_agent_failure_is_a_transient_fault() {
        let agent = Arc::new(ScriptedAgent {
            calls: AtomicUsize::new(0),
            response: DelegationResponse::failed("model overloaded"),
        });
        let registry = BackendRegistry::new().with("writer", Backend::Agent(agent));
        let (dispatcher, _) = dispatcher(registry);
        let err = dispatcher
            .dispatch(&DispatchContext::new().with_depth(1), &BackendRef::agent("writer"), None, &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::ExecutionFault { kind: FaultKind::Exception, ref reason, .. } if reason == "model overloaded"
        ));
        assert!(err.is_retryable());

        let stats = dispatcher.recovery().breakers().get("agent:writer").unwrap().stats();
        assert_eq!(stats.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let registry = BackendRegistry::new().with(
            "flaky",
            tool_fn(move |_| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(DispatchError::Connection("reset".into()))
                } else {
                    Ok(json!("ok"))
                }
            }),
        );
        let (dispatcher, _) = dispatcher(registry);
        let ctx = DispatchContext::new();
        let target = BackendRef::tool("flaky");

        assert!(dispatcher.dispatch(&ctx, &target, None, &json!({})).await.is_err());
        let second = dispatcher.dispatch(&ctx, &target, None, &json!({})).await.unwrap();
        assert!(!second.cache_hit);
        let third = dispatcher.dispatch(&ctx, &target, None, &json!({})).await.unwrap();
        assert!(third.cache_hit);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_agent_timeouts_open_the_circuit() {
        let agent = Arc::new(HangingAgent {
            calls: AtomicUsize::new(0),
        });
        let registry = BackendRegistry::new().with("stuck", Backend::Agent(agent.clone()));
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::new(
            2,
            Duration::from_secs(60),
        )));
        let dispatcher = HybridDispatcher::new(Arc::new(registry))
            .with_recovery(RecoveryExecutor::new(breakers.clone()));
        let ctx = DispatchContext::new().with_timeout(Duration::from_millis(50));
        let target = BackendRef::agent("stuck");

        let mut errors = Vec::new();
        for _ in 0..4 {
            errors.push(dispatcher.dispatch(&ctx, &target, None, &json!({})).await.unwrap_err());
        }

        assert_eq!(errors[0], DispatchError::Timeout { timeout_ms: 50 });
        assert_eq!(errors[1], DispatchError::Timeout { timeout_ms: 50 });
        assert!(matches!(errors[2], DispatchError::CircuitOpen { .. }));
        assert!(matches!(errors[3], DispatchError::CircuitOpen { .. }));
        assert_eq!(agent.calls.load(Ordering::SeqCst), 2);
        assert_eq!(breakers.get("agent:stuck").unwrap().state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_retry_attempt_draws_a_rate_token() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let log = calls.clone();
        let registry = BackendRegistry::new().with(
            "flaky",
            tool_fn(move |_| {
                let mut log = log.lock();
                log.push(tokio::time::Instant::now());
                if log.len() < 4 {
                    Err(DispatchError::Connection("reset".into()))
                } else {
                    Ok(json!("up"))
                }
            }),
        );
        let (dispatcher, _) = dispatcher(registry);
        let rate = Arc::new(RateLimiter::new(1.0, 1).unwrap());
        let ctx = DispatchContext::new().with_rate_limiter(Some(rate));
        let policy = ErrorPolicy::Retry(
            RetryPolicy::new(4)
                .with_base_delay(Duration::ZERO)
                .with_max_delay(Duration::ZERO)
                .without_jitter(),
        );
        let target = BackendRef::tool("flaky");

        let out = dispatcher
            .dispatch_with_policy(&ctx, &policy, &target, None, &json!({}))
            .await
            .unwrap();
        assert_eq!(out.attempts, 4);

        let times = calls.lock().clone();
        assert_eq!(times.len(), 4);
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(999), "{:?}", pair[1] - pair[0]);
        }

        // The bucket is empty now; a cache hit must not wait for it.
        let before = tokio::time::Instant::now();
        let hit = dispatcher.dispatch(&ctx, &target, None, &json!({})).await.unwrap();
        assert!(hit.cache_hit);
        assert_eq!(tokio::time::Instant::now(), before);
        assert_eq!(calls.lock().len(), 4);
    }
}
