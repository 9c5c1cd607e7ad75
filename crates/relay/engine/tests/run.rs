//! Plan execution: ordering, validation, failure modes and synthesis.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use proptest::prelude::*;
use serde_json::{json, Value};

use relay_dispatch::{function_fn, tool_fn, BackendRegistry, HybridDispatcher};
use relay_engine::{
    EngineConfig, EngineError, EngineResult, FailureMode, Profile, RelayConfig, RunStatus,
    Synthesizer, WorkflowEngine,
};
use relay_limits::{ResourceLimiter, ResourceLimits};
use relay_types::{
    BackendRef, DispatchError, ExecutionContext, FailureCause, Plan, PlanError, RequestId,
    RetryPolicy, Step, StepId,
};

fn engine_with(registry: BackendRegistry, config: EngineConfig) -> WorkflowEngine {
    WorkflowEngine::new(
        Arc::new(HybridDispatcher::new(Arc::new(registry))),
        ResourceLimiter::new(ResourceLimits::default()).unwrap(),
        config,
    )
}

fn degraded() -> EngineConfig {
    EngineConfig {
        failure_mode: FailureMode::ContinueDegraded,
        ..EngineConfig::default()
    }
}

/// Tool that logs the `id` field of every input it receives.
fn logging_registry(log: Arc<Mutex<Vec<String>>>) -> BackendRegistry {
    BackendRegistry::new().with(
        "log",
        tool_fn(move |input| {
            let id = input["id"].as_str().unwrap_or("?").to_string();
            log.lock().push(id.clone());
            Ok(json!({"id": id}))
        }),
    )
}

fn failing_registry() -> BackendRegistry {
    BackendRegistry::new()
        .with("ok", tool_fn(|input| Ok(json!({"echo": input.clone()}))))
        .with(
            "broken",
            tool_fn(|_| Err(DispatchError::Validation("malformed request".into()))),
        )
}

#[tokio::test]
async fn steps_never_start_before_their_dependencies_are_recorded() {
    let events = Arc::new(Mutex::new(Vec::<(String, &'static str)>::new()));
    let log = events.clone();
    let registry = BackendRegistry::new().with(
        "work",
        function_fn(move |input| {
            let log = log.clone();
            async move {
                let id = input["id"].as_str().unwrap_or("?").to_string();
                let delay = input["delay_ms"].as_u64().unwrap_or(0);
                log.lock().push((id.clone(), "start"));
                tokio::time::sleep(Duration::from_millis(delay)).await;
                log.lock().push((id.clone(), "end"));
                Ok(json!({"id": id}))
            }
        }),
    );

    let step = |id: &str, delay: u64| {
        Step::new(id, BackendRef::function("work")).with_input(json!({"id": id, "delay_ms": delay}))
    };
    let plan = Plan::new(RequestId::new("diamond"))
        .with_step(step("fetch", 20))
        .with_step(step("left", 30).depends_on("fetch"))
        .with_step(step("right", 5).depends_on("fetch"))
        .with_step(step("merge", 1).depends_on("left").depends_on("right"));

    let report = engine_with(registry, EngineConfig::default()).run(&plan).await.unwrap();
    assert!(report.is_complete());
    assert_eq!(report.steps_dispatched, 4);

    let events = events.lock().clone();
    let position = |id: &str, kind: &str| {
        events
            .iter()
            .position(|(i, k)| i == id && *k == kind)
            .unwrap()
    };
    for step in &plan.steps {
        for dep in &step.depends_on {
            assert!(
                position(dep.as_str(), "end") < position(step.id.as_str(), "start"),
                "{} started before {} finished",
                step.id,
                dep
            );
        }
    }
    assert_eq!(report.context.recorded_order().last(), Some(&StepId::new("merge")));
}

#[tokio::test]
async fn outputs_flow_into_dependent_inputs() {
    let registry = BackendRegistry::new()
        .with("search", tool_fn(|_| Ok(json!({"hits": [{"title": "Tides"}, {"title": "Moons"}]}))))
        .with("shout", tool_fn(|input| Ok(json!(input["title"].as_str().unwrap_or("").to_uppercase()))));
    let plan = Plan::new(RequestId::new("flow"))
        .with_step(Step::new("search", BackendRef::tool("search")))
        .with_step(
            Step::new("shout", BackendRef::tool("shout"))
                .depends_on("search")
                .with_input(json!({"title": "{{steps.search.output.hits.1.title}}"})),
        );

    let report = engine_with(registry, EngineConfig::default()).run(&plan).await.unwrap();
    assert_eq!(report.context.output(&StepId::new("shout")), Some(&json!("MOONS")));
}

#[tokio::test]
async fn cyclic_plan_is_rejected_without_dispatching() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let registry = BackendRegistry::new().with(
        "count",
        tool_fn(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        }),
    );
    let plan = Plan::new(RequestId::new("cycle"))
        .with_step(Step::new("start", BackendRef::tool("count")))
        .with_step(Step::new("a", BackendRef::tool("count")).depends_on("b"))
        .with_step(Step::new("b", BackendRef::tool("count")).depends_on("a"));

    let aborted = engine_with(registry, EngineConfig::default()).run(&plan).await.unwrap_err();
    assert!(matches!(aborted.error, EngineError::Plan(PlanError::Cycle { .. })));
    assert!(aborted.partial.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unknown_dependency_is_rejected_without_dispatching() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let plan = Plan::new(RequestId::new("dangling"))
        .with_step(Step::new("a", BackendRef::tool("log")).depends_on("ghost"));

    let aborted = engine_with(logging_registry(log.clone()), EngineConfig::default())
        .run(&plan)
        .await
        .unwrap_err();
    assert_eq!(
        aborted.error,
        EngineError::Plan(PlanError::UnknownDependency {
            step: StepId::new("a"),
            dependency: StepId::new("ghost"),
        })
    );
    assert!(log.lock().is_empty());
}

#[tokio::test]
async fn continue_degraded_fails_dependents_with_causal_chain() {
    let plan = Plan::new(RequestId::new("chain"))
        .with_step(Step::new("a", BackendRef::tool("broken")))
        .with_step(Step::new("b", BackendRef::tool("ok")).depends_on("a"))
        .with_step(Step::new("c", BackendRef::tool("ok")).depends_on("b"))
        .with_step(Step::new("d", BackendRef::tool("ok")));

    let report = engine_with(failing_registry(), degraded()).run(&plan).await.unwrap();

    assert_eq!(
        report.status,
        RunStatus::Degraded {
            failed: vec![StepId::new("a"), StepId::new("b"), StepId::new("c")]
        }
    );
    assert!(report.context.is_completed(&StepId::new("d")));
    assert_eq!(report.steps_dispatched, 2);

    let c = report.context.failure(&StepId::new("c")).unwrap();
    assert_eq!(
        c.cause,
        FailureCause::UpstreamFailed {
            chain: vec![StepId::new("a"), StepId::new("b")]
        }
    );
    assert_eq!(
        c.causal_chain(),
        vec![StepId::new("a"), StepId::new("b"), StepId::new("c")]
    );

    let errors = report.errors();
    assert!(matches!(&errors[0], EngineError::StepFailed(f) if f.step_id.as_str() == "a"));
    assert!(errors.iter().any(|e| matches!(
        e,
        EngineError::DependencyFailed { step, chain } if step.as_str() == "c" && chain.len() == 2
    )));
}

#[tokio::test]
async fn abort_all_keeps_the_settled_batch() {
    let plan = Plan::new(RequestId::new("abort"))
        .with_step(Step::new("a", BackendRef::tool("broken")))
        .with_step(Step::new("d", BackendRef::tool("ok")))
        .with_step(Step::new("later", BackendRef::tool("ok")).depends_on("d"));

    let aborted = engine_with(failing_registry(), EngineConfig::default())
        .run(&plan)
        .await
        .unwrap_err();

    match &aborted.error {
        EngineError::StepFailed(failure) => {
            assert_eq!(failure.step_id, StepId::new("a"));
            assert_eq!(failure.target, BackendRef::tool("broken"));
            assert_eq!(failure.attempts, 1);
            assert!(matches!(
                failure.cause,
                FailureCause::Dispatch {
                    error: DispatchError::Validation(_)
                }
            ));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(aborted.partial.is_completed(&StepId::new("d")));
    assert!(!aborted.partial.contains(&StepId::new("later")));
}

#[tokio::test]
async fn step_retry_policy_recovers_transient_failure() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let registry = BackendRegistry::new().with(
        "flaky",
        tool_fn(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(DispatchError::Connection("reset".into()))
            } else {
                Ok(json!("finally"))
            }
        }),
    );
    let plan = Plan::new(RequestId::new("retry")).with_step(
        Step::new("fetch", BackendRef::tool("flaky")).with_retry(
            RetryPolicy::new(3)
                .with_base_delay(Duration::from_millis(1))
                .without_jitter(),
        ),
    );

    let report = engine_with(registry, EngineConfig::default()).run(&plan).await.unwrap();
    assert_eq!(report.context.output(&StepId::new("fetch")), Some(&json!("finally")));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn step_fallback_is_used_when_primary_fails() {
    let plan = Plan::new(RequestId::new("fallback")).with_step(
        Step::new("answer", BackendRef::tool("broken")).with_fallback(BackendRef::tool("ok")),
    );
    let report = engine_with(failing_registry(), EngineConfig::default())
        .run(&plan)
        .await
        .unwrap();
    assert!(report.is_complete());
    assert_eq!(
        report.context.output(&StepId::new("answer")),
        Some(&json!({"echo": {}}))
    );
}

struct JoinOutputs;

#[async_trait]
impl Synthesizer for JoinOutputs {
    async fn synthesize(
        &self,
        instruction: Option<&str>,
        context: &ExecutionContext,
    ) -> EngineResult<Value> {
        let ids: Vec<String> = context
            .outputs()
            .values()
            .filter_map(|v| v["id"].as_str().map(str::to_string))
            .collect();
        match instruction {
            Some(instruction) => Ok(json!({"instruction": instruction, "ids": ids})),
            None => Err(EngineError::Synthesis("no instruction".into())),
        }
    }
}

#[tokio::test]
async fn synthesis_receives_completed_context() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let engine = engine_with(logging_registry(log), EngineConfig::default());
    let plan = Plan::new(RequestId::new("synth"))
        .with_step(Step::new("x", BackendRef::tool("log")).with_input(json!({"id": "x"})))
        .with_step(
            Step::new("y", BackendRef::tool("log"))
                .depends_on("x")
                .with_input(json!({"id": "y"})),
        );

    let run = engine
        .run_with_synthesis(&plan.clone().with_synthesis("combine"), &JoinOutputs)
        .await
        .unwrap();
    assert_eq!(run.synthesis, json!({"instruction": "combine", "ids": ["x", "y"]}));

    let aborted = engine.run_with_synthesis(&plan, &JoinOutputs).await.unwrap_err();
    assert!(matches!(aborted.error, EngineError::Synthesis(_)));
    assert_eq!(aborted.partial.completed_count(), 2);
}

#[tokio::test]
async fn yaml_plan_runs_on_configured_engine() {
    let registry = BackendRegistry::new()
        .with("fetch", tool_fn(|_| Ok(json!({"body": "low tide at noon"}))))
        .with(
            "summarize",
            function_fn(|input| async move {
                let words = input["text"].as_str().map(|t| t.split_whitespace().count()).unwrap_or(0);
                Ok(json!({"words": words}))
            }),
        );
    let engine = WorkflowEngine::from_config(
        &RelayConfig::for_profile(Profile::Development),
        Arc::new(registry),
    )
    .unwrap();

    let plan = Plan::from_yaml_str(
        r#"
request_id: req-42
steps:
  - id: fetch
    backend: { kind: tool, name: fetch }
  - id: summarize
    backend: { kind: function, name: summarize }
    depends_on: [fetch]
    input:
      text: "{{steps.fetch.output.body}}"
"#,
    )
    .unwrap();

    let report = engine.run(&plan).await.unwrap();
    assert_eq!(
        report.context.output(&StepId::new("summarize")),
        Some(&json!({"words": 4}))
    );
}

#[tokio::test]
async fn admission_failure_aborts_before_dispatch() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let engine = WorkflowEngine::new(
        Arc::new(HybridDispatcher::new(Arc::new(logging_registry(log.clone())))),
        ResourceLimiter::new(ResourceLimits::default().with_max_total_tasks(2)).unwrap(),
        EngineConfig::default(),
    );
    let plan = (0..3).fold(Plan::new(RequestId::new("wide")), |plan, i| {
        plan.with_step(Step::new(format!("s{i}"), BackendRef::tool("log")))
    });

    let aborted = engine.run(&plan).await.unwrap_err();
    assert!(matches!(aborted.error, EngineError::Quota(_)));
    assert!(log.lock().is_empty());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_random_dags_run_in_causal_order(
        edges in proptest::collection::vec(proptest::collection::vec(any::<bool>(), 0..8), 1..8)
    ) {
        let n = edges.len();
        let mut plan = Plan::new(RequestId::new("prop"));
        for (j, row) in edges.iter().enumerate() {
            let id = format!("s{j}");
            let mut step = Step::new(id.clone(), BackendRef::tool("log")).with_input(json!({"id": id}));
            for (i, &edge) in row.iter().enumerate().take(j) {
                if edge {
                    step = step.depends_on(format!("s{i}"));
                }
            }
            plan = plan.with_step(step);
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let engine = engine_with(logging_registry(log.clone()), EngineConfig::default());
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let report = runtime.block_on(engine.run(&plan)).unwrap();

        prop_assert_eq!(report.context.completed_count(), n);
        let order: HashMap<String, usize> = log
            .lock()
            .iter()
            .enumerate()
            .map(|(pos, id)| (id.clone(), pos))
            .collect();
        for step in &plan.steps {
            for dep in &step.depends_on {
                prop_assert!(order[dep.as_str()] < order[step.id.as_str()]);
            }
        }
    }
}

#[tokio::test(start_paused = true)]
async fn cached_steps_settle_without_waiting_for_rate_tokens() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&calls);
    let registry = BackendRegistry::new().with(
        "lookup",
        tool_fn(move |input| {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"found": input.clone()}))
        }),
    );
    let engine = WorkflowEngine::new(
        Arc::new(HybridDispatcher::new(Arc::new(registry))),
        ResourceLimiter::new(ResourceLimits::default().with_rate(1.0, 1)).unwrap(),
        EngineConfig::default(),
    );
    let plan = (0..3).fold(Plan::new(RequestId::new("lookups")), |plan, i| {
        plan.with_step(Step::new(format!("s{i}"), BackendRef::tool("lookup")).with_input(json!({"key": i})))
    });

    let started = tokio::time::Instant::now();
    assert!(engine.run(&plan).await.unwrap().is_complete());
    assert!(started.elapsed() >= Duration::from_secs(2));

    let again = tokio::time::Instant::now();
    let report = engine.run(&plan).await.unwrap();
    assert!(report.is_complete());
    assert_eq!(again.elapsed(), Duration::ZERO);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(engine.dispatcher().cache().stats().hits, 3);
}

#[tokio::test(start_paused = true)]
async fn batch_deadline_fails_slow_steps_with_timeout() {
    let registry = BackendRegistry::new()
        .with("quick", tool_fn(|_| Ok(json!("done"))))
        .with(
            "slow",
            function_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(json!("late"))
            }),
        );
    let engine = WorkflowEngine::new(
        Arc::new(HybridDispatcher::new(Arc::new(registry))),
        ResourceLimiter::new(ResourceLimits::default().with_batch_duration(Duration::from_secs(1)))
            .unwrap(),
        degraded(),
    );
    let plan = Plan::new(RequestId::new("deadline"))
        .with_step(Step::new("fast", BackendRef::tool("quick")))
        .with_step(Step::new("slow", BackendRef::function("slow")));

    let report = engine.run(&plan).await.unwrap();
    assert_eq!(report.context.output(&StepId::new("fast")), Some(&json!("done")));
    let failures = report.context.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].step_id, StepId::new("slow"));
    assert!(matches!(
        &failures[0].cause,
        FailureCause::Dispatch { error: DispatchError::Timeout { timeout_ms: 1_000 } }
    ));
}

#[tokio::test(start_paused = true)]
async fn concurrent_runs_share_one_concurrency_ceiling() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (gauge, high) = (Arc::clone(&active), Arc::clone(&peak));
    let registry = BackendRegistry::new().with(
        "work",
        function_fn(move |input| {
            let (gauge, high) = (Arc::clone(&gauge), Arc::clone(&high));
            async move {
                let now = gauge.fetch_add(1, Ordering::SeqCst) + 1;
                high.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                gauge.fetch_sub(1, Ordering::SeqCst);
                Ok(input)
            }
        }),
    );
    let engine = WorkflowEngine::new(
        Arc::new(HybridDispatcher::new(Arc::new(registry))),
        ResourceLimiter::new(ResourceLimits::default().with_max_concurrent(1)).unwrap(),
        EngineConfig::default(),
    );
    let plan = |name: &str| {
        (0..2).fold(Plan::new(RequestId::new(name)), |plan, i| {
            plan.with_step(
                Step::new(format!("s{i}"), BackendRef::function("work"))
                    .with_input(json!({"run": name, "i": i})),
            )
        })
    };
    let (left, right) = (plan("left"), plan("right"));

    let (a, b) = tokio::join!(engine.run(&left), engine.run(&right));
    assert!(a.unwrap().is_complete());
    assert!(b.unwrap().is_complete());
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}
