//! Policy-driven recovery around a dispatch operation.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, instrument, warn};

use relay_types::{AttemptFailure, BackendRef, DispatchError, ErrorClass, ErrorPolicy, RetryPolicy};

use crate::backoff::retry_delay;
use crate::registry::CircuitBreakerRegistry;

/// A successful outcome and how it was reached.
#[derive(Debug, Clone, PartialEq)]
pub struct Recovered<T> {
    pub value: T,
    /// Attempts made across every target, including the successful one.
    pub attempts: u32,
    /// Target that produced `value`.
    pub target: BackendRef,
    /// Failed attempts that preceded the success.
    pub trail: Vec<AttemptFailure>,
}

/// The policy gave up.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{error} (after {attempts} attempt(s))")]
pub struct RecoveryFailure {
    pub error: DispatchError,
    pub attempts: u32,
    pub trail: Vec<AttemptFailure>,
}

/// Applies an [`ErrorPolicy`] around an operation and guards remote calls
/// with circuit breakers.
#[derive(Debug, Clone, Default)]
pub struct RecoveryExecutor {
    breakers: Arc<CircuitBreakerRegistry>,
}

impl RecoveryExecutor {
    pub fn new(breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self { breakers }
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Run `op` under `policy`.
    ///
    /// `op` receives the target to call and the 1-based attempt number,
    /// counted across every target tried.
    #[instrument(skip(self, policy, op), fields(policy = policy.name(), backend = %primary))]
    pub async fn execute<T, F, Fut>(
        &self,
        policy: &ErrorPolicy,
        primary: &BackendRef,
        mut op: F,
    ) -> Result<Recovered<T>, RecoveryFailure>
    where
        F: FnMut(BackendRef, u32) -> Fut,
        Fut: Future<Output = Result<T, DispatchError>>,
    {
        match policy {
            ErrorPolicy::Raise | ErrorPolicy::PartialSuccess => {
                self.retry(&RetryPolicy::new(1), primary, &mut op, 0).await
            }
            ErrorPolicy::Retry(retry) => self.retry(retry, primary, &mut op, 0).await,
            ErrorPolicy::Fallback { alternatives, retry } => {
                self.fallback(primary, alternatives, retry.as_ref(), &mut op).await
            }
        }
    }

    /// Attempts on one target. Numbering continues after `prior` attempts made elsewhere.
    async fn retry<T, F, Fut>(
        &self,
        policy: &RetryPolicy,
        target: &BackendRef,
        op: &mut F,
        prior: u32,
    ) -> Result<Recovered<T>, RecoveryFailure>
    where
        F: FnMut(BackendRef, u32) -> Fut,
        Fut: Future<Output = Result<T, DispatchError>>,
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut trail = Vec::new();
        let mut attempt = prior;

        loop {
            attempt += 1;
            match op(target.clone(), attempt).await {
                Ok(value) => {
                    return Ok(Recovered {
                        value,
                        attempts: attempt,
                        target: target.clone(),
                        trail,
                    })
                }
                Err(error) => {
                    trail.push(AttemptFailure {
                        target: target.clone(),
                        attempt,
                        error: error.clone(),
                    });
                    let on_target = attempt - prior;
                    if !error.is_retryable() || on_target >= max_attempts {
                        if on_target > 1 {
                            warn!(attempt, %error, "Giving up after retries");
                        }
                        return Err(RecoveryFailure {
                            error,
                            attempts: attempt,
                            trail,
                        });
                    }
                    let delay = retry_delay(policy, on_target);
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "Retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn fallback<T, F, Fut>(
        &self,
        primary: &BackendRef,
        alternatives: &[BackendRef],
        retry: Option<&RetryPolicy>,
        op: &mut F,
    ) -> Result<Recovered<T>, RecoveryFailure>
    where
        F: FnMut(BackendRef, u32) -> Fut,
        Fut: Future<Output = Result<T, DispatchError>>,
    {
        let once_each = RetryPolicy::new(1);
        let per_target = retry.unwrap_or(&once_each);
        let mut trail = Vec::new();
        let mut chain = Vec::new();
        let mut attempts = 0;
        let mut last = None;

        for target in std::iter::once(primary).chain(alternatives) {
            chain.push(target.clone());
            match self.retry(per_target, target, op, attempts).await {
                Ok(mut recovered) => {
                    if chain.len() > 1 {
                        debug!(backend = %target, attempt = recovered.attempts, "Fallback target succeeded");
                    }
                    trail.append(&mut recovered.trail);
                    recovered.trail = trail;
                    return Ok(recovered);
                }
                Err(failure) => {
                    attempts = failure.attempts;
                    trail.extend(failure.trail);
                    if matches!(failure.error.class(), ErrorClass::Cancelled | ErrorClass::Quota) {
                        return Err(RecoveryFailure {
                            error: failure.error,
                            attempts,
                            trail,
                        });
                    }
                    debug!(backend = %target, error = %failure.error, "Fallback target failed");
                    last = Some(failure.error);
                }
            }
        }

        let last = last.unwrap_or_else(|| DispatchError::Internal("empty fallback chain".into()));
        warn!(attempts, "Fallback chain exhausted");
        Err(RecoveryFailure {
            error: DispatchError::FallbackExhausted {
                chain,
                last: Box::new(last),
            },
            attempts,
            trail,
        })
    }

    /// Run `call` behind the circuit breaker for `target`.
    ///
    /// An open circuit fails fast without polling `call`. Transient errors
    /// count against the breaker; any other response shows the target is
    /// reachable and counts as a success.
    pub async fn call_guarded<T, Fut>(&self, target: &BackendRef, call: Fut) -> Result<T, DispatchError>
    where
        Fut: Future<Output = Result<T, DispatchError>>,
    {
        let breaker = self.breakers.get_or_create(&target.to_string());
        let permit = breaker.guard()?;
        let result = call.await;
        match &result {
            Ok(_) => permit.succeed(),
            Err(error) => match error.class() {
                ErrorClass::Transient => permit.fail(),
                ErrorClass::Cancelled => drop(permit),
                _ => permit.succeed(),
            },
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use crate::{CircuitBreakerConfig, CircuitState};

    fn executor() -> RecoveryExecutor {
        RecoveryExecutor::new(Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::new(
            2,
            Duration::from_secs(60),
        ))))
    }

    fn fast_retry(n: u32) -> ErrorPolicy {
        ErrorPolicy::Retry(
            RetryPolicy::new(n)
                .with_base_delay(Duration::from_millis(10))
                .without_jitter(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_transient_failure() {
        let calls = AtomicU32::new(0);
        let target = BackendRef::function("flaky");
        let out = executor()
            .execute(&fast_retry(3), &target, |_, attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(DispatchError::Connection("reset".into()))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(out.value, 3);
        assert_eq!(out.attempts, 3);
        assert_eq!(out.trail.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let err = executor()
            .execute(&fast_retry(5), &BackendRef::agent("a"), |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(DispatchError::Unauthorized("bad key".into())) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.attempts, 1);
        assert!(matches!(err.error, DispatchError::Unauthorized(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_returns_last_error() {
        let err = executor()
            .execute(&fast_retry(2), &BackendRef::tool("t"), |_, _| async {
                Err::<(), _>(DispatchError::timeout(Duration::from_secs(1)))
            })
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 2);
        assert_eq!(err.trail.len(), 2);
        assert!(matches!(err.error, DispatchError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_raise_makes_single_attempt() {
        let calls = AtomicU32::new(0);
        let result = executor()
            .execute(&ErrorPolicy::Raise, &BackendRef::tool("t"), |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(DispatchError::Connection("x".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fallback_exhaustion_carries_chain() {
        let policy = ErrorPolicy::Fallback {
            alternatives: vec![BackendRef::tool("b"), BackendRef::tool("c")],
            retry: None,
        };
        let err = executor()
            .execute(&policy, &BackendRef::tool("a"), |target, _| async move {
                Err::<(), _>(DispatchError::Connection(format!("{} down", target.name)))
            })
            .await
            .unwrap_err();

        match err.error {
            DispatchError::FallbackExhausted { chain, last } => {
                let names: Vec<_> = chain.iter().map(|t| t.name.as_str()).collect();
                assert_eq!(names, vec!["a", "b", "c"]);
                assert_eq!(*last, DispatchError::Connection("c down".into()));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.trail.len(), 3);
    }

    #[tokio::test]
    async fn test_guarded_calls_open_the_circuit() {
        let exec = executor();
        let target = BackendRef::agent("remote");
        for _ in 0..2 {
            let _ = exec
                .call_guarded(&target, async {
                    Err::<(), _>(DispatchError::Connection("refused".into()))
                })
                .await;
        }

        let polled = AtomicU32::new(0);
        let err = exec
            .call_guarded(&target, async {
                polled.fetch_add(1, Ordering::SeqCst);
                Ok::<_, DispatchError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::CircuitOpen { .. }));
        assert_eq!(polled.load(Ordering::SeqCst), 0);
        assert_eq!(
            exec.breakers().get("agent:remote").unwrap().state(),
            CircuitState::Open
        );
    }

    #[tokio::test]
    async fn test_validation_errors_do_not_trip_breaker() {
        let exec = executor();
        let target = BackendRef::agent("strict");
        for _ in 0..3 {
            let _ = exec
                .call_guarded(&target, async {
                    Err::<(), _>(DispatchError::Validation("bad field".into()))
                })
                .await;
        }
        assert_eq!(
            exec.breakers().get("agent:strict").unwrap().state(),
            CircuitState::Closed
        );
    }
}
