//! Error policies and retry configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::BackendRef;

/// Exponential backoff retry configuration.
///
/// `max_attempts` counts the first attempt, so `max_attempts = 3` allows two
/// retries. Delays are kept in milliseconds so plans stay readable as JSON or
/// YAML documents.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Un-jittered delay to wait after the given failed attempt (1-based).
    pub fn backoff(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(63) as i32;
        let raw = self.base_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// What to do when a dispatch fails.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Propagate the first failure immediately.
    Raise,
    /// Re-attempt transient failures with exponential backoff.
    Retry(RetryPolicy),
    /// Try each alternative backend in order after the primary fails.
    ///
    /// With `retry` set, every target in the chain gets that many attempts
    /// before the next one is tried.
    Fallback {
        alternatives: Vec<BackendRef>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry: Option<RetryPolicy>,
    },
    /// Collect failures next to successes instead of aborting the batch.
    PartialSuccess,
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        ErrorPolicy::Raise
    }
}

impl ErrorPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorPolicy::Raise => "raise",
            ErrorPolicy::Retry(_) => "retry",
            ErrorPolicy::Fallback { .. } => "fallback",
            ErrorPolicy::PartialSuccess => "partial_success",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_exponentially_and_caps() {
        let policy = RetryPolicy::new(10)
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(1_000))
            .without_jitter();

        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(5), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(60), Duration::from_millis(1_000));
    }

    #[test]
    fn test_policy_document_form() {
        let policy: ErrorPolicy = serde_json::from_str(
            r#"{"mode":"fallback","alternatives":[{"kind":"agent","name":"backup"}]}"#,
        )
        .unwrap();
        assert_eq!(
            policy,
            ErrorPolicy::Fallback {
                alternatives: vec![BackendRef::agent("backup")],
                retry: None,
            }
        );

        let retry: ErrorPolicy =
            serde_json::from_str(r#"{"mode":"retry","max_attempts":5}"#).unwrap();
        match retry {
            ErrorPolicy::Retry(p) => {
                assert_eq!(p.max_attempts, 5);
                assert_eq!(p.base_delay_ms, 100);
            }
            other => panic!("unexpected policy {other:?}"),
        }
    }
}
