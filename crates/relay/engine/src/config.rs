//! Engine and top-level Relay configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use relay_dispatch::DispatcherConfig;
use relay_limits::ResourceLimits;
use relay_recovery::CircuitBreakerConfig;
use relay_types::{ErrorPolicy, RetryPolicy};

use crate::error::{ConfigError, ConfigResult};

/// What a run does when a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Abort once the batch holding the failed step settles.
    #[default]
    AbortAll,
    /// Record the failure, fail its dependents without dispatching them, run the rest.
    ContinueDegraded,
}

/// Workflow engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub failure_mode: FailureMode,
    /// Policy for steps that declare neither retries nor fallbacks.
    pub default_policy: ErrorPolicy,
    /// Delegation depth the engine's own batches are admitted at.
    pub depth: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            failure_mode: FailureMode::AbortAll,
            default_policy: ErrorPolicy::Raise,
            depth: 0,
        }
    }
}

/// Deployment profile used to pick a coherent set of defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    Development,
    Production,
    Strict,
}

/// Everything needed to assemble an engine.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub engine: EngineConfig,
    pub limits: ResourceLimits,
    pub circuit_breaker: CircuitBreakerConfig,
    pub dispatcher: DispatcherConfig,
}

impl RelayConfig {
    /// Defaults tuned for a deployment profile.
    pub fn for_profile(profile: Profile) -> Self {
        let mut config = Self::default();

        match profile {
            Profile::Development => {
                // Local iteration: keep going past failures, generous budget
                config.engine.failure_mode = FailureMode::ContinueDegraded;
                config.limits.max_total_cost = 1_000.0;
                config.limits.max_concurrent = 4;
                config.circuit_breaker.cool_down = Duration::from_secs(5);
                config.dispatcher.security.idempotency_ttl = Duration::from_secs(60);
                config.dispatcher.sandbox.timeout = Duration::from_secs(10);
            }
            Profile::Production => {
                config.engine.default_policy = ErrorPolicy::Retry(RetryPolicy::default());
                config.limits.requests_per_second = Some(20.0);
                config.limits.burst = 5;
                config.limits.max_concurrent = 16;
                config.limits.max_failure_rate = 0.5;
                config.dispatcher.sandbox = config.dispatcher.sandbox.with_detected_isolation();
            }
            Profile::Strict => {
                // Untrusted plans: tight budget, shallow delegation, fail fast
                config.limits.max_total_cost = 10.0;
                config.limits.max_concurrent = 4;
                config.limits.max_total_tasks = 100;
                config.limits.max_recursion_depth = 1;
                config.limits.requests_per_second = Some(5.0);
                config.limits.burst = 1;
                config.limits.max_failure_rate = 0.2;
                config.limits.max_task_duration = Duration::from_secs(10);
                config.circuit_breaker = CircuitBreakerConfig::new(3, Duration::from_secs(60));
                config.dispatcher.default_timeout = Duration::from_secs(10);
                config.dispatcher.sandbox.timeout = Duration::from_secs(2);
                config.dispatcher.sandbox.memory_limit_kb = Some(256 * 1024);
                config.dispatcher.sandbox = config.dispatcher.sandbox.with_detected_isolation();
            }
        }

        config
    }

    pub fn from_yaml_str(document: &str) -> ConfigResult<Self> {
        let config: Self =
            serde_yaml::from_str(document).map_err(|e| ConfigError::Malformed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(document: &str) -> ConfigResult<Self> {
        let config: Self =
            serde_json::from_str(document).map_err(|e| ConfigError::Malformed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.limits.validate()?;
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid {
                field: "circuit_breaker.failure_threshold",
                reason: "must be at least 1".into(),
            });
        }
        if self.dispatcher.default_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "dispatcher.default_timeout",
                reason: "must be non-zero".into(),
            });
        }
        if self.dispatcher.sandbox.timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "dispatcher.sandbox.timeout",
                reason: "must be non-zero".into(),
            });
        }
        if self.engine.depth > self.limits.max_recursion_depth {
            return Err(ConfigError::Invalid {
                field: "engine.depth",
                reason: format!(
                    "{} exceeds max_recursion_depth {}",
                    self.engine.depth, self.limits.max_recursion_depth
                ),
            });
        }
        if let ErrorPolicy::Retry(retry) = &self.engine.default_policy {
            if retry.max_attempts == 0 {
                return Err(ConfigError::Invalid {
                    field: "engine.default_policy.max_attempts",
                    reason: "must be at least 1".into(),
                });
            }
        }
        Ok(())
    }
}
