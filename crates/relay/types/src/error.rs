//! Error taxonomy for the orchestration core.
//!
//! Every fault a dispatch can produce is a [`DispatchError`]. Its
//! [`ErrorClass`] decides how the recovery layer treats it: transient faults
//! may be retried, permanent faults never are, circuit-open faults fail fast
//! and quota faults end the batch.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::{BackendKind, BackendRef};
use crate::ids::StepId;

// ── Plan Errors ─────────────────────────────────────────────────────

/// Structural problems with a plan. Always detected before any dispatch.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanError {
    #[error("plan has no steps")]
    Empty,

    #[error("invalid step id '{0}': only [A-Za-z0-9_-] allowed")]
    InvalidStepId(StepId),

    #[error("duplicate step id: {0}")]
    DuplicateStepId(StepId),

    #[error("step {step} depends on unknown step {dependency}")]
    UnknownDependency { step: StepId, dependency: StepId },

    #[error("step {0} depends on itself")]
    SelfDependency(StepId),

    #[error("dependency cycle: {}", format_cycle(.path))]
    Cycle { path: Vec<StepId> },

    #[error("malformed plan document: {0}")]
    Malformed(String),
}

fn format_cycle(path: &[StepId]) -> String {
    path.iter()
        .map(StepId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

pub type PlanResult<T> = Result<T, PlanError>;

// ── Context Errors ──────────────────────────────────────────────────

/// Violations of the execution context's write-once rule.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("step {0} already has a recorded slot")]
    AlreadyRecorded(StepId),
}

// ── Dispatch Errors ─────────────────────────────────────────────────

/// How the recovery layer must treat an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// May succeed if attempted again (timeouts, connection faults, sandbox faults).
    Transient,
    /// Will fail again no matter how often it is attempted.
    Permanent,
    /// Refused by an open circuit breaker; not retried within the same call.
    CircuitOpen,
    /// A budget was exhausted; fatal for the batch.
    Quota,
    /// The unit was cancelled by its batch.
    Cancelled,
}

/// What went wrong inside a sandboxed code execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// The code raised or reported an error.
    Exception,
    /// The process exceeded its wall-clock bound and was killed.
    Timeout,
    /// The process produced output that is not the expected JSON envelope.
    NonSerializable,
    /// The isolated process could not be started.
    Spawn,
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FaultKind::Exception => write!(f, "exception"),
            FaultKind::Timeout => write!(f, "timeout"),
            FaultKind::NonSerializable => write!(f, "non-serializable output"),
            FaultKind::Spawn => write!(f, "spawn failure"),
        }
    }
}

/// A budget ceiling that was hit.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum QuotaViolation {
    #[error("batch of {requested} tasks exceeds max of {max}")]
    TooManyTasks { requested: usize, max: usize },

    #[error("recursion depth {depth} exceeds max of {max}")]
    RecursionDepth { depth: u32, max: u32 },

    #[error("projected cost {projected:.4} exceeds remaining budget {remaining:.4}")]
    CostBudget { projected: f64, remaining: f64 },

    #[error("only {succeeded} tasks succeeded, at least {required} required")]
    MinSuccess { succeeded: usize, required: usize },

    #[error("failure rate {rate:.2} exceeds max of {max:.2}")]
    FailureRate { rate: f64, max: f64 },
}

/// Any fault produced while dispatching one unit of work.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum DispatchError {
    #[error("unknown {kind} backend '{name}' (known: {})", .known.join(", "))]
    UnknownBackend {
        kind: BackendKind,
        name: String,
        known: Vec<String>,
    },

    #[error("unsafe input rejected: matched deny pattern '{pattern}'")]
    UnsafeInput { pattern: String },

    #[error("execution fault in {target} ({kind}): {reason}")]
    ExecutionFault {
        target: String,
        kind: FaultKind,
        reason: String,
    },

    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("connection fault: {0}")]
    Connection(String),

    #[error("circuit open for {target}")]
    CircuitOpen { target: String },

    #[error("quota exceeded: {0}")]
    QuotaExceeded(QuotaViolation),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("fallback chain exhausted after {} targets: {last}", .chain.len())]
    FallbackExhausted {
        chain: Vec<BackendRef>,
        last: Box<DispatchError>,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Classify this error for the recovery layer.
    pub fn class(&self) -> ErrorClass {
        match self {
            DispatchError::ExecutionFault { .. }
            | DispatchError::Timeout { .. }
            | DispatchError::Connection(_) => ErrorClass::Transient,
            DispatchError::CircuitOpen { .. } => ErrorClass::CircuitOpen,
            DispatchError::QuotaExceeded(_) => ErrorClass::Quota,
            DispatchError::Cancelled { .. } => ErrorClass::Cancelled,
            DispatchError::FallbackExhausted { last, .. } => last.class(),
            DispatchError::UnknownBackend { .. }
            | DispatchError::UnsafeInput { .. }
            | DispatchError::Unauthorized(_)
            | DispatchError::Validation(_)
            | DispatchError::Internal(_) => ErrorClass::Permanent,
        }
    }

    /// Whether a retry policy may attempt the call again.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    pub fn timeout(timeout: std::time::Duration) -> Self {
        DispatchError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        DispatchError::Cancelled {
            reason: reason.into(),
        }
    }
}
