//! Engine errors.

use thiserror::Error;

use relay_limits::LimitError;
use relay_security::SecurityError;
use relay_types::{
    ContextError, DispatchError, ExecutionContext, PlanError, StepFailure, StepId,
};

/// Why a run, or one step of it, could not complete.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("invalid plan: {0}")]
    Plan(#[from] PlanError),

    #[error("step {step}: unresolved reference {reference}")]
    UnresolvedReference { step: StepId, reference: String },

    #[error("step {step} skipped: dependency failed ({})", format_chain(.chain))]
    DependencyFailed { step: StepId, chain: Vec<StepId> },

    #[error("{0}")]
    StepFailed(Box<StepFailure>),

    #[error("batch rejected: {0}")]
    Quota(DispatchError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("synthesis failed: {0}")]
    Synthesis(String),

    #[error("internal error: {0}")]
    Internal(String),
}

fn format_chain(chain: &[StepId]) -> String {
    chain
        .iter()
        .map(StepId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

pub type EngineResult<T> = Result<T, EngineError>;

/// A run that stopped early, with everything recorded before it stopped.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("run aborted: {error}")]
pub struct RunAborted {
    pub error: EngineError,
    pub partial: ExecutionContext,
}

/// Configuration that cannot be loaded or used.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("malformed configuration: {0}")]
    Malformed(String),

    #[error(transparent)]
    Limits(#[from] LimitError),

    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;
