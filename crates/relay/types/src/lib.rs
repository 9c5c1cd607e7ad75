//! Relay domain types
//!
//! Shared vocabulary for the Relay orchestration core. A [`Plan`] is a DAG of
//! [`Step`]s, each bound to one backend ([`BackendRef`]) of a closed set of
//! kinds: tools, functions, sandboxed code and remote agents.
//!
//! # Contents
//!
//! - [`plan`]: plans, steps and structural validation (cycle detection)
//! - [`backend`]: backend kinds and references
//! - [`policy`]: error policies and retry configuration
//! - [`dispatch`]: fan-out tasks, dispatch results and per-dispatch events
//! - [`context`]: the append-only execution context of one plan run
//! - [`error`]: the error taxonomy shared by every layer
//!
//! This crate performs no I/O. Everything here is a value type that the
//! engine, dispatcher and recovery layers pass between each other.

#![deny(unsafe_code)]

pub mod backend;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod ids;
pub mod plan;
pub mod policy;

pub use backend::{BackendKind, BackendRef};
pub use context::{ExecutionContext, FailureCause, Slot, StepFailure};
pub use dispatch::{
    bind_template, AttemptFailure, DispatchEvent, DispatchOutput, DispatchResult, DispatchTask,
    Redaction, RedactionKind,
};
pub use error::{
    ContextError, DispatchError, ErrorClass, FaultKind, PlanError, PlanResult, QuotaViolation,
};
pub use ids::{RequestId, StepId};
pub use plan::{Plan, Step};
pub use policy::{ErrorPolicy, RetryPolicy};
