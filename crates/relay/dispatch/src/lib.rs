//! # Relay Dispatch
//!
//! The hybrid dispatcher: one call path for four kinds of backend.
//!
//! - **Tool**: synchronous in-process handler
//! - **Function**: asynchronous in-process handler
//! - **Code**: source run by the [`SandboxRunner`] in an isolated OS process
//! - **Agent**: remote delegation through an [`AgentTransport`], guarded by
//!   a per-target circuit breaker
//!
//! Every call is sanitized on the way in, filtered on the way out, and
//! deduplicated through the idempotency cache. [`BatchExecutor`] fans one
//! template out over many argument sets under shared resource limits.

#![deny(unsafe_code)]

mod agent;
mod backend;
mod batch;
mod config;
mod dispatcher;
mod events;
mod registry;
mod sandbox;

pub use agent::{AgentTransport, DelegationRequest, DelegationResponse, HttpAgentTransport};
pub use backend::{function_fn, tool_fn, Backend, CodeUnit, FunctionHandler, ToolHandler};
pub use batch::{BatchExecutor, BatchOutcome, BatchRequest};
pub use config::DispatcherConfig;
pub use dispatcher::{DispatchContext, HybridDispatcher};
pub use events::{CollectingEventSink, EventSink, NoopEventSink, TracingEventSink};
pub use registry::{BackendLookup, BackendRegistry};
pub use sandbox::{
    InterpreterSpec, SandboxConfig, SandboxError, SandboxResult, SandboxRunner, PYTHON_HARNESS,
};
