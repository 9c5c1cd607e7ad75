//! # Relay Engine
//!
//! Runs a [`Plan`](relay_types::Plan) produced by an external planner:
//!
//! 1. validate its structure (ids, dependencies, cycles) before any dispatch
//! 2. repeatedly dispatch the ready set as one admitted, concurrent batch
//! 3. merge each settled batch into the append-only execution context
//! 4. optionally hand the finished context to an external [`Synthesizer`]
//!
//! Step inputs may reference earlier outputs with `{{steps.<id>.output}}`
//! or `{{steps.<id>.output.<path>}}` placeholders; see [`resolve`].
//!
//! ```rust,ignore
//! let engine = WorkflowEngine::from_config(&RelayConfig::for_profile(Profile::Production), registry)?;
//! let report = engine.run(&plan).await?;
//! ```

#![deny(unsafe_code)]

pub mod config;
mod engine;
pub mod error;
pub mod resolve;

pub use config::{EngineConfig, FailureMode, Profile, RelayConfig};
pub use engine::{validate_plan, RunReport, RunStatus, SynthesizedRun, Synthesizer, WorkflowEngine};
pub use error::{ConfigError, ConfigResult, EngineError, EngineResult, RunAborted};
pub use resolve::{references, resolve_input, Reference, ResolveError};
