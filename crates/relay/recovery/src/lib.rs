//! # Relay Recovery
//!
//! One recovery executor applies an [`ErrorPolicy`](relay_types::ErrorPolicy)
//! around a dispatch operation:
//!
//! - **Raise**: a single attempt, the error propagates as is.
//! - **Retry**: transient faults are attempted again with exponential
//!   backoff and optional jitter. Permanent faults and open circuits stop
//!   immediately.
//! - **Fallback**: the primary target, then each alternative in order. The
//!   first success carries the trail of earlier failures.
//! - **PartialSuccess**: a single attempt per unit; the batch keeps going and
//!   reports a [`PartialOutcome`].
//!
//! Remote targets are protected by per-target [`CircuitBreaker`]s held in a
//! process-wide [`CircuitBreakerRegistry`].

#![deny(unsafe_code)]

mod backoff;
mod circuit_breaker;
mod config;
mod executor;
mod partial;
mod registry;

pub use backoff::retry_delay;
pub use circuit_breaker::{CallPermit, CircuitBreaker, CircuitBreakerStats, CircuitState};
pub use config::CircuitBreakerConfig;
pub use executor::{Recovered, RecoveryExecutor, RecoveryFailure};
pub use partial::PartialOutcome;
pub use registry::CircuitBreakerRegistry;
