//! # Relay Limits
//!
//! Quotas applied to every fan-out batch:
//!
//! - [`ResourceLimiter`] admits or rejects a whole batch before any task
//!   starts (task count, recursion depth, projected cost against the
//!   remaining budget).
//! - [`LimitTracker`] accounts for one admitted batch: in-flight units,
//!   cost, successes and failures, and the batch deadline. Settling it
//!   commits cost back to the limiter and runs the post-batch checks.
//! - [`RateLimiter`] is a FIFO-fair token bucket shared by every dispatch.

#![deny(unsafe_code)]

mod error;
mod limiter;
mod limits;
mod rate_limiter;
mod tracker;

pub use error::{LimitError, LimitResult};
pub use limiter::ResourceLimiter;
pub use limits::ResourceLimits;
pub use rate_limiter::RateLimiter;
pub use tracker::{BatchUsage, InFlight, LimitTracker};

pub(crate) const MICROS_PER_UNIT: f64 = 1_000_000.0;

/// Convert a cost to integer micro-units so it can live in an atomic.
pub(crate) fn to_micros(cost: f64) -> u64 {
    if cost.is_finite() && cost > 0.0 {
        (cost * MICROS_PER_UNIT).round() as u64
    } else {
        0
    }
}

pub(crate) fn from_micros(micros: u64) -> f64 {
    micros as f64 / MICROS_PER_UNIT
}
