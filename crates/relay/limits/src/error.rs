//! Error types for relay-limits.
//!
//! Quota violations raised while running a batch are
//! [`relay_types::DispatchError::QuotaExceeded`]; this enum only covers
//! invalid limit configuration.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LimitError {
    #[error("invalid limit {field}: {reason}")]
    InvalidLimit { field: &'static str, reason: String },
}

pub type LimitResult<T> = Result<T, LimitError>;
