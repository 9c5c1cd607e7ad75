//! Error types for relay-security.

use thiserror::Error;

/// Errors building security components from configuration.
#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

pub type SecurityResult<T> = Result<T, SecurityError>;
