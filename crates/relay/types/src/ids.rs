//! Identifiers for plan runs and steps.

use serde::{Deserialize, Serialize};

// ── Request Identifier ──────────────────────────────────────────────

/// Identifier of one plan run, supplied by the planner or generated.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Step Identifier ─────────────────────────────────────────────────

/// Identifier of a step, unique within its plan.
///
/// Well-formed ids contain only ASCII alphanumerics, `_` and `-`, so that
/// `{{steps.<id>.output.<path>}}` placeholders split unambiguously.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub String);

impl StepId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is non-empty and uses only `[A-Za-z0-9_-]`.
    pub fn is_well_formed(&self) -> bool {
        !self.0.is_empty()
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StepId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_id_well_formed() {
        assert!(StepId::new("fetch_prices-2").is_well_formed());
        assert!(!StepId::new("").is_well_formed());
        assert!(!StepId::new("a.b").is_well_formed());
        assert!(!StepId::new("has space").is_well_formed());
    }

    #[test]
    fn test_request_id_short() {
        let id = RequestId::new("abcdef0123456789");
        assert_eq!(id.short(), "abcdef01");
        assert_eq!(RequestId::new("abc").short(), "abc");
        assert_ne!(RequestId::generate(), RequestId::generate());
    }
}
