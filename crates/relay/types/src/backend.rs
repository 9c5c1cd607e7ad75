//! Backend kinds and references.
//!
//! The set of backend kinds is closed. Dispatch code matches on
//! [`BackendKind`] exhaustively instead of interpreting free-form strings.

use serde::{Deserialize, Serialize};

/// The kind of execution backend a step or task is bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Deterministic, synchronous local tool.
    Tool,
    /// Typed asynchronous local function.
    Function,
    /// Untrusted code executed in an isolated OS process.
    Code,
    /// Remote agent reached through a delegation transport.
    Agent,
}

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [
        BackendKind::Tool,
        BackendKind::Function,
        BackendKind::Code,
        BackendKind::Agent,
    ];

    /// Whether calls leave the process (and so get circuit-breaker protection).
    pub fn is_remote(&self) -> bool {
        matches!(self, BackendKind::Agent)
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Tool => write!(f, "tool"),
            BackendKind::Function => write!(f, "function"),
            BackendKind::Code => write!(f, "code"),
            BackendKind::Agent => write!(f, "agent"),
        }
    }
}

/// Reference to a named backend of a given kind.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BackendRef {
    pub kind: BackendKind,
    pub name: String,
}

impl BackendRef {
    pub fn new(kind: BackendKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    pub fn tool(name: impl Into<String>) -> Self {
        Self::new(BackendKind::Tool, name)
    }

    pub fn function(name: impl Into<String>) -> Self {
        Self::new(BackendKind::Function, name)
    }

    pub fn code(name: impl Into<String>) -> Self {
        Self::new(BackendKind::Code, name)
    }

    pub fn agent(name: impl Into<String>) -> Self {
        Self::new(BackendKind::Agent, name)
    }
}

impl std::fmt::Display for BackendRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}
