//! Dispatch tasks, results and events.
//!
//! A [`DispatchTask`] is created per fan-out element and discarded once its
//! batch settles. A batch's [`DispatchResult`]s are always returned in task
//! index order, never completion order.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::backend::BackendRef;
use crate::error::DispatchError;
use crate::ids::{RequestId, StepId};

// ── Redaction ───────────────────────────────────────────────────────

/// Category of data removed or masked by the response filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedactionKind {
    SensitiveKey,
    NationalId,
    Email,
    PaymentCard,
    BearerToken,
}

impl RedactionKind {
    /// Marker written in place of a redacted substring.
    pub fn marker(&self) -> &'static str {
        match self {
            RedactionKind::SensitiveKey => "[REDACTED:key]",
            RedactionKind::NationalId => "[REDACTED:national_id]",
            RedactionKind::Email => "[REDACTED:email]",
            RedactionKind::PaymentCard => "[REDACTED:payment_card]",
            RedactionKind::BearerToken => "[REDACTED:token]",
        }
    }
}

/// One alteration the response filter made, addressed by JSON path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redaction {
    /// Dotted path of the altered value, `$` being the root.
    pub path: String,
    pub kind: RedactionKind,
}

// ── Dispatch Output ─────────────────────────────────────────────────

/// A successful, filtered backend output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DispatchOutput {
    pub value: Value,
    pub cost: f64,
    pub latency: Duration,
    /// Served from the idempotency cache without calling the backend.
    pub cache_hit: bool,
    pub redactions: Vec<Redaction>,
}

impl DispatchOutput {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            cost: 0.0,
            latency: Duration::ZERO,
            cache_hit: false,
            redactions: Vec::new(),
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    pub fn is_redacted(&self) -> bool {
        !self.redactions.is_empty()
    }
}

/// A failed attempt recorded on the way to a result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttemptFailure {
    pub target: BackendRef,
    pub attempt: u32,
    pub error: DispatchError,
}

// ── Dispatch Task ───────────────────────────────────────────────────

/// One element of a fan-out batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DispatchTask {
    /// Position in the batch's argument list.
    pub index: usize,
    pub target: BackendRef,
    pub template: String,
    pub arguments: Map<String, Value>,
    pub timeout: Option<Duration>,
    pub idempotency_key: String,
}

impl DispatchTask {
    pub fn new(
        index: usize,
        target: BackendRef,
        template: impl Into<String>,
        arguments: Map<String, Value>,
    ) -> Self {
        Self {
            index,
            target,
            template: template.into(),
            arguments,
            timeout: None,
            idempotency_key: String::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = key.into();
        self
    }

    /// The template with `{name}` placeholders bound to this task's arguments.
    pub fn bound_template(&self) -> String {
        bind_template(&self.template, &self.arguments)
    }

    /// The value handed to the backend.
    pub fn payload(&self) -> Value {
        json!({
            "prompt": self.bound_template(),
            "arguments": Value::Object(self.arguments.clone()),
        })
    }
}

/// Substitute `{name}` placeholders with argument values.
///
/// String arguments are inserted verbatim, other values as compact JSON.
/// Placeholders without a matching argument are left untouched.
pub fn bind_template(template: &str, arguments: &Map<String, Value>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) if is_placeholder_name(&after[..end]) => {
                let key = &after[..end];
                match arguments.get(key) {
                    Some(Value::String(s)) => out.push_str(s),
                    Some(other) => out.push_str(&other.to_string()),
                    None => {
                        out.push('{');
                        out.push_str(key);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }

    out.push_str(rest);
    out
}

fn is_placeholder_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ── Dispatch Result ─────────────────────────────────────────────────

/// Settled outcome of one task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DispatchResult {
    pub index: usize,
    /// Backend that produced the final outcome (a fallback may differ from the task's).
    pub target: BackendRef,
    pub output: Option<Value>,
    pub error: Option<DispatchError>,
    pub success: bool,
    pub duration: Duration,
    pub cost: f64,
    pub attempts: u32,
    pub cache_hit: bool,
    pub redactions: Vec<Redaction>,
    /// Failed attempts preceding the outcome.
    pub trail: Vec<AttemptFailure>,
}

impl DispatchResult {
    pub fn succeeded(index: usize, target: BackendRef, output: DispatchOutput) -> Self {
        Self {
            index,
            target,
            duration: output.latency,
            cost: output.cost,
            cache_hit: output.cache_hit,
            redactions: output.redactions,
            output: Some(output.value),
            error: None,
            success: true,
            attempts: 1,
            trail: Vec::new(),
        }
    }

    pub fn failed(index: usize, target: BackendRef, error: DispatchError) -> Self {
        Self {
            index,
            target,
            output: None,
            error: Some(error),
            success: false,
            duration: Duration::ZERO,
            cost: 0.0,
            attempts: 1,
            cache_hit: false,
            redactions: Vec::new(),
            trail: Vec::new(),
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_trail(mut self, trail: Vec<AttemptFailure>) -> Self {
        self.trail = trail;
        self
    }

    /// Look up a dotted field path (`metrics.score`, `items.0`) in the output.
    pub fn field(&self, path: &str) -> Option<&Value> {
        let mut current = self.output.as_ref()?;
        if path.is_empty() {
            return Some(current);
        }
        for segment in path.split('.') {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

// ── Dispatch Event ──────────────────────────────────────────────────

/// Structured record emitted once per dispatch attempt for an external metrics sink.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DispatchEvent {
    pub request_id: Option<RequestId>,
    pub step_id: Option<StepId>,
    pub target: BackendRef,
    pub success: bool,
    pub latency: Duration,
    pub cost: f64,
    pub attempt: u32,
    pub cache_hit: bool,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}
