//! Placeholder resolution.
//!
//! A JSON string that is exactly `{{steps.<id>.output}}` is replaced by the
//! recorded output of step `<id>`; `{{steps.<id>.output.<path>}}` projects a
//! dotted path (object keys, array indices) into it. Substitution is
//! recursive through arrays and objects and never touches strings that merely
//! contain a placeholder.

use std::collections::BTreeSet;

use serde_json::{Map, Value};

use relay_types::{ExecutionContext, Slot, StepId};

const OPEN: &str = "{{";
const CLOSE: &str = "}}";
const SCOPE: &str = "steps.";

/// A parsed `{{steps.<id>.output[.<path>]}}` placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub step: StepId,
    pub path: Vec<String>,
}

impl Reference {
    /// Parse `text` as a placeholder.
    ///
    /// Returns `None` for ordinary strings and `Some(Err(_))` for strings shaped
    /// like a step placeholder that cannot be parsed.
    pub fn parse(text: &str) -> Option<Result<Self, String>> {
        let inner = text.strip_prefix(OPEN)?.strip_suffix(CLOSE)?;
        let rest = inner.strip_prefix(SCOPE)?;
        Some(Self::parse_body(rest).ok_or_else(|| text.to_string()))
    }

    fn parse_body(body: &str) -> Option<Self> {
        let mut segments = body.split('.');
        let step = StepId::new(segments.next()?);
        if !step.is_well_formed() || segments.next()? != "output" {
            return None;
        }
        let path: Vec<String> = segments.map(str::to_string).collect();
        if path.iter().any(String::is_empty) {
            return None;
        }
        Some(Self { step, path })
    }

    /// Project this reference's path into `output`.
    pub fn project<'a>(&self, output: &'a Value) -> Option<&'a Value> {
        self.path.iter().try_fold(output, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?),
            _ => None,
        })
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{OPEN}{SCOPE}{}.output", self.step)?;
        for segment in &self.path {
            write!(f, ".{segment}")?;
        }
        f.write_str(CLOSE)
    }
}

/// Why an input could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// Malformed placeholder, undeclared or unrecorded step, or a path missing from the output.
    Unresolved(String),
    /// The referenced step failed.
    DependencyFailed(StepId),
}

/// Every placeholder in `value`, in document order. Malformed ones are skipped.
pub fn references(value: &Value) -> Vec<Reference> {
    let mut found = Vec::new();
    collect(value, &mut found);
    found
}

fn collect(value: &Value, found: &mut Vec<Reference>) {
    match value {
        Value::String(text) => {
            if let Some(Ok(reference)) = Reference::parse(text) {
                found.push(reference);
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect(v, found)),
        Value::Object(map) => map.values().for_each(|v| collect(v, found)),
        _ => {}
    }
}

/// Substitute placeholders in `input` with outputs recorded in `context`.
///
/// Only steps in `dependencies` may be referenced, so a step never reads
/// output it is not ordered after.
pub fn resolve_input(
    input: &Value,
    dependencies: &BTreeSet<StepId>,
    context: &ExecutionContext,
) -> Result<Value, ResolveError> {
    match input {
        Value::String(text) => match Reference::parse(text) {
            None => Ok(input.clone()),
            Some(Err(raw)) => Err(ResolveError::Unresolved(raw)),
            Some(Ok(reference)) => lookup(&reference, dependencies, context),
        },
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_input(item, dependencies, context))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| Ok((k.clone(), resolve_input(v, dependencies, context)?)))
            .collect::<Result<Map<_, _>, _>>()
            .map(Value::Object),
        _ => Ok(input.clone()),
    }
}

fn lookup(
    reference: &Reference,
    dependencies: &BTreeSet<StepId>,
    context: &ExecutionContext,
) -> Result<Value, ResolveError> {
    if !dependencies.contains(&reference.step) {
        return Err(ResolveError::Unresolved(reference.to_string()));
    }
    match context.slot(&reference.step) {
        Some(Slot::Completed(output)) => reference
            .project(output)
            .cloned()
            .ok_or_else(|| ResolveError::Unresolved(reference.to_string())),
        Some(Slot::Failed(_)) => Err(ResolveError::DependencyFailed(reference.step.clone())),
        None => Err(ResolveError::Unresolved(reference.to_string())),
    }
}
