//! Execution context of one plan run.
//!
//! The context is append-only: each step id receives exactly one slot, either
//! its output or the failure that ended it. Only the engine coordinating the
//! run writes to it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::BackendRef;
use crate::dispatch::AttemptFailure;
use crate::error::{ContextError, DispatchError};
use crate::ids::{RequestId, StepId};

/// Why a step has no output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum FailureCause {
    /// The step's own dispatch failed after its recovery policy was exhausted.
    Dispatch { error: DispatchError },
    /// An upstream step failed; `chain` runs from the root failure to the direct dependency.
    UpstreamFailed { chain: Vec<StepId> },
    /// A placeholder in the step's input could not be resolved.
    UnresolvedReference { reference: String },
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureCause::Dispatch { error } => write!(f, "{error}"),
            FailureCause::UpstreamFailed { chain } => {
                let chain: Vec<&str> = chain.iter().map(StepId::as_str).collect();
                write!(f, "upstream failure via {}", chain.join(" -> "))
            }
            FailureCause::UnresolvedReference { reference } => {
                write!(f, "unresolved reference {reference}")
            }
        }
    }
}

/// Terminal failure of one step, with enough detail to reconstruct what happened.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub step_id: StepId,
    pub target: BackendRef,
    pub attempts: u32,
    pub cause: FailureCause,
    pub trail: Vec<AttemptFailure>,
}

impl StepFailure {
    /// Chain of failed step ids ending at this step, root cause first.
    pub fn causal_chain(&self) -> Vec<StepId> {
        match &self.cause {
            FailureCause::UpstreamFailed { chain } => {
                let mut chain = chain.clone();
                chain.push(self.step_id.clone());
                chain
            }
            _ => vec![self.step_id.clone()],
        }
    }
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "step {} ({}) failed after {} attempt(s): {}",
            self.step_id, self.target, self.attempts, self.cause
        )
    }
}

/// State recorded for a step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum Slot {
    Completed(Value),
    Failed(StepFailure),
}

/// Append-only mapping from step id to its slot.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub request_id: Option<RequestId>,
    slots: BTreeMap<StepId, Slot>,
    /// Step ids in the order their slots were recorded.
    order: Vec<StepId>,
}

impl ExecutionContext {
    pub fn new(request_id: RequestId) -> Self {
        Self {
            request_id: Some(request_id),
            ..Self::default()
        }
    }

    pub fn record_output(&mut self, step_id: StepId, output: Value) -> Result<(), ContextError> {
        self.record(step_id, Slot::Completed(output))
    }

    pub fn record_failure(&mut self, failure: StepFailure) -> Result<(), ContextError> {
        self.record(failure.step_id.clone(), Slot::Failed(failure))
    }

    fn record(&mut self, step_id: StepId, slot: Slot) -> Result<(), ContextError> {
        if self.slots.contains_key(&step_id) {
            return Err(ContextError::AlreadyRecorded(step_id));
        }
        self.order.push(step_id.clone());
        self.slots.insert(step_id, slot);
        Ok(())
    }

    pub fn slot(&self, step_id: &StepId) -> Option<&Slot> {
        self.slots.get(step_id)
    }

    pub fn output(&self, step_id: &StepId) -> Option<&Value> {
        match self.slots.get(step_id) {
            Some(Slot::Completed(value)) => Some(value),
            _ => None,
        }
    }

    pub fn failure(&self, step_id: &StepId) -> Option<&StepFailure> {
        match self.slots.get(step_id) {
            Some(Slot::Failed(failure)) => Some(failure),
            _ => None,
        }
    }

    pub fn contains(&self, step_id: &StepId) -> bool {
        self.slots.contains_key(step_id)
    }

    pub fn is_completed(&self, step_id: &StepId) -> bool {
        matches!(self.slots.get(step_id), Some(Slot::Completed(_)))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn completed_count(&self) -> usize {
        self.slots
            .values()
            .filter(|s| matches!(s, Slot::Completed(_)))
            .count()
    }

    pub fn failures(&self) -> Vec<&StepFailure> {
        self.order
            .iter()
            .filter_map(|id| self.failure(id))
            .collect()
    }

    /// Step ids in recording order.
    pub fn recorded_order(&self) -> &[StepId] {
        &self.order
    }

    /// Completed outputs keyed by step id.
    pub fn outputs(&self) -> BTreeMap<&StepId, &Value> {
        self.slots
            .iter()
            .filter_map(|(id, slot)| match slot {
                Slot::Completed(value) => Some((id, value)),
                Slot::Failed(_) => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn failure(step: &str, cause: FailureCause) -> StepFailure {
        StepFailure {
            step_id: StepId::new(step),
            target: BackendRef::tool("t"),
            attempts: 1,
            cause,
            trail: Vec::new(),
        }
    }

    #[test]
    fn test_step_written_at_most_once() {
        let mut ctx = ExecutionContext::new(RequestId::new("r1"));
        ctx.record_output(StepId::new("a"), json!(1)).unwrap();

        let err = ctx.record_output(StepId::new("a"), json!(2)).unwrap_err();
        assert_eq!(err, ContextError::AlreadyRecorded(StepId::new("a")));
        assert_eq!(ctx.output(&StepId::new("a")), Some(&json!(1)));

        let err = ctx
            .record_failure(failure(
                "a",
                FailureCause::Dispatch {
                    error: DispatchError::Internal("late".into()),
                },
            ))
            .unwrap_err();
        assert_eq!(err, ContextError::AlreadyRecorded(StepId::new("a")));
    }

    #[test]
    fn test_failed_slots_are_not_outputs() {
        let mut ctx = ExecutionContext::default();
        ctx.record_output(StepId::new("ok"), json!("done")).unwrap();
        ctx.record_failure(failure(
            "bad",
            FailureCause::UnresolvedReference {
                reference: "{{steps.x.output}}".into(),
            },
        ))
        .unwrap();

        assert_eq!(ctx.len(), 2);
        assert_eq!(ctx.completed_count(), 1);
        assert!(ctx.output(&StepId::new("bad")).is_none());
        assert!(ctx.contains(&StepId::new("bad")));
        assert!(!ctx.is_completed(&StepId::new("bad")));
        assert_eq!(ctx.failures().len(), 1);
        assert_eq!(ctx.recorded_order(), &[StepId::new("ok"), StepId::new("bad")]);
    }

    #[test]
    fn test_causal_chain() {
        let f = failure(
            "c",
            FailureCause::UpstreamFailed {
                chain: vec![StepId::new("a"), StepId::new("b")],
            },
        );
        assert_eq!(
            f.causal_chain(),
            vec![StepId::new("a"), StepId::new("b"), StepId::new("c")]
        );
        assert!(f.to_string().contains("upstream failure via a -> b"));
    }
}
