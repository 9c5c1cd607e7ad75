//! Plans: the blueprint for one orchestration run
//!
//! A Plan is a directed acyclic graph where:
//! - Steps are units of work bound to one backend
//! - Dependencies are edges (a step waits for every step it depends on)
//!
//! Plans are produced by an external planner and are immutable once accepted.
//! [`Plan::validate`] rejects structural problems before anything runs.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::backend::BackendRef;
use crate::error::{PlanError, PlanResult};
use crate::ids::{RequestId, StepId};
use crate::policy::RetryPolicy;

// ── Step ────────────────────────────────────────────────────────────

/// One unit of work in a plan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    #[serde(rename = "backend")]
    pub target: BackendRef,
    /// Prompt text checked by the sanitizer before dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    /// Input value; strings of the form `{{steps.<id>.output}}` are placeholders.
    #[serde(default = "empty_object")]
    pub input: Value,
    #[serde(default)]
    pub depends_on: BTreeSet<StepId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Alternative backends tried in order when the primary fails.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallbacks: Vec<BackendRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl Step {
    pub fn new(id: impl Into<String>, target: BackendRef) -> Self {
        Self {
            id: StepId::new(id),
            target,
            template: None,
            input: empty_object(),
            depends_on: BTreeSet::new(),
            retry: None,
            fallbacks: Vec::new(),
            timeout_ms: None,
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn depends_on(mut self, step: impl Into<String>) -> Self {
        self.depends_on.insert(StepId::new(step));
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_fallback(mut self, target: BackendRef) -> Self {
        self.fallbacks.push(target);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

// ── Plan ────────────────────────────────────────────────────────────

/// A DAG of steps submitted for one execution run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub request_id: RequestId,
    pub steps: Vec<Step>,
    /// Instruction for the external synthesis step, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthesis: Option<String>,
}

impl Plan {
    pub fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            steps: Vec::new(),
            synthesis: None,
        }
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_synthesis(mut self, instruction: impl Into<String>) -> Self {
        self.synthesis = Some(instruction.into());
        self
    }

    /// Add a step, rejecting duplicate ids early.
    pub fn add_step(&mut self, step: Step) -> PlanResult<()> {
        if self.steps.iter().any(|s| s.id == step.id) {
            return Err(PlanError::DuplicateStepId(step.id));
        }
        self.steps.push(step);
        Ok(())
    }

    pub fn from_json_str(document: &str) -> PlanResult<Self> {
        serde_json::from_str(document).map_err(|e| PlanError::Malformed(e.to_string()))
    }

    pub fn from_yaml_str(document: &str) -> PlanResult<Self> {
        serde_yaml::from_str(document).map_err(|e| PlanError::Malformed(e.to_string()))
    }

    pub fn get_step(&self, id: &StepId) -> Option<&Step> {
        self.steps.iter().find(|s| &s.id == id)
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Validate the plan for structural correctness
    pub fn validate(&self) -> PlanResult<()> {
        if self.steps.is_empty() {
            return Err(PlanError::Empty);
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !step.id.is_well_formed() {
                return Err(PlanError::InvalidStepId(step.id.clone()));
            }
            if !seen.insert(&step.id) {
                return Err(PlanError::DuplicateStepId(step.id.clone()));
            }
        }

        for step in &self.steps {
            for dep in &step.depends_on {
                if dep == &step.id {
                    return Err(PlanError::SelfDependency(step.id.clone()));
                }
                if !seen.contains(dep) {
                    return Err(PlanError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        if let Some(path) = self.find_cycle() {
            return Err(PlanError::Cycle { path });
        }

        Ok(())
    }

    /// Depth-first search for a dependency cycle.
    ///
    /// Returns the cycle as a closed path (first id repeated at the end).
    fn find_cycle(&self) -> Option<Vec<StepId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        let index: HashMap<&StepId, &Step> = self.steps.iter().map(|s| (&s.id, s)).collect();
        let mut marks: HashMap<&StepId, Mark> =
            self.steps.iter().map(|s| (&s.id, Mark::Unvisited)).collect();

        for root in &self.steps {
            if marks[&root.id] != Mark::Unvisited {
                continue;
            }

            // One iterator of remaining dependencies per step on the current path.
            let mut path: Vec<&StepId> = vec![&root.id];
            let mut stack: Vec<std::collections::btree_set::Iter<'_, StepId>> =
                vec![root.depends_on.iter()];
            marks.insert(&root.id, Mark::InProgress);

            while let Some(deps) = stack.last_mut() {
                match deps.next() {
                    Some(dep) => match marks.get(dep).copied() {
                        Some(Mark::InProgress) => {
                            let start = path.iter().position(|id| *id == dep).unwrap_or(0);
                            let mut cycle: Vec<StepId> =
                                path[start..].iter().map(|id| (*id).clone()).collect();
                            cycle.push(dep.clone());
                            return Some(cycle);
                        }
                        Some(Mark::Unvisited) => {
                            if let Some(&step) = index.get(dep) {
                                marks.insert(&step.id, Mark::InProgress);
                                path.push(&step.id);
                                stack.push(step.depends_on.iter());
                            }
                        }
                        _ => {}
                    },
                    None => {
                        stack.pop();
                        if let Some(done) = path.pop() {
                            marks.insert(done, Mark::Done);
                        }
                    }
                }
            }
        }

        None
    }

    /// Group steps into dependency levels: level `n` depends only on levels `< n`.
    ///
    /// Only meaningful for a validated plan; steps caught in a cycle are omitted.
    pub fn levels(&self) -> Vec<Vec<StepId>> {
        let mut placed: HashSet<&StepId> = HashSet::new();
        let mut levels = Vec::new();

        loop {
            let level: Vec<&StepId> = self
                .steps
                .iter()
                .filter(|s| !placed.contains(&s.id))
                .filter(|s| s.depends_on.iter().all(|d| placed.contains(d)))
                .map(|s| &s.id)
                .collect();
            if level.is_empty() {
                break;
            }
            placed.extend(level.iter().copied());
            levels.push(level.into_iter().cloned().collect());
        }

        levels
    }
}
