//! Partial-success settlement.

use serde::{Deserialize, Serialize};

use relay_types::DispatchResult;

/// Summary of a batch that kept going past failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialOutcome {
    pub successes: usize,
    pub failures: usize,
    /// Successes over total results; zero for an empty batch.
    pub success_ratio: f64,
    /// Input indices of the failed units.
    pub failed_indices: Vec<usize>,
}

impl PartialOutcome {
    pub fn from_results(results: &[DispatchResult]) -> Self {
        let failed_indices: Vec<usize> = results
            .iter()
            .filter(|r| !r.success)
            .map(|r| r.index)
            .collect();
        let failures = failed_indices.len();
        let successes = results.len() - failures;
        let success_ratio = if results.is_empty() {
            0.0
        } else {
            successes as f64 / results.len() as f64
        };
        Self {
            successes,
            failures,
            success_ratio,
            failed_indices,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failures == 0
    }
}
