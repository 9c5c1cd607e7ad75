//! # Relay Aggregate
//!
//! Pure reductions over the results of a fan-out batch. Results arrive in
//! input order; every function here is deterministic over that order.
//!
//! Field paths are dotted (`metrics.score`, `items.0`) and resolved inside
//! each result's output.

#![deny(unsafe_code)]

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use relay_types::DispatchResult;

// ── Functions ───────────────────────────────────────────────────────

/// Every result, in original order, failures included.
pub fn collect_all(results: &[DispatchResult]) -> Vec<&DispatchResult> {
    results.iter().collect()
}

/// Successful results sorted descending by a numeric field.
///
/// The sort is stable, so equal scores keep their original order. Successes
/// without a numeric value at `path` follow, also in original order.
pub fn rank_by_metric<'a>(results: &'a [DispatchResult], path: &str) -> Vec<&'a DispatchResult> {
    let (mut scored, unscored): (Vec<_>, Vec<_>) = results
        .iter()
        .filter(|r| r.success)
        .map(|r| (r.field(path).and_then(Value::as_f64), r))
        .partition(|(score, _)| score.is_some());

    scored.sort_by(|(a, _), (b, _)| {
        b.partial_cmp(a).unwrap_or(Ordering::Equal)
    });

    scored
        .into_iter()
        .chain(unscored)
        .map(|(_, r)| r)
        .collect()
}

/// Winner of a majority vote over one field of the successful results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub value: Value,
    pub count: usize,
    /// Successful results that had the field.
    pub voters: usize,
}

/// Most frequent value of `path` among successes. Ties go to the value seen first.
pub fn majority_vote(results: &[DispatchResult], path: &str) -> Option<Vote> {
    // (value, count) in order of first occurrence
    let mut tally: Vec<(&Value, usize)> = Vec::new();
    let mut voters = 0;

    for value in results.iter().filter(|r| r.success).filter_map(|r| r.field(path)) {
        voters += 1;
        match tally.iter_mut().find(|(seen, _)| *seen == value) {
            Some((_, count)) => *count += 1,
            None => tally.push((value, 1)),
        }
    }

    let mut winner: Option<(&Value, usize)> = None;
    for (value, count) in tally {
        if winner.map_or(true, |(_, best)| count > best) {
            winner = Some((value, count));
        }
    }
    winner.map(|(value, count)| Vote {
        value: value.clone(),
        count,
        voters,
    })
}

/// Successful result with the highest score. Ties go to the earliest result;
/// results the scorer returns `None` for are skipped.
pub fn best_result<F>(results: &[DispatchResult], mut score: F) -> Option<&DispatchResult>
where
    F: FnMut(&DispatchResult) -> Option<f64>,
{
    let mut best: Option<(f64, &DispatchResult)> = None;
    for result in results.iter().filter(|r| r.success) {
        let Some(s) = score(result) else {
            continue;
        };
        if best.map_or(true, |(top, _)| s > top) {
            best = Some((s, result));
        }
    }
    best.map(|(_, r)| r)
}

/// Apply an arbitrary reduction to the full result list, failures included.
pub fn aggregate_with<R, F>(results: &[DispatchResult], f: F) -> R
where
    F: FnOnce(&[DispatchResult]) -> R,
{
    f(results)
}

// ── Declarative Aggregation ─────────────────────────────────────────

/// Aggregation named inside a batch request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Aggregation {
    /// Outputs in input order, `null` for failures.
    CollectAll,
    /// Successful outputs ranked by a numeric field.
    RankByMetric { field: String },
    /// Most frequent value of a field.
    MajorityVote { field: String },
    /// Output with the highest numeric field.
    BestByMetric { field: String },
}

impl Aggregation {
    /// Reduce `results` to a single JSON value.
    pub fn apply(&self, results: &[DispatchResult]) -> Value {
        match self {
            Aggregation::CollectAll => Value::Array(
                collect_all(results)
                    .into_iter()
                    .map(|r| r.output.clone().unwrap_or(Value::Null))
                    .collect(),
            ),
            Aggregation::RankByMetric { field } => Value::Array(
                rank_by_metric(results, field)
                    .into_iter()
                    .map(|r| r.output.clone().unwrap_or(Value::Null))
                    .collect(),
            ),
            Aggregation::MajorityVote { field } => majority_vote(results, field)
                .map(|vote| vote.value)
                .unwrap_or(Value::Null),
            Aggregation::BestByMetric { field } => {
                best_result(results, |r| r.field(field).and_then(Value::as_f64))
                    .and_then(|r| r.output.clone())
                    .unwrap_or(Value::Null)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use relay_types::{BackendRef, DispatchError, DispatchOutput};
    use serde_json::json;

    fn ok(index: usize, value: Value) -> DispatchResult {
        DispatchResult::succeeded(index, BackendRef::function("f"), DispatchOutput::new(value))
    }

    fn failed(index: usize) -> DispatchResult {
        DispatchResult::failed(
            index,
            BackendRef::function("f"),
            DispatchError::Connection("down".into()),
        )
    }

    fn scores(results: &[&DispatchResult]) -> Vec<f64> {
        results
            .iter()
            .filter_map(|r| r.field("score").and_then(Value::as_f64))
            .collect()
    }

    #[test]
    fn test_rank_versus_collect_order() {
        let results = vec![
            ok(0, json!({"score": 0.3})),
            ok(1, json!({"score": 0.9})),
            ok(2, json!({"score": 0.1})),
        ];
        assert_eq!(scores(&rank_by_metric(&results, "score")), vec![0.9, 0.3, 0.1]);
        assert_eq!(scores(&collect_all(&results)), vec![0.3, 0.9, 0.1]);
    }

    #[test]
    fn test_rank_is_stable_and_trails_missing_metric() {
        let results = vec![
            ok(0, json!({"name": "no score"})),
            ok(1, json!({"score": 0.5, "id": "first"})),
            failed(2),
            ok(3, json!({"score": 0.5, "id": "second"})),
            ok(4, json!({"score": "high"})),
        ];
        let ranked: Vec<usize> = rank_by_metric(&results, "score").iter().map(|r| r.index).collect();
        assert_eq!(ranked, vec![1, 3, 0, 4]);
    }

    #[test]
    fn test_majority_vote_tie_goes_to_first() {
        let results = vec![
            ok(0, json!({"label": "cat"})),
            ok(1, json!({"label": "dog"})),
            failed(2),
            ok(3, json!({"label": "dog"})),
            ok(4, json!({"label": "cat"})),
        ];
        let vote = majority_vote(&results, "label").unwrap();
        assert_eq!(vote.value, json!("cat"));
        assert_eq!(vote.count, 2);
        assert_eq!(vote.voters, 4);

        assert!(majority_vote(&results, "missing").is_none());
    }

    #[test]
    fn test_best_result_tie_goes_to_first() {
        let results = vec![
            ok(0, json!({"score": 2})),
            ok(1, json!({"score": 7})),
            ok(2, json!({"score": 7})),
            failed(3),
        ];
        let best = best_result(&results, |r| r.field("score").and_then(Value::as_f64)).unwrap();
        assert_eq!(best.index, 1);
        assert!(best_result(&[failed(0)], |_| Some(1.0)).is_none());
    }

    #[test]
    fn test_aggregate_with_sees_failures() {
        let results = vec![ok(0, json!(1)), failed(1), failed(2)];
        let failures = aggregate_with(&results, |all| all.iter().filter(|r| !r.success).count());
        assert_eq!(failures, 2);
    }

    #[test]
    fn test_declarative_aggregation() {
        let results = vec![ok(0, json!({"score": 1})), failed(1), ok(2, json!({"score": 3}))];
        assert_eq!(
            Aggregation::CollectAll.apply(&results),
            json!([{"score": 1}, null, {"score": 3}])
        );
        assert_eq!(
            Aggregation::RankByMetric { field: "score".into() }.apply(&results),
            json!([{"score": 3}, {"score": 1}])
        );
        assert_eq!(
            Aggregation::BestByMetric { field: "score".into() }.apply(&results),
            json!({"score": 3})
        );
        let parsed: Aggregation =
            serde_json::from_value(json!({"kind": "majority_vote", "field": "label"})).unwrap();
        assert_eq!(parsed, Aggregation::MajorityVote { field: "label".into() });
    }

    proptest! {
        #[test]
        fn prop_rank_is_sorted_permutation_of_successes(
            raw in proptest::collection::vec(proptest::option::of(0u32..100), 0..30)
        ) {
            let results: Vec<DispatchResult> = raw
                .iter()
                .enumerate()
                .map(|(i, s)| match s {
                    Some(score) => ok(i, json!({"score": score})),
                    None => failed(i),
                })
                .collect();

            let ranked = rank_by_metric(&results, "score");
            prop_assert_eq!(ranked.len(), raw.iter().filter(|s| s.is_some()).count());
            for pair in ranked.windows(2) {
                let a = pair[0].field("score").and_then(Value::as_f64).unwrap();
                let b = pair[1].field("score").and_then(Value::as_f64).unwrap();
                prop_assert!(a > b || (a == b && pair[0].index < pair[1].index));
            }
        }
    }
}
