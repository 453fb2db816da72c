//! Merge rules for the three sync actions.
//!
//! `init` seeds the reserved metadata, `sync` is a top-level shallow
//! merge (unchanged subtrees are moved, never copied), and `aggregate`
//! folds N branch deltas with seq-concat / map-deep-merge / lowest-index
//! scalar semantics. Scalar last-writer-wins across branches is only
//! sound when branches write disjoint keys — that is an authoring
//! precondition, not something the kernel can repair.

use capstan_core::{keys, CoreConfig, Error, Result, StateBag, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The delta side of a sync call. Carrying the action and its payload
/// together keeps impossible combinations unrepresentable.
#[derive(Clone, Debug)]
pub enum SyncDelta {
    Init(StateBag),
    Sync(StateBag),
    Aggregate(Vec<BranchDelta>),
}

/// One distributed-map child's contribution, ordered by branch index.
#[derive(Clone, Debug)]
pub struct BranchDelta {
    pub branch_index: usize,
    pub result: std::result::Result<StateBag, String>,
}

/// Per-key reducer override, declared on the aggregator node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReducerKind {
    /// Lowest branch index wins (the default for scalars).
    First,
    /// Highest branch index wins.
    Last,
    /// Force sequence concatenation, wrapping scalars.
    Concat,
    /// Numeric sum across branches.
    Sum,
}

/// Birth of a state bag: reserved defaults, then the caller's delta on
/// top. The base must be empty — an init over live state is a bug.
pub fn init_state(base: &StateBag, delta: StateBag, config: &CoreConfig) -> Result<StateBag> {
    if !base.is_empty() {
        return Err(Error::Validation(
            "init requires an empty base state".into(),
        ));
    }

    let mut state = StateBag::new();
    state.insert(keys::SEGMENT_TO_RUN, Value::uint(0));
    state.insert(keys::LOOP_COUNTER, Value::uint(0));
    state.insert(keys::STATE_HISTORY, Value::Seq(Vec::new()));
    state.insert(
        keys::MAX_LOOP_ITERATIONS,
        Value::uint(config.max_loop_iterations as u64),
    );
    state.insert(
        keys::MAX_BRANCH_ITERATIONS,
        Value::uint(config.max_branch_iterations as u64),
    );
    state.insert(keys::DISTRIBUTED_MODE, Value::bool(false));
    state.insert(keys::DISTRIBUTED_STRATEGY, Value::str("map"));
    state.insert(
        keys::MAX_CONCURRENCY,
        Value::uint(config.max_concurrency as u64),
    );

    for (key, value) in delta {
        state.insert(key, value);
    }
    Ok(state)
}

/// Growth: shallow merge — each top-level delta key replaces the base
/// value wholesale. Base is consumed, so unchanged subtrees move into
/// the result without a copy.
pub fn shallow_merge(base: StateBag, delta: StateBag) -> StateBag {
    let mut state = base;
    for (key, value) in delta {
        state.insert(key, value);
    }
    state
}

/// Collaboration: fold branch deltas into one combined delta, then
/// shallow-merge it onto the base. Failed branches surface as
/// `_branch_errors` entries instead of aborting the merge.
pub fn aggregate_merge(
    base: StateBag,
    mut branches: Vec<BranchDelta>,
    reducers: &BTreeMap<String, ReducerKind>,
) -> StateBag {
    branches.sort_by_key(|b| b.branch_index);

    let mut combined = StateBag::new();
    let mut branch_errors: Vec<Value> = Vec::new();

    for branch in branches {
        match branch.result {
            Ok(delta) => {
                for (key, value) in delta {
                    merge_key(&mut combined, &key, value, reducers.get(&key).copied());
                }
            }
            Err(message) => {
                let mut entry = StateBag::new();
                entry.insert("branch_index", Value::uint(branch.branch_index as u64));
                entry.insert("error", Value::str(message));
                branch_errors.push(Value::Map(entry));
            }
        }
    }

    let mut state = base;
    // Seed concat targets with the base's existing sequence, if any.
    for (key, value) in combined {
        match (state.get(&key).cloned(), value) {
            (Some(Value::Seq(mut existing)), Value::Seq(incoming)) => {
                existing.extend(incoming);
                state.insert(key, Value::Seq(existing));
            }
            (_, value) => {
                state.insert(key, value);
            }
        }
    }

    if !branch_errors.is_empty() {
        let mut all = match state.remove(keys::BRANCH_ERRORS) {
            Some(Value::Seq(existing)) => existing,
            _ => Vec::new(),
        };
        all.extend(branch_errors);
        state.insert(keys::BRANCH_ERRORS, Value::Seq(all));
    }

    state
}

fn merge_key(combined: &mut StateBag, key: &str, incoming: Value, reducer: Option<ReducerKind>) {
    let existing = combined.remove(key);
    let merged = match reducer {
        Some(ReducerKind::Last) => incoming,
        Some(ReducerKind::First) => existing.unwrap_or(incoming),
        Some(ReducerKind::Sum) => sum_values(existing, incoming),
        Some(ReducerKind::Concat) => concat_values(existing, incoming),
        None => default_merge(existing, incoming),
    };
    combined.insert(key.to_string(), merged);
}

/// Default semantics per value shape: seqs concatenate, maps deep-merge
/// with later branches overwriting scalar conflicts, scalars keep the
/// first (lowest-index) writer.
fn default_merge(existing: Option<Value>, incoming: Value) -> Value {
    match (existing, incoming) {
        (None, incoming) => incoming,
        (Some(Value::Seq(mut a)), Value::Seq(b)) => {
            a.extend(b);
            Value::Seq(a)
        }
        (Some(Value::Map(a)), Value::Map(b)) => Value::Map(deep_merge_maps(a, b)),
        // Scalar (or shape-mismatch) conflict: lowest branch index wins.
        (Some(existing), _) => existing,
    }
}

fn deep_merge_maps(base: StateBag, overlay: StateBag) -> StateBag {
    let mut merged = base;
    for (key, value) in overlay {
        match (merged.remove(&key), value) {
            (Some(Value::Map(a)), Value::Map(b)) => {
                merged.insert(key, Value::Map(deep_merge_maps(a, b)));
            }
            // Last writer wins on everything else inside nested maps.
            (_, value) => {
                merged.insert(key, value);
            }
        }
    }
    merged
}

fn concat_values(existing: Option<Value>, incoming: Value) -> Value {
    let mut items = match existing {
        Some(Value::Seq(items)) => items,
        Some(other) => vec![other],
        None => Vec::new(),
    };
    match incoming {
        Value::Seq(incoming) => items.extend(incoming),
        other => items.push(other),
    }
    Value::Seq(items)
}

fn sum_values(existing: Option<Value>, incoming: Value) -> Value {
    let a = existing.as_ref().and_then(Value::as_f64_lenient).unwrap_or(0.0);
    let b = incoming.as_f64_lenient().unwrap_or(0.0);
    let total = a + b;
    if total.fract() == 0.0 && total.abs() < i64::MAX as f64 {
        Value::int(total as i64)
    } else {
        Value::Scalar(serde_json::Value::from(total))
    }
}

/// Numeric coercion for the sum reducer.
trait AsF64Lenient {
    fn as_f64_lenient(&self) -> Option<f64>;
}

impl AsF64Lenient for Value {
    fn as_f64_lenient(&self) -> Option<f64> {
        match self {
            Value::Scalar(s) => s.as_f64(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bag(json: serde_json::Value) -> StateBag {
        StateBag::from_json(json)
    }

    #[test]
    fn init_seeds_reserved_defaults() {
        let state = init_state(
            &StateBag::new(),
            bag(serde_json::json!({"k1": "a"})),
            &CoreConfig::default(),
        )
        .unwrap();
        assert_eq!(state.get_u64(keys::SEGMENT_TO_RUN), Some(0));
        assert_eq!(state.get_u64(keys::LOOP_COUNTER), Some(0));
        assert_eq!(state.get_bool(keys::DISTRIBUTED_MODE), Some(false));
        assert_eq!(state.get_str("k1"), Some("a"));
    }

    #[test]
    fn init_rejects_nonempty_base() {
        let mut base = StateBag::new();
        base.insert("live", Value::bool(true));
        assert!(init_state(&base, StateBag::new(), &CoreConfig::default()).is_err());
    }

    #[test]
    fn shallow_merge_replaces_top_level_only() {
        let base = bag(serde_json::json!({"a": {"x": 1, "y": 2}, "b": "keep"}));
        let delta = bag(serde_json::json!({"a": {"x": 9}}));
        let merged = shallow_merge(base, delta);
        // Delta value replaces the whole subtree — shallow, not deep.
        assert!(merged.get_path("a.y").is_none());
        assert_eq!(merged.get_path("a.x").and_then(Value::as_u64), Some(9));
        assert_eq!(merged.get_str("b"), Some("keep"));
    }

    #[test]
    fn aggregate_concats_seqs_in_branch_order() {
        let branches = vec![
            BranchDelta {
                branch_index: 2,
                result: Ok(bag(serde_json::json!({"items": ["c"]}))),
            },
            BranchDelta {
                branch_index: 0,
                result: Ok(bag(serde_json::json!({"items": ["a"]}))),
            },
            BranchDelta {
                branch_index: 1,
                result: Ok(bag(serde_json::json!({"items": ["b"]}))),
            },
        ];
        let merged = aggregate_merge(StateBag::new(), branches, &BTreeMap::new());
        let items: Vec<&str> = merged
            .get("items")
            .and_then(Value::as_seq)
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert_eq!(items, vec!["a", "b", "c"]);
    }

    #[test]
    fn aggregate_scalar_keeps_lowest_branch_index() {
        let branches = vec![
            BranchDelta {
                branch_index: 1,
                result: Ok(bag(serde_json::json!({"winner": "late"}))),
            },
            BranchDelta {
                branch_index: 0,
                result: Ok(bag(serde_json::json!({"winner": "early"}))),
            },
        ];
        let merged = aggregate_merge(StateBag::new(), branches, &BTreeMap::new());
        assert_eq!(merged.get_str("winner"), Some("early"));
    }

    #[test]
    fn aggregate_reducer_overrides_scalar_rule() {
        let mut reducers = BTreeMap::new();
        reducers.insert("winner".to_string(), ReducerKind::Last);
        reducers.insert("count".to_string(), ReducerKind::Sum);
        let branches = vec![
            BranchDelta {
                branch_index: 0,
                result: Ok(bag(serde_json::json!({"winner": "early", "count": 2}))),
            },
            BranchDelta {
                branch_index: 1,
                result: Ok(bag(serde_json::json!({"winner": "late", "count": 3}))),
            },
        ];
        let merged = aggregate_merge(StateBag::new(), branches, &reducers);
        assert_eq!(merged.get_str("winner"), Some("late"));
        assert_eq!(merged.get_u64("count"), Some(5));
    }

    #[test]
    fn aggregate_surfaces_branch_errors_without_aborting() {
        let branches = vec![
            BranchDelta {
                branch_index: 0,
                result: Ok(bag(serde_json::json!({"ok": true}))),
            },
            BranchDelta {
                branch_index: 1,
                result: Err("guardrail violation: clause_2".into()),
            },
        ];
        let merged = aggregate_merge(StateBag::new(), branches, &BTreeMap::new());
        assert_eq!(merged.get_bool("ok"), Some(true));
        let errors = merged.get(keys::BRANCH_ERRORS).and_then(Value::as_seq).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].as_map().unwrap().get_u64("branch_index"),
            Some(1)
        );
    }

    #[test]
    fn aggregate_deep_merges_maps() {
        let branches = vec![
            BranchDelta {
                branch_index: 0,
                result: Ok(bag(serde_json::json!({"report": {"a": 1}}))),
            },
            BranchDelta {
                branch_index: 1,
                result: Ok(bag(serde_json::json!({"report": {"b": 2}}))),
            },
        ];
        let merged = aggregate_merge(StateBag::new(), branches, &BTreeMap::new());
        assert_eq!(merged.get_path("report.a").and_then(Value::as_u64), Some(1));
        assert_eq!(merged.get_path("report.b").and_then(Value::as_u64), Some(2));
    }
}
