//! Batch expansion of one execution request into child task plans.
//!
//! A request with `repeat > 1`, or with any non-media input carrying more
//! than one value, becomes a parent task plus one child per
//! `(repeat index, input combination)` pair. Otherwise it is a single task.

use serde_json::Value;

use crate::admission::InputSet;
use crate::workflow::{InputDefs, InputKind};

/// Weight added to a child per repeat index.
pub const REPEAT_WEIGHT_STEP: f64 = 0.1;

/// Upper bound on the repeat weight offset.
pub const REPEAT_WEIGHT_CAP: f64 = 1.0;

/// Base seed when no explicit seed was supplied.
pub const DEFAULT_BASE_SEED: i64 = 1;

/// One task to be created.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildPlan {
    pub input_values: InputSet,
    pub weight: f64,
    pub repeat_index: u32,
}

/// The tasks to persist for one admitted request.
#[derive(Debug, Clone, PartialEq)]
pub enum FanoutPlan {
    Single(ChildPlan),
    Batch {
        /// Resolved inputs before expansion, stored on the parent.
        parent_inputs: InputSet,
        children: Vec<ChildPlan>,
    },
}

impl FanoutPlan {
    pub fn is_batch(&self) -> bool {
        matches!(self, FanoutPlan::Batch { .. })
    }

    /// Number of dispatchable tasks.
    pub fn task_count(&self) -> usize {
        match self {
            FanoutPlan::Single(_) => 1,
            FanoutPlan::Batch { children, .. } => children.len(),
        }
    }
}

/// Weight offset for a child at repeat index `r`.
pub fn repeat_weight_offset(repeat_index: u32) -> f64 {
    (f64::from(repeat_index) * REPEAT_WEIGHT_STEP).min(REPEAT_WEIGHT_CAP)
}

/// True for arrays with more than one element on a non-media input.
///
/// Media inputs hold a list of attachment ids for a single run and never
/// fan out.
pub fn is_multi_value(kind: InputKind, value: &Value) -> bool {
    !kind.is_media() && matches!(value, Value::Array(items) if items.len() > 1)
}

/// Cartesian product of every multi-value input.
///
/// Single-element arrays on non-media inputs collapse to their scalar.
/// Sets are ordered with the last key varying fastest.
pub fn expand_input_sets(defs: &InputDefs, resolved: &InputSet) -> Vec<InputSet> {
    let mut sets = vec![InputSet::new()];

    for (key, value) in resolved {
        let kind = defs.get(key).map(|d| d.kind);
        let choices: Vec<Value> = match (kind, value) {
            (Some(k), Value::Array(items)) if !k.is_media() && !items.is_empty() => items.clone(),
            _ => vec![value.clone()],
        };

        sets = sets
            .into_iter()
            .flat_map(|set| {
                choices.iter().map(move |choice| {
                    let mut next = set.clone();
                    next.insert(key.clone(), choice.clone());
                    next
                })
            })
            .collect();
    }

    sets
}

/// Keys of every declared Seed input, in key order.
pub fn seed_keys(defs: &InputDefs) -> Vec<&str> {
    defs.iter()
        .filter(|(_, d)| d.kind == InputKind::Seed)
        .map(|(k, _)| k.as_str())
        .collect()
}

/// First explicit seed value among the seed inputs, or [`DEFAULT_BASE_SEED`].
pub fn base_seed(seed_keys: &[&str], resolved: &InputSet) -> i64 {
    seed_keys
        .iter()
        .filter_map(|k| resolved.get(*k))
        .find_map(|v| match v {
            Value::Array(items) => items.first().and_then(Value::as_i64),
            other => other.as_i64(),
        })
        .unwrap_or(DEFAULT_BASE_SEED)
}

/// Plan the tasks for a request.
///
/// Repeat is the outer loop and input combinations the inner one. In a
/// batch, child `i` (0-based creation order) gets seed `S + i + 1` on every
/// seed input, where `S` is [`base_seed`].
pub fn plan_children(
    defs: &InputDefs,
    resolved: &InputSet,
    repeat: u32,
    base_weight: f64,
) -> FanoutPlan {
    let repeat = repeat.max(1);
    let is_batch = repeat > 1
        || resolved.iter().any(|(k, v)| {
            defs.get(k)
                .is_some_and(|d| is_multi_value(d.kind, v))
        });

    if !is_batch {
        let input_values = expand_input_sets(defs, resolved)
            .into_iter()
            .next()
            .unwrap_or_default();
        return FanoutPlan::Single(ChildPlan {
            input_values,
            weight: base_weight,
            repeat_index: 0,
        });
    }

    let sets = expand_input_sets(defs, resolved);
    let seeds = seed_keys(defs);
    let base = base_seed(&seeds, resolved);

    let mut children = Vec::with_capacity(sets.len() * repeat as usize);
    for r in 0..repeat {
        for set in &sets {
            let mut input_values = set.clone();
            let seed = base + children.len() as i64 + 1;
            for key in &seeds {
                input_values.insert((*key).to_string(), Value::from(seed));
            }
            children.push(ChildPlan {
                input_values,
                weight: base_weight + repeat_weight_offset(r),
                repeat_index: r,
            });
        }
    }

    FanoutPlan::Batch {
        parent_inputs: resolved.clone(),
        children,
    }
}
