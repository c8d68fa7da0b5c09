//! Admission and pricing.
//!
//! Turns raw caller input into a validated input set, prices the request,
//! computes its queue weight and decides which ledger (if any) pays for it.
//! Everything here is synchronous and side-effect free; the worker crate
//! wires it to the store.

use std::collections::BTreeMap;

use chrono::{DateTime, Timelike, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;
use crate::status::{Role, TriggerKind};
use crate::types::DbId;
use crate::workflow::{InputDefs, InputKind, WorkflowInput};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// A ledger balance of `-1` means unlimited.
pub const UNLIMITED_BALANCE: f64 = -1.0;

/// Upper bound (inclusive) for generated seeds.
pub const MAX_GENERATED_SEED: i64 = 1 << 50;

/// Seed value that asks for a freshly generated seed.
pub const RANDOM_SEED: i64 = -1;

/// Width of the time-bias window in milliseconds (24 hours).
pub const TIME_BIAS_WINDOW_MS: i64 = 24 * 60 * 60 * 1000;

/// Resolved inputs keyed by workflow input key.
pub type InputSet = BTreeMap<String, Value>;

// ---------------------------------------------------------------------------
// Requester and ledgers
// ---------------------------------------------------------------------------

/// Who is asking. Authentication happens upstream; this is only identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requester {
    pub user_id: Option<DbId>,
    pub token_id: Option<DbId>,
}

impl Requester {
    pub fn user(user_id: DbId) -> Self {
        Self {
            user_id: Some(user_id),
            token_id: None,
        }
    }

    pub fn token(token_id: DbId) -> Self {
        Self {
            user_id: None,
            token_id: Some(token_id),
        }
    }

    pub fn system() -> Self {
        Self::default()
    }

    pub fn trigger_kind(&self) -> TriggerKind {
        if self.token_id.is_some() {
            TriggerKind::Token
        } else if self.user_id.is_some() {
            TriggerKind::User
        } else {
            TriggerKind::System
        }
    }
}

/// Which balance row pays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum LedgerRef {
    Account(DbId),
    Token(DbId),
}

impl LedgerRef {
    /// Bus key for balance-changed messages.
    pub fn bus_key(&self) -> String {
        match self {
            LedgerRef::Account(id) => format!("account:{id}"),
            LedgerRef::Token(id) => format!("token:{id}"),
        }
    }
}

/// Balance and priority offset of one ledger row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LedgerView {
    pub ledger: LedgerRef,
    pub balance: f64,
    pub weight_offset: f64,
}

/// A debit to apply in the task-creation transaction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Charge {
    pub ledger: LedgerRef,
    pub amount: f64,
}

/// Only the exact sentinel is unlimited; other negative balances are
/// simply too low.
pub fn is_unlimited(balance: f64) -> bool {
    balance == UNLIMITED_BALANCE
}

/// Reject when a limited balance cannot cover `cost`.
pub fn check_balance(balance: f64, cost: f64) -> Result<(), CoreError> {
    if !is_unlimited(balance) && balance < cost {
        return Err(CoreError::InsufficientBalance {
            required: cost,
            available: balance,
        });
    }
    Ok(())
}

/// Decide who pays for a request of `cost`.
///
/// - Admins are neither checked nor debited.
/// - A token-scoped request pays from the token unless the token is
///   unlimited, in which case the owning account pays.
/// - An unlimited effective ledger passes and is not debited.
///
/// Returns `Ok(None)` when nothing is debited.
pub fn plan_charge(
    role: Option<Role>,
    account: Option<&LedgerView>,
    token: Option<&LedgerView>,
    cost: f64,
) -> Result<Option<Charge>, CoreError> {
    if role == Some(Role::Admin) {
        return Ok(None);
    }

    let effective = match token {
        Some(t) if !is_unlimited(t.balance) => Some(t),
        _ => account,
    };

    let Some(view) = effective else {
        return Ok(None);
    };

    check_balance(view.balance, cost)?;

    if is_unlimited(view.balance) || cost <= 0.0 {
        return Ok(None);
    }
    Ok(Some(Charge {
        ledger: view.ledger,
        amount: cost,
    }))
}

/// Priority offset of the requester. Tokens carry their own offset.
pub fn requester_weight_offset(account: Option<&LedgerView>, token: Option<&LedgerView>) -> f64 {
    token
        .or(account)
        .map(|v| v.weight_offset)
        .unwrap_or(0.0)
}

// ---------------------------------------------------------------------------
// Weight
// ---------------------------------------------------------------------------

/// Time-of-day bias in `[0, 2)`.
pub fn time_bias(now: DateTime<Utc>) -> f64 {
    let ms_of_day = i64::from(now.num_seconds_from_midnight()) * 1000
        + i64::from(now.nanosecond() / 1_000_000).min(999);
    let ms = ms_of_day.rem_euclid(TIME_BIAS_WINDOW_MS);
    2.0 * ms as f64 / TIME_BIAS_WINDOW_MS as f64
}

/// Queue weight of a task. Lower runs first.
pub fn compute_weight(time_bias: f64, base_weight: f64, weight_offset: f64) -> f64 {
    time_bias + base_weight + weight_offset
}

// ---------------------------------------------------------------------------
// Input resolution
// ---------------------------------------------------------------------------

/// Validate and normalise raw caller input against the workflow's inputs.
///
/// Keys absent from `defs` are dropped. Media inputs are normalised to a
/// non-empty list of attachment ids; `-1` seeds are replaced with random
/// seeds drawn from `rng`.
pub fn resolve_inputs<R: Rng>(
    defs: &InputDefs,
    raw: &Map<String, Value>,
    rng: &mut R,
) -> Result<InputSet, CoreError> {
    let mut resolved = InputSet::new();

    for (key, def) in defs {
        let value = match raw.get(key).filter(|v| !v.is_null()) {
            Some(v) => v.clone(),
            None => match &def.default {
                Some(d) if !d.is_null() => d.clone(),
                _ if def.kind.is_media() => {
                    return Err(CoreError::Validation(format!(
                        "Input '{key}' requires at least one attachment"
                    )));
                }
                _ => continue,
            },
        };

        let value = resolve_value(key, def, value, rng)?;
        resolved.insert(key.clone(), value);
    }

    Ok(resolved)
}

fn resolve_value<R: Rng>(
    key: &str,
    def: &WorkflowInput,
    value: Value,
    rng: &mut R,
) -> Result<Value, CoreError> {
    match def.kind {
        InputKind::Number | InputKind::Seed => map_elements(value, |v| resolve_number(key, def, v, rng)),
        InputKind::Image | InputKind::Video | InputKind::File => resolve_media(key, value),
        InputKind::Selection => map_elements(value, |v| resolve_selection(key, def, v)),
        InputKind::String | InputKind::Prefixer => map_elements(value, |v| match v {
            Value::String(_) => Ok(v),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            other => Err(type_error(key, "a string", &other)),
        }),
        InputKind::Boolean => map_elements(value, |v| match v {
            Value::Bool(_) => Ok(v),
            other => Err(type_error(key, "a boolean", &other)),
        }),
    }
}

/// Apply `f` to a scalar, or to every element of an array.
fn map_elements<F>(value: Value, mut f: F) -> Result<Value, CoreError>
where
    F: FnMut(Value) -> Result<Value, CoreError>,
{
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(&mut f)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        scalar => f(scalar),
    }
}

fn resolve_number<R: Rng>(
    key: &str,
    def: &WorkflowInput,
    value: Value,
    rng: &mut R,
) -> Result<Value, CoreError> {
    let n = value
        .as_f64()
        .ok_or_else(|| type_error(key, "a number", &value))?;

    if def.kind == InputKind::Seed && value.as_i64() == Some(RANDOM_SEED) {
        return Ok(Value::from(rng.random_range(1..=MAX_GENERATED_SEED)));
    }

    if let Some(min) = def.min {
        if n < min {
            return Err(CoreError::Validation(format!(
                "Input '{key}' value {n} is below minimum {min}"
            )));
        }
    }
    if let Some(max) = def.max {
        if n > max {
            return Err(CoreError::Validation(format!(
                "Input '{key}' value {n} is above maximum {max}"
            )));
        }
    }
    Ok(value)
}

fn resolve_selection(key: &str, def: &WorkflowInput, value: Value) -> Result<Value, CoreError> {
    let Value::String(s) = &value else {
        return Err(type_error(key, "a string", &value));
    };
    if !def.choices.is_empty() && !def.choices.iter().any(|c| c == s) {
        return Err(CoreError::Validation(format!(
            "Input '{key}' value '{s}' is not one of: {}",
            def.choices.join(", ")
        )));
    }
    Ok(value)
}

fn resolve_media(key: &str, value: Value) -> Result<Value, CoreError> {
    let ids = match value {
        Value::Array(items) => items
            .iter()
            .map(|v| attachment_id(key, v))
            .collect::<Result<Vec<_>, _>>()?,
        scalar => vec![attachment_id(key, &scalar)?],
    };
    if ids.is_empty() {
        return Err(CoreError::Validation(format!(
            "Input '{key}' requires at least one attachment"
        )));
    }
    Ok(Value::Array(ids.into_iter().map(Value::from).collect()))
}

fn attachment_id(key: &str, value: &Value) -> Result<DbId, CoreError> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|id| *id > 0)
    .ok_or_else(|| type_error(key, "an attachment id", value))
}

fn type_error(key: &str, expected: &str, got: &Value) -> CoreError {
    CoreError::Validation(format!("Input '{key}' must be {expected}, got {got}"))
}

// ---------------------------------------------------------------------------
// Pricing
// ---------------------------------------------------------------------------

/// Price of one expanded input set: `base + sum(cost_per_unit x value)`.
pub fn price_input_set(base_cost: f64, defs: &InputDefs, set: &InputSet) -> f64 {
    let per_unit: f64 = defs
        .iter()
        .filter_map(|(key, def)| {
            let cpu = def.cost_per_unit?;
            let value = set.get(key)?.as_f64()?;
            Some(cpu * value)
        })
        .sum();
    base_cost + per_unit
}

/// Total price across every expanded input set, times `repeat`.
pub fn compute_cost(base_cost: f64, defs: &InputDefs, sets: &[InputSet], repeat: u32) -> f64 {
    let per_run: f64 = sets
        .iter()
        .map(|set| price_input_set(base_cost, defs, set))
        .sum();
    per_run * f64::from(repeat)
}
