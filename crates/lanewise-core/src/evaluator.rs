// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pluggable collaborators: the rule evaluator and field encryption.
//!
//! The engine never interprets lane rules itself. It hands the rule and a
//! `{actor_data, bag}` context to an [`Evaluator`] and treats the answer as
//! JSON truthiness.

use serde_json::{Value, json};

use crate::error::{EngineError, Result};

/// Evaluates rule expressions against a JSON context.
pub trait Evaluator: Send + Sync {
    /// Evaluate `expression` with `context` bound.
    fn evaluate(&self, expression: &Value, context: &Value) -> Result<Value>;
}

/// JSON truthiness: anything except `null` and `false`.
pub fn is_truthy(value: &Value) -> bool {
    !matches!(value, Value::Null | Value::Bool(false))
}

/// Evaluate a lane rule for an actor.
pub(crate) fn lane_allows(
    evaluator: &dyn Evaluator,
    rule: &Value,
    actor_data: &Value,
    bag: &Value,
) -> Result<bool> {
    let context = json!({ "actor_data": actor_data, "bag": bag });
    evaluator.evaluate(rule, &context).map(|v| is_truthy(&v))
}

/// Minimal evaluator understanding boolean literals and claim rules.
///
/// Supported expressions:
///
/// | Expression | Meaning |
/// |------------|---------|
/// | `true` / `false` | constant |
/// | `null` | deny |
/// | `{"claims_any": ["a", "b"]}` | `actor_data.claims` contains any listed claim |
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultEvaluator;

impl Evaluator for DefaultEvaluator {
    fn evaluate(&self, expression: &Value, context: &Value) -> Result<Value> {
        match expression {
            Value::Bool(b) => Ok(Value::Bool(*b)),
            Value::Null => Ok(Value::Bool(false)),
            Value::Object(map) if map.contains_key("claims_any") => {
                let wanted = map["claims_any"].as_array().ok_or_else(|| {
                    EngineError::Evaluation("claims_any expects an array".to_string())
                })?;
                let held = context["actor_data"]["claims"]
                    .as_array()
                    .cloned()
                    .unwrap_or_default();
                Ok(Value::Bool(wanted.iter().any(|claim| held.contains(claim))))
            }
            other => Err(EngineError::Evaluation(format!(
                "unsupported expression: {other}"
            ))),
        }
    }
}

/// Encrypts values before they are persisted.
pub trait Crypto: Send + Sync {
    /// Encrypt one field value.
    fn encrypt(&self, value: &Value) -> Result<Value>;
}

/// Stores values as given.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCrypto;

impl Crypto for NoopCrypto {
    fn encrypt(&self, value: &Value) -> Result<Value> {
        Ok(value.clone())
    }
}

/// Run the listed top-level fields of `data` through `crypto`.
pub(crate) fn encrypt_fields(crypto: &dyn Crypto, data: Value, fields: &Value) -> Result<Value> {
    let (Value::Object(mut map), Some(fields)) = (data.clone(), fields.as_array()) else {
        return Ok(data);
    };
    for field in fields.iter().filter_map(Value::as_str) {
        if let Some(value) = map.get_mut(field) {
            *value = crypto.encrypt(value)?;
        }
    }
    Ok(Value::Object(map))
}
