//! Condition evaluation for if-else cases and loop break conditions.
//!
//! Conditions are evaluated left to right; `and` stops at the first false
//! condition, `or` at the first true one. A selector that does not resolve is
//! an error rather than a silent `false`.

use crate::selector::Selector;
use crate::variable_pool::{PoolError, VariablePool};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// How a group of conditions combines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalOperator {
    #[default]
    And,
    Or,
}

/// Comparison between a resolved variable and a literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOperator {
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "not contains", alias = "not_contains")]
    NotContains,
    #[serde(rename = "start with", alias = "start_with")]
    StartWith,
    #[serde(rename = "end with", alias = "end_with")]
    EndWith,
    #[serde(rename = "is")]
    Is,
    #[serde(rename = "is not", alias = "is_not")]
    IsNot,
    #[serde(rename = "empty")]
    Empty,
    #[serde(rename = "not empty", alias = "not_empty")]
    NotEmpty,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not in", alias = "not_in")]
    NotIn,
    #[serde(rename = "all of", alias = "all_of")]
    AllOf,
    #[serde(rename = "=")]
    Equal,
    #[serde(rename = "≠", alias = "!=")]
    NotEqual,
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = "≥", alias = ">=")]
    GreaterOrEqual,
    #[serde(rename = "≤", alias = "<=")]
    LessOrEqual,
    #[serde(rename = "null")]
    Null,
    #[serde(rename = "not null", alias = "not_null")]
    NotNull,
}

/// A single comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub variable_selector: Selector,
    pub comparison_operator: ComparisonOperator,
    #[serde(default)]
    pub value: JsonValue,
}

impl Condition {
    pub fn new(
        variable_selector: Selector,
        comparison_operator: ComparisonOperator,
        value: JsonValue,
    ) -> Self {
        Self {
            variable_selector,
            comparison_operator,
            value,
        }
    }

    /// Evaluates this condition against the pool.
    pub fn evaluate(&self, pool: &VariablePool) -> Result<bool, PoolError> {
        let actual = pool.get(&self.variable_selector)?;
        Ok(compare(actual, self.comparison_operator, &self.value))
    }
}

/// Evaluates a group of conditions with the given combinator.
///
/// An empty group is false for `or` and true for `and`.
pub fn evaluate_all(
    conditions: &[Condition],
    operator: LogicalOperator,
    pool: &VariablePool,
) -> Result<bool, PoolError> {
    match operator {
        LogicalOperator::And => {
            for condition in conditions {
                if !condition.evaluate(pool)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        LogicalOperator::Or => {
            for condition in conditions {
                if condition.evaluate(pool)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }
}

/// Applies `op` to an already resolved value.
#[must_use]
pub fn compare(actual: &JsonValue, op: ComparisonOperator, expected: &JsonValue) -> bool {
    use ComparisonOperator as Op;

    match op {
        Op::Contains => contains(actual, expected),
        Op::NotContains => !contains(actual, expected),
        Op::StartWith => as_text(actual).starts_with(&as_text(expected)),
        Op::EndWith => as_text(actual).ends_with(&as_text(expected)),
        Op::Is => loosely_equal(actual, expected),
        Op::IsNot => !loosely_equal(actual, expected),
        Op::Empty => is_empty(actual),
        Op::NotEmpty => !is_empty(actual),
        Op::In => member_of(actual, expected),
        Op::NotIn => !member_of(actual, expected),
        Op::AllOf => all_of(actual, expected),
        Op::Equal => numeric(actual, expected).is_some_and(|(a, b)| a == b),
        Op::NotEqual => numeric(actual, expected).is_none_or(|(a, b)| a != b),
        Op::GreaterThan => numeric(actual, expected).is_some_and(|(a, b)| a > b),
        Op::LessThan => numeric(actual, expected).is_some_and(|(a, b)| a < b),
        Op::GreaterOrEqual => numeric(actual, expected).is_some_and(|(a, b)| a >= b),
        Op::LessOrEqual => numeric(actual, expected).is_some_and(|(a, b)| a <= b),
        Op::Null => actual.is_null(),
        Op::NotNull => !actual.is_null(),
    }
}

fn as_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

fn as_number(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn numeric(actual: &JsonValue, expected: &JsonValue) -> Option<(f64, f64)> {
    Some((as_number(actual)?, as_number(expected)?))
}

fn loosely_equal(actual: &JsonValue, expected: &JsonValue) -> bool {
    if actual == expected {
        return true;
    }
    match (actual, expected) {
        (JsonValue::Number(_), JsonValue::String(_)) | (JsonValue::String(_), JsonValue::Number(_)) => {
            numeric(actual, expected).is_some_and(|(a, b)| a == b)
        }
        (JsonValue::Bool(b), JsonValue::String(s)) | (JsonValue::String(s), JsonValue::Bool(b)) => {
            s.eq_ignore_ascii_case(if *b { "true" } else { "false" })
        }
        _ => as_text(actual) == as_text(expected),
    }
}

fn contains(actual: &JsonValue, expected: &JsonValue) -> bool {
    match actual {
        JsonValue::String(s) => s.contains(&as_text(expected)),
        JsonValue::Array(items) => items.iter().any(|item| loosely_equal(item, expected)),
        JsonValue::Object(map) => map.contains_key(&as_text(expected)),
        _ => false,
    }
}

fn is_empty(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::String(s) => s.is_empty(),
        JsonValue::Array(items) => items.is_empty(),
        JsonValue::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn expected_items(expected: &JsonValue) -> Vec<&JsonValue> {
    match expected {
        JsonValue::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

fn member_of(actual: &JsonValue, expected: &JsonValue) -> bool {
    expected_items(expected)
        .into_iter()
        .any(|item| loosely_equal(actual, item))
}

fn all_of(actual: &JsonValue, expected: &JsonValue) -> bool {
    let Some(items) = actual.as_array() else {
        return false;
    };
    expected_items(expected)
        .into_iter()
        .all(|wanted| items.iter().any(|item| loosely_equal(item, wanted)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::PathSegment;
    use serde_json::json;
    use tidewater_core::NodeId;

    fn pool_with(node: &str, field: &str, value: JsonValue) -> VariablePool {
        let mut pool = VariablePool::new();
        pool.put(&NodeId::new(node), vec![PathSegment::Key(field.into())], value)
            .expect("write");
        pool
    }

    fn cond(op: ComparisonOperator, value: JsonValue) -> Condition {
        Condition::new(Selector::field("start", "x"), op, value)
    }

    #[test]
    fn string_operators() {
        let v = json!("error!");
        assert!(compare(&v, ComparisonOperator::Contains, &json!("err")));
        assert!(!compare(&v, ComparisonOperator::NotContains, &json!("err")));
        assert!(compare(&v, ComparisonOperator::StartWith, &json!("erro")));
        assert!(compare(&v, ComparisonOperator::EndWith, &json!("!")));
        assert!(compare(&v, ComparisonOperator::Is, &json!("error!")));
        assert!(compare(&v, ComparisonOperator::IsNot, &json!("ok")));
    }

    #[test]
    fn numeric_operators_coerce_strings() {
        assert!(compare(&json!(3), ComparisonOperator::GreaterOrEqual, &json!(3)));
        assert!(compare(&json!("4"), ComparisonOperator::GreaterThan, &json!(3)));
        assert!(compare(&json!(2.0), ComparisonOperator::Equal, &json!("2")));
        assert!(!compare(&json!("abc"), ComparisonOperator::LessThan, &json!(3)));
        assert!(compare(&json!("abc"), ComparisonOperator::NotEqual, &json!(3)));
    }

    #[test]
    fn membership_and_emptiness() {
        assert!(compare(&json!("b"), ComparisonOperator::In, &json!(["a", "b"])));
        assert!(compare(&json!("c"), ComparisonOperator::NotIn, &json!(["a", "b"])));
        assert!(compare(&json!(["a", "b", "c"]), ComparisonOperator::AllOf, &json!(["a", "c"])));
        assert!(!compare(&json!(["a"]), ComparisonOperator::AllOf, &json!(["a", "z"])));
        assert!(compare(&json!([]), ComparisonOperator::Empty, &JsonValue::Null));
        assert!(compare(&json!({"k": 1}), ComparisonOperator::NotEmpty, &JsonValue::Null));
        assert!(compare(&JsonValue::Null, ComparisonOperator::Null, &JsonValue::Null));
        assert!(compare(&json!(0), ComparisonOperator::NotNull, &JsonValue::Null));
    }

    #[test]
    fn and_requires_all_or_requires_any() {
        let pool = pool_with("start", "x", json!("error!"));
        let hit = cond(ComparisonOperator::Contains, json!("err"));
        let miss = cond(ComparisonOperator::Contains, json!("zzz"));

        let both = [hit.clone(), miss.clone()];
        assert!(!evaluate_all(&both, LogicalOperator::And, &pool).expect("resolves"));
        assert!(evaluate_all(&both, LogicalOperator::Or, &pool).expect("resolves"));
        assert!(evaluate_all(&[], LogicalOperator::And, &pool).expect("vacuous"));
        assert!(!evaluate_all(&[], LogicalOperator::Or, &pool).expect("vacuous"));
    }

    #[test]
    fn or_short_circuits_before_unresolved() {
        let pool = pool_with("start", "x", json!("error!"));
        let hit = cond(ComparisonOperator::Contains, json!("err"));
        let dangling = Condition::new(
            Selector::field("nowhere", "y"),
            ComparisonOperator::Null,
            JsonValue::Null,
        );

        assert!(evaluate_all(&[hit, dangling.clone()], LogicalOperator::Or, &pool).expect("short"));
        assert!(matches!(
            evaluate_all(&[dangling], LogicalOperator::Or, &pool),
            Err(PoolError::Unresolved { .. })
        ));
    }

    #[test]
    fn operators_deserialize_from_workflow_symbols() {
        let c: Condition = serde_json::from_value(json!({
            "variable_selector": ["loop", "counter"],
            "comparison_operator": "≥",
            "value": 3
        }))
        .expect("valid condition");
        assert_eq!(c.comparison_operator, ComparisonOperator::GreaterOrEqual);

        let op: ComparisonOperator = serde_json::from_value(json!("not contains")).expect("valid");
        assert_eq!(op, ComparisonOperator::NotContains);
    }
}
