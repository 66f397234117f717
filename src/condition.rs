//! Condition Evaluator: resolves operands via the Reference Resolver and
//! applies one of 14 operators; AND-combines a block's guard conditions.

use regex::Regex;
use serde_json::Value;

use crate::context::WorkflowContext;
use crate::error::{WorkflowError, WorkflowResult};
use crate::model::{Condition, ConditionOperator};
use crate::resolver::resolve_value;

/// Returns `true` if `conditions` is empty/`None`; otherwise ANDs every
/// individual evaluation.
pub fn evaluate_all(conditions: &[Condition], ctx: &WorkflowContext) -> WorkflowResult<bool> {
    for condition in conditions {
        if !evaluate(condition, ctx)? {
            return Ok(false);
        }
    }
    Ok(true)
}

pub fn evaluate(condition: &Condition, ctx: &WorkflowContext) -> WorkflowResult<bool> {
    let left = resolve_value(&condition.left, ctx);
    let right = resolve_value(&condition.right, ctx);
    apply(condition.operator, &left, &right)
}

fn apply(op: ConditionOperator, left: &Value, right: &Value) -> WorkflowResult<bool> {
    use ConditionOperator::*;
    Ok(match op {
        Eq => loose_eq(left, right),
        Ne => !loose_eq(left, right),
        Lt => compare(left, right) == Some(std::cmp::Ordering::Less),
        Gt => compare(left, right) == Some(std::cmp::Ordering::Greater),
        Le => matches!(compare(left, right), Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)),
        Ge => matches!(compare(left, right), Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)),
        Contains => contains(left, right),
        StartsWith => match (left.as_str(), right.as_str()) {
            (Some(l), Some(r)) => l.starts_with(r),
            _ => false,
        },
        EndsWith => match (left.as_str(), right.as_str()) {
            (Some(l), Some(r)) => l.ends_with(r),
            _ => false,
        },
        In => in_op(left, right),
        IsEmpty => is_empty(left),
        IsFalsy => is_falsy(left),
        IsNull => left.is_null(),
        Regex => {
            let Some(pattern) = right.as_str() else { return Ok(false) };
            match Regex::new(pattern) {
                Ok(re) => re.is_match(&to_display_string(left)),
                Err(_) => false,
            }
        }
    })
}

/// Loose equality: if either side is null/undefined both must be; otherwise
/// compare via `String(left) === String(right)`.
fn loose_eq(left: &Value, right: &Value) -> bool {
    if left.is_null() || right.is_null() {
        return left.is_null() && right.is_null();
    }
    to_display_string(left) == to_display_string(right)
}

/// Numeric if both operands coerce cleanly (real JSON numbers, or strings
/// that parse as `f64`); otherwise falls back to string comparison.
fn compare(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    let left_num = left.as_f64().or_else(|| left.as_str().and_then(|s| s.parse::<f64>().ok()));
    let right_num = right.as_f64().or_else(|| right.as_str().and_then(|s| s.parse::<f64>().ok()));
    match (left_num, right_num) {
        (Some(l), Some(r)) => l.partial_cmp(&r),
        _ => {
            let l = to_display_string(left);
            let r = to_display_string(right);
            Some(l.cmp(&r))
        }
    }
}

fn contains(left: &Value, right: &Value) -> bool {
    match left {
        Value::String(s) => match right.as_str() {
            Some(needle) => s.contains(needle),
            None => false,
        },
        Value::Array(arr) => arr.iter().any(|v| loose_eq(v, right)),
        // Mapping-type left operands: undefined in spec §9; we define it as
        // key membership rather than silently returning false.
        Value::Object(map) => match right.as_str() {
            Some(key) => map.contains_key(key),
            None => false,
        },
        _ => false,
    }
}

fn in_op(left: &Value, right: &Value) -> bool {
    match right {
        Value::Array(arr) => arr.iter().any(|v| loose_eq(v, left)),
        Value::String(s) => s.split(',').map(|p| p.trim()).any(|p| p == to_display_string(left)),
        _ => false,
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(arr) => arr.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64().map(|f| f == 0.0).unwrap_or(false),
        Value::String(s) => s.is_empty(),
        Value::Array(arr) => arr.is_empty(),
        Value::Object(map) => map.is_empty(),
    }
}

fn to_display_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Reject conditions whose operator is unknown at validation time. Because
/// `ConditionOperator` is a closed enum, any deserialized `Condition` has a
/// valid operator by construction; this exists for symmetry with the
/// "unknown operators fail loudly" rule when conditions arrive as raw JSON.
pub fn validate_operator_name(name: &str) -> WorkflowResult<ConditionOperator> {
    use ConditionOperator::*;
    Ok(match name {
        "==" => Eq,
        "!=" => Ne,
        "<" => Lt,
        ">" => Gt,
        "<=" => Le,
        ">=" => Ge,
        "contains" => Contains,
        "startsWith" => StartsWith,
        "endsWith" => EndsWith,
        "in" => In,
        "isEmpty" => IsEmpty,
        "isFalsy" => IsFalsy,
        "isNull" => IsNull,
        "regex" => Regex,
        other => return Err(WorkflowError::Validation(format!("unknown condition operator: {other}"))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunMeta;
    use serde_json::json;

    fn ctx() -> WorkflowContext {
        WorkflowContext::new(RunMeta::default(), Default::default(), Default::default(), Default::default())
    }

    #[test]
    fn empty_conditions_are_true() {
        assert!(evaluate_all(&[], &ctx()).unwrap());
    }

    #[test]
    fn numeric_comparison() {
        let c = Condition { left: json!(5), operator: ConditionOperator::Gt, right: json!(3) };
        assert!(evaluate(&c, &ctx()).unwrap());
    }

    #[test]
    fn numeric_comparison_on_string_operands() {
        let c = Condition { left: json!("10"), operator: ConditionOperator::Gt, right: json!("9") };
        assert!(evaluate(&c, &ctx()).unwrap(), "\"10\" > \"9\" should compare numerically, not lexically");
    }

    #[test]
    fn is_empty_variants() {
        assert!(is_empty(&Value::Null));
        assert!(is_empty(&json!([])));
        assert!(is_empty(&json!({})));
        assert!(!is_empty(&json!([1])));
    }

    #[test]
    fn regex_compile_failure_is_false_not_error() {
        let c = Condition { left: json!("abc"), operator: ConditionOperator::Regex, right: json!("(") };
        assert!(!evaluate(&c, &ctx()).unwrap());
    }

    #[test]
    fn in_operator_with_comma_string() {
        let c = Condition { left: json!("b"), operator: ConditionOperator::In, right: json!("a, b, c") };
        assert!(evaluate(&c, &ctx()).unwrap());
    }
}
