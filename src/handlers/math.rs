//! `math` handler: deterministic numeric transforms over the context.

use async_trait::async_trait;
use serde_json::Value;

use crate::context::WorkflowContext;
use crate::error::{WorkflowError, WorkflowResult};
use crate::handlers::{bind_value_key, operations_of};
use crate::model::Block;
use crate::registry::{BlockHandler, BlockResult};
use crate::resolver::resolve_value;

pub struct MathHandler;

fn as_numbers(value: &Value) -> WorkflowResult<Vec<f64>> {
    match value {
        Value::Array(arr) => Ok(arr.iter().filter_map(|v| v.as_f64()).collect()),
        Value::Number(n) => Ok(vec![n.as_f64().unwrap_or(0.0)]),
        _ => Err(WorkflowError::Validation("math operation expects a number or array of numbers".to_string())),
    }
}

fn apply_op(op: &Value, ctx: &WorkflowContext) -> WorkflowResult<Value> {
    let kind = op.get("op").and_then(|v| v.as_str()).unwrap_or("add");
    let input = op.get("input").map(|v| resolve_value(v, ctx)).unwrap_or(Value::Null);

    let result = match kind {
        "sum" => as_numbers(&input)?.iter().sum::<f64>(),
        "avg" | "average" => {
            let nums = as_numbers(&input)?;
            if nums.is_empty() { 0.0 } else { nums.iter().sum::<f64>() / nums.len() as f64 }
        }
        "min" => as_numbers(&input)?.into_iter().fold(f64::INFINITY, f64::min),
        "max" => as_numbers(&input)?.into_iter().fold(f64::NEG_INFINITY, f64::max),
        "add" | "subtract" | "multiply" | "divide" => {
            let a = input.as_f64().ok_or_else(|| WorkflowError::Validation("math input must be numeric".to_string()))?;
            let b = op.get("operand").map(|v| resolve_value(v, ctx)).and_then(|v| v.as_f64()).unwrap_or(0.0);
            match kind {
                "add" => a + b,
                "subtract" => a - b,
                "multiply" => a * b,
                "divide" => {
                    if b == 0.0 {
                        return Err(WorkflowError::Validation("division by zero".to_string()));
                    }
                    a / b
                }
                _ => unreachable!(),
            }
        }
        "round" => input.as_f64().unwrap_or(0.0).round(),
        "floor" => input.as_f64().unwrap_or(0.0).floor(),
        "ceil" => input.as_f64().unwrap_or(0.0).ceil(),
        "abs" => input.as_f64().unwrap_or(0.0).abs(),
        other => return Err(WorkflowError::Validation(format!("unknown math operation: {other}"))),
    };

    Ok(serde_json::json!(result))
}

#[async_trait]
impl BlockHandler for MathHandler {
    async fn execute(&self, block: &Block, ctx: &mut WorkflowContext) -> WorkflowResult<BlockResult> {
        let ops = operations_of(block, "math");
        let mut last = Value::Null;
        for op in &ops {
            last = apply_op(op, ctx)?;
        }
        let mut result = BlockResult::default();
        if let Some(bind) = bind_value_key(block, "math") {
            result = result.with_state(bind, last);
        }
        Ok(result)
    }
}
