//! `array` handler: deterministic sequence transforms (filter, map, sort, ...).

use async_trait::async_trait;
use serde_json::Value;

use crate::condition::evaluate;
use crate::context::WorkflowContext;
use crate::error::{WorkflowError, WorkflowResult};
use crate::handlers::{bind_value_key, operations_of};
use crate::model::{Block, Condition, ConditionOperator};
use crate::registry::{BlockHandler, BlockResult};
use crate::resolver::resolve_value;

pub struct ArrayHandler;

fn apply_op(op: &Value, ctx: &WorkflowContext, current: &[Value]) -> WorkflowResult<Vec<Value>> {
    let kind = op.get("op").and_then(|v| v.as_str()).unwrap_or("filter");
    Ok(match kind {
        "filter" => {
            let field = op.get("field").and_then(|v| v.as_str());
            let expected = op.get("value").cloned().unwrap_or(Value::Null);
            current
                .iter()
                .filter(|item| {
                    let actual = match field {
                        Some(f) => item.get(f).cloned().unwrap_or(Value::Null),
                        None => (*item).clone(),
                    };
                    let condition = Condition { left: actual, operator: ConditionOperator::Eq, right: expected.clone() };
                    evaluate(&condition, ctx).unwrap_or(false)
                })
                .cloned()
                .collect()
        }
        "map" => {
            let field = op.get("field").and_then(|v| v.as_str());
            match field {
                Some(f) => current.iter().map(|item| item.get(f).cloned().unwrap_or(Value::Null)).collect(),
                None => current.to_vec(),
            }
        }
        "sort" => {
            let field = op.get("field").and_then(|v| v.as_str()).map(str::to_string);
            let descending = op.get("descending").and_then(|v| v.as_bool()).unwrap_or(false);
            let mut sorted = current.to_vec();
            sorted.sort_by(|a, b| {
                let av = field.as_deref().map(|f| a.get(f).cloned().unwrap_or(Value::Null)).unwrap_or_else(|| a.clone());
                let bv = field.as_deref().map(|f| b.get(f).cloned().unwrap_or(Value::Null)).unwrap_or_else(|| b.clone());
                let ord = av.as_f64().zip(bv.as_f64()).map(|(x, y)| x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal))
                    .unwrap_or_else(|| av.to_string().cmp(&bv.to_string()));
                if descending { ord.reverse() } else { ord }
            });
            sorted
        }
        "reverse" => current.iter().rev().cloned().collect(),
        "unique" => {
            let mut seen = Vec::new();
            for item in current {
                if !seen.contains(item) {
                    seen.push(item.clone());
                }
            }
            seen
        }
        "slice" => {
            let start = op.get("start").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
            let end = op.get("end").and_then(|v| v.as_u64()).map(|v| v as usize).unwrap_or(current.len());
            current.get(start..end.min(current.len()).max(start)).unwrap_or(&[]).to_vec()
        }
        other => return Err(WorkflowError::Validation(format!("unknown array operation: {other}"))),
    })
}

#[async_trait]
impl BlockHandler for ArrayHandler {
    async fn execute(&self, block: &Block, ctx: &mut WorkflowContext) -> WorkflowResult<BlockResult> {
        let ops = operations_of(block, "array");
        let input = block.logic.get("array_input").map(|v| resolve_value(v, ctx)).unwrap_or(Value::Array(Vec::new()));
        let mut current: Vec<Value> = input.as_array().cloned().unwrap_or_default();
        for op in &ops {
            current = apply_op(op, ctx, &current)?;
        }
        let mut result = BlockResult::default();
        if let Some(bind) = bind_value_key(block, "array") {
            result = result.with_state(bind, Value::Array(current));
        }
        Ok(result)
    }
}
