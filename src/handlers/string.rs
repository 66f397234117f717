//! `string` handler: deterministic string transforms.

use async_trait::async_trait;
use serde_json::Value;

use crate::context::WorkflowContext;
use crate::error::{WorkflowError, WorkflowResult};
use crate::handlers::{bind_value_key, operations_of};
use crate::model::Block;
use crate::registry::{BlockHandler, BlockResult};
use crate::resolver::resolve_value;

pub struct StringHandler;

fn apply_op(op: &Value, ctx: &WorkflowContext, current: &str) -> WorkflowResult<String> {
    let kind = op.get("op").and_then(|v| v.as_str()).unwrap_or("concat");
    let input = op
        .get("input")
        .map(|v| resolve_value(v, ctx))
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| current.to_string());

    Ok(match kind {
        "uppercase" => input.to_uppercase(),
        "lowercase" => input.to_lowercase(),
        "trim" => input.trim().to_string(),
        "concat" => {
            let suffix = op.get("value").map(|v| resolve_value(v, ctx)).and_then(|v| v.as_str().map(str::to_string)).unwrap_or_default();
            format!("{input}{suffix}")
        }
        "replace" => {
            let from = op.get("from").and_then(|v| v.as_str()).unwrap_or("");
            let to = op.get("to").and_then(|v| v.as_str()).unwrap_or("");
            input.replace(from, to)
        }
        "split_join" => {
            let sep = op.get("separator").and_then(|v| v.as_str()).unwrap_or(",");
            input.split(sep).collect::<Vec<_>>().join(sep)
        }
        "slice" => {
            let start = op.get("start").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
            let end = op.get("end").and_then(|v| v.as_u64()).map(|v| v as usize).unwrap_or(input.len());
            input.chars().skip(start).take(end.saturating_sub(start)).collect()
        }
        other => return Err(WorkflowError::Validation(format!("unknown string operation: {other}"))),
    })
}

#[async_trait]
impl BlockHandler for StringHandler {
    async fn execute(&self, block: &Block, ctx: &mut WorkflowContext) -> WorkflowResult<BlockResult> {
        let ops = operations_of(block, "string");
        let mut current = resolve_value(block.logic.get("string_input").unwrap_or(&Value::Null), ctx)
            .as_str()
            .unwrap_or("")
            .to_string();
        for op in &ops {
            current = apply_op(op, ctx, &current)?;
        }
        let mut result = BlockResult::default();
        if let Some(bind) = bind_value_key(block, "string") {
            result = result.with_state(bind, Value::String(current));
        }
        Ok(result)
    }
}
