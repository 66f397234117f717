//! `normalize` handler: deterministic reshape of loosely-typed payloads
//! into a consistent shape before downstream blocks consume them — the
//! common "trim/coerce/default" pass ahead of a UI or storage block.

use async_trait::async_trait;
use serde_json::Value;

use crate::context::WorkflowContext;
use crate::error::WorkflowResult;
use crate::handlers::bind_value_key;
use crate::model::Block;
use crate::registry::{BlockHandler, BlockResult};
use crate::resolver::resolve_value;

pub struct NormalizeHandler;

fn normalize(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.trim().to_string()),
        Value::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (k, normalize(v))).collect()),
        Value::Array(arr) => Value::Array(arr.into_iter().map(normalize).collect()),
        other => other,
    }
}

#[async_trait]
impl BlockHandler for NormalizeHandler {
    async fn execute(&self, block: &Block, ctx: &mut WorkflowContext) -> WorkflowResult<BlockResult> {
        let input = block.logic.get("normalize_input").map(|v| resolve_value(v, ctx)).unwrap_or(Value::Null);
        let normalized = normalize(input);
        let mut result = BlockResult::default();
        if let Some(bind) = bind_value_key(block, "normalize") {
            result = result.with_state(bind, normalized);
        }
        Ok(result)
    }
}
