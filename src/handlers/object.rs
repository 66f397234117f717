//! `object` handler: deterministic mapping transforms (merge, pick, omit, set).

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::context::WorkflowContext;
use crate::error::{WorkflowError, WorkflowResult};
use crate::handlers::{bind_value_key, operations_of};
use crate::model::Block;
use crate::registry::{BlockHandler, BlockResult};
use crate::resolver::resolve_value;

pub struct ObjectHandler;

fn apply_op(op: &Value, ctx: &WorkflowContext, current: &Map<String, Value>) -> WorkflowResult<Map<String, Value>> {
    let kind = op.get("op").and_then(|v| v.as_str()).unwrap_or("merge");
    Ok(match kind {
        "merge" => {
            let mut merged = current.clone();
            if let Some(with) = op.get("with").map(|v| resolve_value(v, ctx)).and_then(|v| v.as_object().cloned()) {
                for (k, v) in with {
                    merged.insert(k, v);
                }
            }
            merged
        }
        "set" => {
            let mut updated = current.clone();
            if let Some(key) = op.get("key").and_then(|v| v.as_str()) {
                let value = op.get("value").map(|v| resolve_value(v, ctx)).unwrap_or(Value::Null);
                updated.insert(key.to_string(), value);
            }
            updated
        }
        "pick" => {
            let keys: Vec<String> = op
                .get("keys")
                .and_then(|v| v.as_array())
                .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .unwrap_or_default();
            current.iter().filter(|(k, _)| keys.contains(k)).map(|(k, v)| (k.clone(), v.clone())).collect()
        }
        "omit" => {
            let keys: Vec<String> = op
                .get("keys")
                .and_then(|v| v.as_array())
                .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .unwrap_or_default();
            current.iter().filter(|(k, _)| !keys.contains(k)).map(|(k, v)| (k.clone(), v.clone())).collect()
        }
        other => return Err(WorkflowError::Validation(format!("unknown object operation: {other}"))),
    })
}

#[async_trait]
impl BlockHandler for ObjectHandler {
    async fn execute(&self, block: &Block, ctx: &mut WorkflowContext) -> WorkflowResult<BlockResult> {
        let ops = operations_of(block, "object");
        let input = block.logic.get("object_input").map(|v| resolve_value(v, ctx)).unwrap_or(Value::Object(Map::new()));
        let mut current: Map<String, Value> = input.as_object().cloned().unwrap_or_default();
        for op in &ops {
            current = apply_op(op, ctx, &current)?;
        }
        let mut result = BlockResult::default();
        if let Some(bind) = bind_value_key(block, "object") {
            result = result.with_state(bind, Value::Object(current));
        }
        Ok(result)
    }
}
