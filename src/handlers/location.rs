//! `location` handler: platform-specific (device geolocation). Contract-only
//! per spec §4.9 — this implementation resolves the block's configured
//! coordinates (or an injected `$event` location payload) since the actual
//! device/OS geolocation API is an external collaborator.

use async_trait::async_trait;
use serde_json::Value;

use crate::context::WorkflowContext;
use crate::error::{WorkflowError, WorkflowResult};
use crate::handlers::bind_value_key;
use crate::model::Block;
use crate::registry::{BlockHandler, BlockResult};
use crate::resolver::resolve_value;

pub struct LocationHandler;

#[async_trait]
impl BlockHandler for LocationHandler {
    async fn execute(&self, block: &Block, ctx: &mut WorkflowContext) -> WorkflowResult<BlockResult> {
        let source = block.logic.get("location_source").map(|v| resolve_value(v, ctx)).unwrap_or(Value::String("$event.location".to_string()));

        let location = match &source {
            Value::String(expr) if expr.starts_with('$') => crate::resolver::resolve(expr, ctx).unwrap_or(Value::Null),
            other => other.clone(),
        };

        if location.is_null() {
            return Err(WorkflowError::Validation("no location available".to_string()));
        }

        let mut result = BlockResult::default();
        if let Some(bind) = bind_value_key(block, "location") {
            result = result.with_state(bind, location);
        }
        Ok(result)
    }
}
