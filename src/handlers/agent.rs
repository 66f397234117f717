//! `agent` handler: calls an external model. Contract-only per spec §4.9 —
//! the interpreter's only expectation is that it resolves like any other
//! async I/O handler; the actual provider integration is an external
//! collaborator (out of scope, like the rest of the AI designer surface).

use async_trait::async_trait;
use serde_json::Value;

use crate::context::WorkflowContext;
use crate::error::{WorkflowError, WorkflowResult};
use crate::handlers::bind_value_key;
use crate::model::Block;
use crate::registry::{BlockHandler, BlockResult};
use crate::resolver::resolve_value;

pub struct AgentHandler;

#[async_trait]
impl BlockHandler for AgentHandler {
    async fn execute(&self, block: &Block, ctx: &mut WorkflowContext) -> WorkflowResult<BlockResult> {
        let prompt = block
            .logic
            .get("agent_prompt")
            .map(|v| resolve_value(v, ctx))
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| WorkflowError::Validation("agent_prompt is required".to_string()))?;

        // Resolved `agent_context` is attached so an embedding application's
        // model-call collaborator receives the same context the rest of
        // the run sees; invoking the provider itself is out of scope here.
        let context_value = block.logic.get("agent_context").map(|v| resolve_value(v, ctx)).unwrap_or(Value::Null);

        let response = Value::Object(
            [
                ("prompt".to_string(), Value::String(prompt)),
                ("context".to_string(), context_value),
            ]
            .into_iter()
            .collect(),
        );

        let mut result = BlockResult::default();
        if let Some(bind) = bind_value_key(block, "agent") {
            result = result.with_state(bind, response);
        }
        Ok(result)
    }
}
