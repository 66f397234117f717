//! `code` handler: user-supplied JS/TS executed inside the Code Sandbox
//! (spec §4.7), wired to the interpreter like any other handler.

use async_trait::async_trait;
use std::sync::Arc;

use crate::context::WorkflowContext;
use crate::error::{WorkflowError, WorkflowResult};
use crate::model::Block;
use crate::registry::{BlockHandler, BlockResult};
use crate::sandbox::{CodeLanguage, Sandbox};

pub struct CodeHandler {
    sandbox: Arc<Sandbox>,
}

impl CodeHandler {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl BlockHandler for CodeHandler {
    async fn execute(&self, block: &Block, ctx: &mut WorkflowContext) -> WorkflowResult<BlockResult> {
        let source = block
            .logic_str("code_source")
            .ok_or_else(|| WorkflowError::Validation("code_source is required".to_string()))?
            .to_string();

        let language = match block.logic_str("code_language") {
            Some("typescript") | Some("typed_script") => CodeLanguage::TypedScript,
            _ => CodeLanguage::Script,
        };

        let timeout_ms = block.logic.get("code_timeout_ms").and_then(|v| v.as_u64()).unwrap_or(10_000);

        let bind_value = block.logic_str("code_bind_value").map(str::to_string);

        let outcome = self.sandbox.execute(&source, language, timeout_ms, bind_value, ctx).await?;

        let mut result = BlockResult::default();
        result.state_delta = outcome.state_delta;
        for (k, v) in outcome.cache_writes {
            result.cache_delta.insert(k, v);
        }
        if !outcome.console.is_empty() {
            let rendered: Vec<serde_json::Value> = outcome
                .console
                .iter()
                .map(|entry| {
                    serde_json::json!({
                        "level": entry.level,
                        "args": entry.args,
                        "timestampMs": entry.timestamp_ms,
                    })
                })
                .collect();
            result.event_delta.insert("__consoleOutput".to_string(), serde_json::Value::Array(rendered));
        }
        Ok(result)
    }
}
