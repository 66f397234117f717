//! `sleep` handler: pauses for a bounded duration.

use async_trait::async_trait;
use std::time::Duration;

use crate::context::WorkflowContext;
use crate::error::WorkflowResult;
use crate::model::Block;
use crate::registry::{BlockHandler, BlockResult};

/// Hard ceiling on a single `sleep` block, independent of the run's overall
/// time budget.
const MAX_SLEEP_MS: u64 = 60_000;

pub struct SleepHandler;

#[async_trait]
impl BlockHandler for SleepHandler {
    async fn execute(&self, block: &Block, _ctx: &mut WorkflowContext) -> WorkflowResult<BlockResult> {
        let requested = block.logic.get("sleep_duration_ms").and_then(|v| v.as_u64()).unwrap_or(0);
        let duration_ms = requested.min(MAX_SLEEP_MS);
        tokio::time::sleep(Duration::from_millis(duration_ms)).await;
        Ok(BlockResult::default())
    }
}
