//! Block Registry: maps a block type tag to a handler; dispatch table, not
//! duck-typed discovery. Missing entries are a hard configuration error.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::context::WorkflowContext;
use crate::error::WorkflowResult;
use crate::model::Block;

/// The deltas a handler reports. An empty `BlockResult` means no effect.
#[derive(Debug, Clone, Default)]
pub struct BlockResult {
    pub state_delta: Map<String, Value>,
    pub cache_delta: Map<String, Value>,
    pub artifacts_delta: Vec<Value>,
    pub event_delta: Map<String, Value>,
}

impl BlockResult {
    pub fn with_state(mut self, key: impl Into<String>, value: Value) -> Self {
        self.state_delta.insert(key.into(), value);
        self
    }
}

/// A block handler: consumes `(block, context)`, returns deltas. May
/// suspend on I/O; must resolve before the interpreter advances.
#[async_trait]
pub trait BlockHandler: Send + Sync {
    async fn execute(&self, block: &Block, ctx: &mut WorkflowContext) -> WorkflowResult<BlockResult>;
}

#[async_trait]
impl<F, Fut> BlockHandler for F
where
    F: Fn(&Block, &mut WorkflowContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = WorkflowResult<BlockResult>> + Send,
{
    async fn execute(&self, block: &Block, ctx: &mut WorkflowContext) -> WorkflowResult<BlockResult> {
        (self)(block, ctx).await
    }
}

/// Dispatch table from block-type tag to handler. Registration is explicit;
/// there is no fallback discovery mechanism.
#[derive(Clone, Default)]
pub struct BlockRegistry {
    handlers: HashMap<String, Arc<dyn BlockHandler>>,
}

impl BlockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, block_type: impl Into<String>, handler: Arc<dyn BlockHandler>) {
        self.handlers.insert(block_type.into(), handler);
    }

    pub fn get(&self, block_type: &str) -> Option<Arc<dyn BlockHandler>> {
        self.handlers.get(block_type).cloned()
    }
}
